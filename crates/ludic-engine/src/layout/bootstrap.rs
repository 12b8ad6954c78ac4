//! Bootstrap record tables
//!
//! One table of [`RecordDef`]s per ABI. Everything ABI-specific about the
//! host's records lives here.

use std::mem::offset_of;

use tracing::debug;

use crate::config::{BuildConfig, HostAbi, LayoutFeature, PointerWidth};
use crate::control::ControlFlowFrame;

use super::record::{ArrayLen, RecordDef, Slot};
use super::{NativeType, TypeLayoutTable};

/// Version of the bootstrap table format
pub const BOOTSTRAP_VERSION: u32 = 1;

use LayoutFeature as F;
use NativeType::*;

const BASIC: &[Slot] = &[Slot::Field("flags", ULong), Slot::Field("klass", Value)];
const BASIC_SLOT: Slot = Slot::Embed("basic", BASIC);

const CAPA_OR_SHARED: &[Slot] = &[Slot::Field("capa", Long), Slot::Field("shared", Value)];

const FRAME_SCOPE_RECORDS: &[RecordDef] = &[
    RecordDef { name: "RBasic", requires: None, slots: BASIC },
    RecordDef {
        name: "RObject",
        requires: None,
        slots: &[BASIC_SLOT, Slot::When(F::ObjectIvTable, &Slot::Field("iv_tbl", Pointer))],
    },
    RecordDef {
        name: "RClass",
        requires: None,
        slots: &[
            BASIC_SLOT,
            Slot::When(F::ClassIvTable, &Slot::Field("iv_tbl", Pointer)),
            Slot::Field("m_tbl", Pointer),
            Slot::When(F::ClassSuper, &Slot::Field("super", Value)),
        ],
    },
    RecordDef {
        name: "RFloat",
        requires: None,
        slots: &[BASIC_SLOT, Slot::Field("value", Float64)],
    },
    RecordDef {
        name: "RString",
        requires: None,
        slots: &[
            BASIC_SLOT,
            Slot::Field("len", Long),
            Slot::Field("ptr", Pointer),
            Slot::Union("aux", CAPA_OR_SHARED),
        ],
    },
    RecordDef {
        name: "RArray",
        requires: None,
        slots: &[
            BASIC_SLOT,
            Slot::Field("len", Long),
            Slot::Union("aux", CAPA_OR_SHARED),
            Slot::Field("ptr", Pointer),
        ],
    },
    RecordDef {
        name: "RRegexp",
        requires: None,
        slots: &[
            BASIC_SLOT,
            Slot::Field("ptr", Pointer),
            Slot::When(F::RegexpLen, &Slot::Field("len", Long)),
            Slot::When(F::RegexpSource, &Slot::Field("str", Pointer)),
        ],
    },
    RecordDef {
        name: "RHash",
        requires: None,
        slots: &[
            BASIC_SLOT,
            Slot::When(F::HashTable, &Slot::Field("tbl", Pointer)),
            Slot::Field("iter_lev", Int32),
            Slot::Field("ifnone", Value),
        ],
    },
    RecordDef { name: "RFile", requires: None, slots: &[BASIC_SLOT, Slot::Field("fptr", Pointer)] },
    RecordDef {
        name: "RData",
        requires: None,
        slots: &[
            BASIC_SLOT,
            Slot::Field("dmark", Pointer),
            Slot::Field("dfree", Pointer),
            Slot::Field("data", Pointer),
        ],
    },
    RecordDef {
        name: "FRAME",
        requires: Some(F::FrameRecord),
        slots: &[
            Slot::Field("self", Value),
            Slot::Field("argc", Int32),
            Slot::Field("last_func", ULong),
            Slot::Field("orig_func", ULong),
            Slot::Field("last_class", Value),
            Slot::Field("prev", Pointer),
            Slot::Field("tmp", Pointer),
            Slot::Field("node", Pointer),
            Slot::Field("iter", Int32),
            Slot::Field("flags", Int32),
            Slot::Field("uniq", ULong),
        ],
    },
    RecordDef {
        name: "SCOPE",
        requires: Some(F::ScopeRecord),
        slots: &[
            BASIC_SLOT,
            Slot::Field("local_tbl", Pointer),
            Slot::Field("local_vars", Pointer),
            Slot::Field("flags", Int32),
        ],
    },
];

const EMBED_VALUES: Slot = Slot::Array("ary", Value, ArrayLen::Fixed(3));

const CALL_FRAME_RECORDS: &[RecordDef] = &[
    RecordDef { name: "RBasic", requires: None, slots: BASIC },
    RecordDef {
        name: "RObject",
        requires: None,
        slots: &[
            BASIC_SLOT,
            Slot::Union(
                "as",
                &[
                    Slot::Embed(
                        "heap",
                        &[
                            Slot::Field("numiv", Long),
                            Slot::Field("ivptr", Pointer),
                            Slot::Field("iv_index_tbl", Pointer),
                        ],
                    ),
                    EMBED_VALUES,
                ],
            ),
        ],
    },
    RecordDef {
        name: "RClass",
        requires: None,
        slots: &[
            BASIC_SLOT,
            Slot::Field("ptr", Pointer),
            Slot::Field("m_tbl", Pointer),
            Slot::Field("iv_index_tbl", Pointer),
        ],
    },
    RecordDef {
        name: "RFloat",
        requires: None,
        slots: &[BASIC_SLOT, Slot::Field("float_value", Float64)],
    },
    RecordDef {
        name: "RString",
        requires: None,
        slots: &[
            BASIC_SLOT,
            Slot::Union(
                "as",
                &[
                    Slot::Embed(
                        "heap",
                        &[
                            Slot::Field("len", Long),
                            Slot::Field("ptr", Pointer),
                            Slot::Union("aux", CAPA_OR_SHARED),
                        ],
                    ),
                    Slot::Array("ary", UInt8, ArrayLen::Words(3)),
                ],
            ),
        ],
    },
    RecordDef {
        name: "RArray",
        requires: None,
        slots: &[
            BASIC_SLOT,
            Slot::Union(
                "as",
                &[
                    Slot::Embed(
                        "heap",
                        &[
                            Slot::Field("len", Long),
                            Slot::Union("aux", CAPA_OR_SHARED),
                            Slot::Field("ptr", Pointer),
                        ],
                    ),
                    EMBED_VALUES,
                ],
            ),
        ],
    },
    RecordDef {
        name: "RRegexp",
        requires: None,
        slots: &[
            BASIC_SLOT,
            Slot::Field("ptr", Pointer),
            Slot::Field("src", Value),
            Slot::Field("usecnt", ULong),
        ],
    },
    RecordDef {
        name: "RHash",
        requires: None,
        slots: &[
            BASIC_SLOT,
            Slot::Field("ntbl", Pointer),
            Slot::Field("iter_lev", Int32),
            Slot::Field("ifnone", Value),
        ],
    },
    RecordDef { name: "RFile", requires: None, slots: &[BASIC_SLOT, Slot::Field("fptr", Pointer)] },
    RecordDef {
        name: "RData",
        requires: None,
        slots: &[
            BASIC_SLOT,
            Slot::Field("dmark", Pointer),
            Slot::Field("dfree", Pointer),
            Slot::Field("data", Pointer),
        ],
    },
];

/// Record table of an ABI
pub fn records_for(abi: HostAbi) -> &'static [RecordDef] {
    match abi {
        HostAbi::FrameScope => FRAME_SCOPE_RECORDS,
        HostAbi::CallFrame => CALL_FRAME_RECORDS,
    }
}

/// Name of the bridge's own frame record
pub const CONTROL_FRAME: &str = "ControlFrame";

fn register_control_frame(table: &mut TypeLayoutTable) {
    let members = [
        ("tag", offset_of!(ControlFlowFrame, tag), UInt64),
        ("retval", offset_of!(ControlFlowFrame, retval), UInt64),
        ("prev", offset_of!(ControlFlowFrame, prev), Pointer),
        ("state", offset_of!(ControlFlowFrame, state), UInt32),
        ("exit_code", offset_of!(ControlFlowFrame, exit_code), UInt32),
        ("armed", offset_of!(ControlFlowFrame, armed), UInt32),
    ];
    for (field, offset, ty) in members {
        table.register(CONTROL_FRAME, field, offset as u32, ty);
    }
    table.register_size(CONTROL_FRAME, std::mem::size_of::<ControlFlowFrame>() as u32);
}

/// Build the layout table for a host build
pub fn bootstrap_layouts(config: &BuildConfig) -> TypeLayoutTable {
    let mut table = TypeLayoutTable::new();
    let mut skipped = Vec::new();

    for def in records_for(config.abi) {
        match def.compute(config) {
            Some(layout) => {
                for (field, d) in &layout.fields {
                    table.register(layout.name, field, d.offset, d.native_type);
                }
                table.register_size(layout.name, layout.size);
            }
            None => skipped.push(def.name),
        }
    }

    // The frame record is in-process memory; it only exists at the host's width.
    if config.pointer_width == PointerWidth::host() {
        register_control_frame(&mut table);
    }

    debug!(
        version = BOOTSTRAP_VERSION,
        abi = %config.abi,
        width = config.pointer_width.bits(),
        members = table.len(),
        ?skipped,
        "layout bootstrap"
    );
    table
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(abi: HostAbi, width: PointerWidth) -> TypeLayoutTable {
        bootstrap_layouts(&BuildConfig::for_abi(abi).with_pointer_width(width))
    }

    #[test]
    fn test_frame_scope_array_offsets() {
        let t64 = table(HostAbi::FrameScope, PointerWidth::W64);
        assert_eq!(t64.offset_of("RArray", "len").unwrap(), 16);
        assert_eq!(t64.offset_of("RArray", "aux.capa").unwrap(), 24);
        assert_eq!(t64.offset_of("RArray", "aux.shared").unwrap(), 24);
        assert_eq!(t64.offset_of("RArray", "ptr").unwrap(), 32);

        let t32 = table(HostAbi::FrameScope, PointerWidth::W32);
        assert_eq!(t32.offset_of("RArray", "len").unwrap(), 8);
        assert_eq!(t32.offset_of("RArray", "aux.capa").unwrap(), 12);
        assert_eq!(t32.offset_of("RArray", "ptr").unwrap(), 16);
        assert_eq!(t32.size_of("RArray"), Some(20));
    }

    #[test]
    fn test_call_frame_embedded_array() {
        let t = table(HostAbi::CallFrame, PointerWidth::W64);
        assert_eq!(t.offset_of("RArray", "as.heap.len").unwrap(), 16);
        assert_eq!(t.offset_of("RArray", "as.heap.aux.capa").unwrap(), 24);
        assert_eq!(t.offset_of("RArray", "as.heap.ptr").unwrap(), 32);
        assert_eq!(t.offset_of("RArray", "as.ary").unwrap(), 16);
        assert_eq!(t.size_of("RArray"), Some(40));
        assert!(!t.has("RArray", "len"));
        assert_eq!(t.lookup("RString", "as.ary").unwrap().native_type, UInt8);
    }

    #[test]
    fn test_basic_is_shared_prefix() {
        let t = table(HostAbi::FrameScope, PointerWidth::W64);
        assert_eq!(t.offset_of("RBasic", "flags").unwrap(), 0);
        assert_eq!(t.offset_of("RBasic", "klass").unwrap(), 8);
        assert_eq!(t.offset_of("RString", "basic.klass").unwrap(), 8);
        assert_eq!(t.offset_of("RFloat", "value").unwrap(), 16);
    }

    #[test]
    fn test_optional_members() {
        let mut config = BuildConfig::for_abi(HostAbi::FrameScope);
        assert!(bootstrap_layouts(&config).has("RClass", "super"));
        assert!(bootstrap_layouts(&config).has("FRAME", "node"));

        config.features.remove(&LayoutFeature::ClassSuper);
        config.features.remove(&LayoutFeature::FrameRecord);
        let t = bootstrap_layouts(&config);
        assert!(!t.has("RClass", "super"));
        assert!(t.has("RClass", "m_tbl"));
        assert!(matches!(
            t.lookup("FRAME", "node"),
            Err(crate::error::BridgeError::UnknownType { .. })
        ));
    }

    #[test]
    fn test_control_frame_registered_at_host_width() {
        let t = table(HostAbi::CallFrame, PointerWidth::host());
        assert_eq!(
            t.offset_of(CONTROL_FRAME, "retval").unwrap() as usize,
            offset_of!(ControlFlowFrame, retval)
        );
        assert_eq!(t.lookup(CONTROL_FRAME, "prev").unwrap().native_type, Pointer);
    }
}

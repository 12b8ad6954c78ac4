//! Constants surface
//!
//! The numeric contract generated code relies on: special values, type tags,
//! exit codes and the few flag words the translator tests directly. Type tag
//! codes differ between ABIs; everything else is shared.

use std::fmt;

use serde::Serialize;

use crate::config::HostAbi;
use crate::control::{ExitKind, TAG_MASK};

/// A host value word
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[repr(transparent)]
pub struct HostValue(pub u64);

impl HostValue {
    /// `false`
    pub const FALSE: HostValue = HostValue(0);
    /// `true`
    pub const TRUE: HostValue = HostValue(2);
    /// `nil`
    pub const NIL: HostValue = HostValue(4);
    /// The "no value" marker
    pub const UNDEF: HostValue = HostValue(6);

    /// Raw bits
    pub fn bits(self) -> u64 {
        self.0
    }

    /// Tag a small integer
    pub fn from_fixnum(n: i64) -> HostValue {
        HostValue(((n << 1) | 1) as u64)
    }

    /// Whether the word is a tagged small integer
    pub fn is_fixnum(self) -> bool {
        self.0 & 1 == 1
    }

    /// Untag a small integer
    pub fn fixnum(self) -> Option<i64> {
        self.is_fixnum().then(|| (self.0 as i64) >> 1)
    }

    /// Host truthiness: everything except `false` and `nil`
    pub fn truthy(self) -> bool {
        self.0 & !HostValue::NIL.0 != 0
    }

    /// Host boolean for a Rust one
    pub fn from_bool(b: bool) -> HostValue {
        if b {
            HostValue::TRUE
        } else {
            HostValue::FALSE
        }
    }
}

impl fmt::Display for HostValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            HostValue::FALSE => f.write_str("false"),
            HostValue::TRUE => f.write_str("true"),
            HostValue::NIL => f.write_str("nil"),
            HostValue::UNDEF => f.write_str("undef"),
            v => match v.fixnum() {
                Some(n) => write!(f, "{n}"),
                None => write!(f, "<{:#x}>", v.0),
            },
        }
    }
}

/// Builtin type tags stored in the low bits of `RBasic.flags`
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum TypeTag {
    None,
    Nil,
    Object,
    Class,
    IClass,
    Module,
    Float,
    String,
    Regexp,
    Array,
    Fixnum,
    Hash,
    Struct,
    Bignum,
    File,
    True,
    False,
    Data,
    Match,
    Symbol,
    Undef,
}

impl TypeTag {
    /// Every tag
    pub const ALL: [TypeTag; 21] = [
        TypeTag::None,
        TypeTag::Nil,
        TypeTag::Object,
        TypeTag::Class,
        TypeTag::IClass,
        TypeTag::Module,
        TypeTag::Float,
        TypeTag::String,
        TypeTag::Regexp,
        TypeTag::Array,
        TypeTag::Fixnum,
        TypeTag::Hash,
        TypeTag::Struct,
        TypeTag::Bignum,
        TypeTag::File,
        TypeTag::True,
        TypeTag::False,
        TypeTag::Data,
        TypeTag::Match,
        TypeTag::Symbol,
        TypeTag::Undef,
    ];

    /// Numeric code under an ABI
    pub fn code(self, abi: HostAbi) -> u32 {
        match abi {
            HostAbi::FrameScope => match self {
                TypeTag::None => 0x00,
                TypeTag::Nil => 0x01,
                TypeTag::Object => 0x02,
                TypeTag::Class => 0x03,
                TypeTag::IClass => 0x04,
                TypeTag::Module => 0x05,
                TypeTag::Float => 0x06,
                TypeTag::String => 0x07,
                TypeTag::Regexp => 0x08,
                TypeTag::Array => 0x09,
                TypeTag::Fixnum => 0x0a,
                TypeTag::Hash => 0x0b,
                TypeTag::Struct => 0x0c,
                TypeTag::Bignum => 0x0d,
                TypeTag::File => 0x0e,
                TypeTag::True => 0x20,
                TypeTag::False => 0x21,
                TypeTag::Data => 0x22,
                TypeTag::Match => 0x23,
                TypeTag::Symbol => 0x24,
                TypeTag::Undef => 0x3c,
            },
            HostAbi::CallFrame => match self {
                TypeTag::None => 0x00,
                TypeTag::Object => 0x01,
                TypeTag::Class => 0x02,
                TypeTag::Module => 0x03,
                TypeTag::Float => 0x04,
                TypeTag::String => 0x05,
                TypeTag::Regexp => 0x06,
                TypeTag::Array => 0x07,
                TypeTag::Hash => 0x08,
                TypeTag::Struct => 0x09,
                TypeTag::Bignum => 0x0a,
                TypeTag::File => 0x0b,
                TypeTag::Data => 0x0c,
                TypeTag::Match => 0x0d,
                TypeTag::Nil => 0x11,
                TypeTag::True => 0x12,
                TypeTag::False => 0x13,
                TypeTag::Symbol => 0x14,
                TypeTag::Fixnum => 0x15,
                TypeTag::Undef => 0x1b,
                TypeTag::IClass => 0x1d,
            },
        }
    }

    /// Decode a masked flags word
    pub fn from_code(code: u32, abi: HostAbi) -> Option<TypeTag> {
        TypeTag::ALL.into_iter().find(|tag| tag.code(abi) == code)
    }

    /// Host constant name (`T_STRING`, ...)
    pub fn constant_name(self) -> &'static str {
        match self {
            TypeTag::None => "T_NONE",
            TypeTag::Nil => "T_NIL",
            TypeTag::Object => "T_OBJECT",
            TypeTag::Class => "T_CLASS",
            TypeTag::IClass => "T_ICLASS",
            TypeTag::Module => "T_MODULE",
            TypeTag::Float => "T_FLOAT",
            TypeTag::String => "T_STRING",
            TypeTag::Regexp => "T_REGEXP",
            TypeTag::Array => "T_ARRAY",
            TypeTag::Fixnum => "T_FIXNUM",
            TypeTag::Hash => "T_HASH",
            TypeTag::Struct => "T_STRUCT",
            TypeTag::Bignum => "T_BIGNUM",
            TypeTag::File => "T_FILE",
            TypeTag::True => "T_TRUE",
            TypeTag::False => "T_FALSE",
            TypeTag::Data => "T_DATA",
            TypeTag::Match => "T_MATCH",
            TypeTag::Symbol => "T_SYMBOL",
            TypeTag::Undef => "T_UNDEF",
        }
    }
}

/// Mask selecting the type tag out of `RBasic.flags`
pub fn type_mask(abi: HostAbi) -> u32 {
    match abi {
        HostAbi::FrameScope => 0x3f,
        HostAbi::CallFrame => 0x1f,
    }
}

/// `yield` passes its arguments as one array value
pub const YIELD_FUNC_AVALUE: u32 = 1;
/// `yield` passes a single value
pub const YIELD_FUNC_SVALUE: u32 = 2;

/// Array stores its elements inline (call-frame ABI)
pub const RARRAY_EMBED_FLAG: u64 = 1 << 13;
/// Inline element count bits
pub const RARRAY_EMBED_LEN_MASK: u64 = (1 << 15) | (1 << 16);
/// Shift of the inline element count
pub const RARRAY_EMBED_LEN_SHIFT: u32 = 15;

/// One named constant
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NamedConstant {
    /// Host constant name
    pub name: &'static str,
    /// Numeric value
    pub value: u64,
}

/// Every constant of one ABI, by name
#[derive(Debug, Clone, Serialize)]
pub struct ConstantTable {
    /// ABI the codes belong to
    pub abi: HostAbi,
    /// Entries in listing order
    pub entries: Vec<NamedConstant>,
}

impl ConstantTable {
    /// Build the table for an ABI
    pub fn for_abi(abi: HostAbi) -> Self {
        let mut entries = vec![
            NamedConstant { name: "Qfalse", value: HostValue::FALSE.bits() },
            NamedConstant { name: "Qtrue", value: HostValue::TRUE.bits() },
            NamedConstant { name: "Qnil", value: HostValue::NIL.bits() },
            NamedConstant { name: "Qundef", value: HostValue::UNDEF.bits() },
        ];
        entries.extend(TypeTag::ALL.into_iter().map(|tag| NamedConstant {
            name: tag.constant_name(),
            value: tag.code(abi) as u64,
        }));
        entries.push(NamedConstant { name: "T_MASK", value: type_mask(abi) as u64 });
        entries.extend(ExitKind::ALL.into_iter().map(|kind| NamedConstant {
            name: kind.constant_name(),
            value: kind.code() as u64,
        }));
        entries.push(NamedConstant { name: "TAG_MASK", value: TAG_MASK as u64 });
        entries.push(NamedConstant { name: "YIELD_FUNC_AVALUE", value: YIELD_FUNC_AVALUE as u64 });
        entries.push(NamedConstant { name: "YIELD_FUNC_SVALUE", value: YIELD_FUNC_SVALUE as u64 });
        if abi == HostAbi::CallFrame {
            entries.push(NamedConstant { name: "RARRAY_EMBED_FLAG", value: RARRAY_EMBED_FLAG });
            entries.push(NamedConstant {
                name: "RARRAY_EMBED_LEN_MASK",
                value: RARRAY_EMBED_LEN_MASK,
            });
            entries.push(NamedConstant {
                name: "RARRAY_EMBED_LEN_SHIFT",
                value: RARRAY_EMBED_LEN_SHIFT as u64,
            });
        }
        ConstantTable { abi, entries }
    }

    /// Look a constant up by name
    pub fn get(&self, name: &str) -> Option<u64> {
        self.entries.iter().find(|c| c.name == name).map(|c| c.value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_sentinels() {
        assert!(!HostValue::FALSE.truthy());
        assert!(!HostValue::NIL.truthy());
        assert!(HostValue::TRUE.truthy());
        assert!(HostValue::UNDEF.truthy());
        assert!(HostValue::from_fixnum(0).truthy());
        assert_eq!(HostValue::from_bool(true), HostValue::TRUE);
    }

    #[test]
    fn test_fixnum_tagging() {
        for n in [0i64, 1, -1, 42, -1000, 1 << 40] {
            let v = HostValue::from_fixnum(n);
            assert!(v.is_fixnum());
            assert_eq!(v.fixnum(), Some(n));
        }
        assert_eq!(HostValue::from_fixnum(3).bits(), 7);
        assert_eq!(HostValue::NIL.fixnum(), None);
        assert_eq!(HostValue::from_fixnum(-5).to_string(), "-5");
        assert_eq!(HostValue::NIL.to_string(), "nil");
    }

    #[test]
    fn test_type_codes_are_distinct_and_masked() {
        for abi in HostAbi::ALL {
            let codes: HashSet<u32> = TypeTag::ALL.iter().map(|t| t.code(abi)).collect();
            assert_eq!(codes.len(), TypeTag::ALL.len());
            for tag in TypeTag::ALL {
                assert_eq!(tag.code(abi) & type_mask(abi), tag.code(abi));
                assert_eq!(TypeTag::from_code(tag.code(abi), abi), Some(tag));
            }
        }
    }

    #[test]
    fn test_type_codes_differ_between_abis() {
        assert_eq!(TypeTag::String.code(HostAbi::FrameScope), 0x07);
        assert_eq!(TypeTag::String.code(HostAbi::CallFrame), 0x05);
        assert_eq!(TypeTag::Nil.code(HostAbi::CallFrame), 0x11);
    }

    #[test]
    fn test_constant_table() {
        let fs = ConstantTable::for_abi(HostAbi::FrameScope);
        assert_eq!(fs.get("Qnil"), Some(4));
        assert_eq!(fs.get("T_MASK"), Some(0x3f));
        assert_eq!(fs.get("TAG_FATAL"), Some(8));
        assert_eq!(fs.get("RARRAY_EMBED_FLAG"), None);

        let cf = ConstantTable::for_abi(HostAbi::CallFrame);
        assert_eq!(cf.get("T_ARRAY"), Some(0x07));
        assert_eq!(cf.get("RARRAY_EMBED_LEN_SHIFT"), Some(15));
    }
}

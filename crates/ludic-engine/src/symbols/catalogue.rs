//! Runtime service catalogue
//!
//! Every runtime service generated code may call, with an advisory signature
//! and the ABIs that have it. The registry itself stays untyped; signatures
//! here only help callers that want one.

use cranelift_codegen::ir::{types, AbiParam, Signature, Type};
use cranelift_codegen::isa::CallConv;
use serde::Serialize;

use crate::config::HostAbi;

/// Parameter or return type of a service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AbiTy {
    /// Host value word
    Value,
    /// Interned identifier (pointer sized)
    Id,
    /// `long` (pointer sized)
    Long,
    /// Untyped pointer
    Ptr,
    /// `int`
    Int,
    /// 64-bit integer
    I64,
}

impl AbiTy {
    /// Code generator type
    pub fn ir_type(self, pointer_type: Type) -> Type {
        match self {
            AbiTy::Value | AbiTy::Id | AbiTy::Long | AbiTy::Ptr => pointer_type,
            AbiTy::Int => types::I32,
            AbiTy::I64 => types::I64,
        }
    }
}

/// Advisory native signature
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SigSpec {
    /// Fixed parameters
    pub params: &'static [AbiTy],
    /// Return type, `None` for `void`
    pub ret: Option<AbiTy>,
    /// Accepts further arguments after the fixed ones
    pub variadic: bool,
}

impl SigSpec {
    const fn fixed(params: &'static [AbiTy], ret: Option<AbiTy>) -> Self {
        SigSpec { params, ret, variadic: false }
    }

    const fn varargs(params: &'static [AbiTy], ret: Option<AbiTy>) -> Self {
        SigSpec { params, ret, variadic: true }
    }

    /// Build a code generator signature (fixed parameters only)
    pub fn to_signature(&self, call_conv: CallConv, pointer_type: Type) -> Signature {
        let mut sig = Signature::new(call_conv);
        for &param in self.params {
            sig.params.push(AbiParam::new(param.ir_type(pointer_type)));
        }
        if let Some(ret) = self.ret {
            sig.returns.push(AbiParam::new(ret.ir_type(pointer_type)));
        }
        sig
    }
}

/// Which ABIs provide a service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AbiScope {
    /// Every ABI
    Both,
    /// Only the given ABI
    Only(HostAbi),
}

impl AbiScope {
    /// Whether the service exists under `abi`
    pub fn includes(self, abi: HostAbi) -> bool {
        match self {
            AbiScope::Both => true,
            AbiScope::Only(only) => only == abi,
        }
    }
}

/// Who supplies the address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Provider {
    /// The embedding host runtime
    Host,
    /// This crate
    Bridge,
}

/// One catalogue entry
#[derive(Debug, Clone, Copy, Serialize)]
pub struct ServiceEntry {
    /// Symbolic name
    pub name: &'static str,
    /// Signature; `None` for the address of runtime state rather than code
    pub sig: Option<SigSpec>,
    /// ABIs that have it
    pub scope: AbiScope,
    /// Who supplies it
    pub provider: Provider,
}

use AbiTy::*;

const fn host(name: &'static str, sig: SigSpec) -> ServiceEntry {
    ServiceEntry { name, sig: Some(sig), scope: AbiScope::Both, provider: Provider::Host }
}

const fn host_only(abi: HostAbi, name: &'static str, sig: Option<SigSpec>) -> ServiceEntry {
    ServiceEntry { name, sig, scope: AbiScope::Only(abi), provider: Provider::Host }
}

const fn bridge(name: &'static str, sig: SigSpec) -> ServiceEntry {
    ServiceEntry { name, sig: Some(sig), scope: AbiScope::Both, provider: Provider::Bridge }
}

const FS: HostAbi = HostAbi::FrameScope;
const CF: HostAbi = HostAbi::CallFrame;

/// Every known service
pub static SERVICE_CATALOGUE: &[ServiceEntry] = &[
    // method dispatch
    host("funcall", SigSpec::varargs(&[Value, Id, Int], Some(Value))),
    host("funcall2", SigSpec::fixed(&[Value, Id, Int, Ptr], Some(Value))),
    host("funcall3", SigSpec::fixed(&[Value, Id, Int, Ptr], Some(Value))),
    host("call_super", SigSpec::fixed(&[Int, Ptr], Some(Value))),
    host("add_method", SigSpec::fixed(&[Value, Id, Ptr, Int], None)),
    host("method_boundp", SigSpec::fixed(&[Value, Id, Int], Some(Int))),
    host("obj_is_kind_of", SigSpec::fixed(&[Value, Value], Some(Value))),
    host("class_of", SigSpec::fixed(&[Value], Some(Value))),
    host("singleton_class", SigSpec::fixed(&[Value], Some(Value))),
    host("extend_object", SigSpec::fixed(&[Value, Value], None)),
    host("include_module", SigSpec::fixed(&[Value, Value], None)),
    // strings
    host("obj_as_string", SigSpec::fixed(&[Value], Some(Value))),
    host("str_dup", SigSpec::fixed(&[Value], Some(Value))),
    host("str_plus", SigSpec::fixed(&[Value, Value], Some(Value))),
    host("str_concat", SigSpec::fixed(&[Value, Value], Some(Value))),
    host("string_value_ptr", SigSpec::fixed(&[Ptr], Some(Ptr))),
    host("id2name", SigSpec::fixed(&[Id], Some(Ptr))),
    // arrays
    host("ary_new", SigSpec::fixed(&[], Some(Value))),
    host("ary_new2", SigSpec::fixed(&[Long], Some(Value))),
    host("ary_new3", SigSpec::varargs(&[Long], Some(Value))),
    host("ary_new4", SigSpec::fixed(&[Long, Ptr], Some(Value))),
    host("ary_push", SigSpec::fixed(&[Value, Value], Some(Value))),
    host("ary_pop", SigSpec::fixed(&[Value], Some(Value))),
    host("ary_store", SigSpec::fixed(&[Value, Long, Value], None)),
    host("ary_entry", SigSpec::fixed(&[Value, Long], Some(Value))),
    host("ary_concat", SigSpec::fixed(&[Value, Value], Some(Value))),
    host("ary_to_ary", SigSpec::fixed(&[Value], Some(Value))),
    host("ary_dup", SigSpec::fixed(&[Value], Some(Value))),
    // hashes, ranges, numbers, regexps
    host("hash_new", SigSpec::fixed(&[], Some(Value))),
    host("hash_aset", SigSpec::fixed(&[Value, Value, Value], Some(Value))),
    host("hash_aref", SigSpec::fixed(&[Value, Value], Some(Value))),
    host("range_new", SigSpec::fixed(&[Value, Value, Int], Some(Value))),
    host("uint2inum", SigSpec::fixed(&[Long], Some(Value))),
    host("reg_nth_match", SigSpec::fixed(&[Int, Value], Some(Value))),
    host("reg_match", SigSpec::fixed(&[Value, Value], Some(Value))),
    host("reg_match2", SigSpec::fixed(&[Value], Some(Value))),
    // variables and constants
    host("ivar_set", SigSpec::fixed(&[Value, Id, Value], Some(Value))),
    host("ivar_get", SigSpec::fixed(&[Value, Id], Some(Value))),
    host("ivar_defined", SigSpec::fixed(&[Value, Id], Some(Value))),
    host("cvar_set", SigSpec::fixed(&[Value, Id, Value, Int], None)),
    host("cvar_get", SigSpec::fixed(&[Value, Id], Some(Value))),
    host("cvar_defined", SigSpec::fixed(&[Value, Id], Some(Value))),
    host("gv_set", SigSpec::fixed(&[Ptr, Value], Some(Value))),
    host("gv_get", SigSpec::fixed(&[Ptr], Some(Value))),
    host("gvar_defined", SigSpec::fixed(&[Ptr], Some(Value))),
    host("global_entry", SigSpec::fixed(&[Id], Some(Ptr))),
    host("const_get", SigSpec::fixed(&[Value, Id], Some(Value))),
    host("const_defined", SigSpec::fixed(&[Value, Id], Some(Value))),
    host("const_defined_from", SigSpec::fixed(&[Value, Id], Some(Value))),
    // blocks and iteration
    host("yield", SigSpec::fixed(&[Value], Some(Value))),
    host("yield_splat", SigSpec::fixed(&[Value], Some(Value))),
    host("block_given_p", SigSpec::fixed(&[], Some(Int))),
    host("block_proc", SigSpec::fixed(&[], Some(Value))),
    host("iterate", SigSpec::fixed(&[Ptr, Value, Ptr, Value], Some(Value))),
    host("proc_new", SigSpec::fixed(&[Ptr, Value], Some(Value))),
    host("iter_break", SigSpec::fixed(&[], None)),
    // protect, rescue, ensure, jumps
    host("ensure", SigSpec::fixed(&[Ptr, Value, Ptr, Value], Some(Value))),
    host("rescue", SigSpec::fixed(&[Ptr, Value, Ptr, Value], Some(Value))),
    host("rescue2", SigSpec::varargs(&[Ptr, Value, Ptr, Value], Some(Value))),
    host("protect", SigSpec::fixed(&[Ptr, Value, Ptr], Some(Value))),
    host("jump_tag", SigSpec::fixed(&[Int], None)),
    host("errinfo", SigSpec::fixed(&[], Some(Value))),
    // type checks
    host("type", SigSpec::fixed(&[Value], Some(Int))),
    host("check_type", SigSpec::fixed(&[Value, Int], None)),
    host("data_object_alloc", SigSpec::fixed(&[Value, Ptr, Ptr, Ptr], Some(Value))),
    // memory and collector
    host("xmalloc", SigSpec::fixed(&[Long], Some(Ptr))),
    host("xcalloc", SigSpec::fixed(&[Long, Long], Some(Ptr))),
    host("xrealloc", SigSpec::fixed(&[Ptr, Long], Some(Ptr))),
    host("xfree", SigSpec::fixed(&[Ptr], None)),
    host("gc_mark", SigSpec::fixed(&[Value], None)),
    host("gc_mark_locations", SigSpec::fixed(&[Ptr, Ptr], None)),
    // nodes
    host("node_newnode", SigSpec::fixed(&[Int, Value, Value, Value], Some(Ptr))),
    host("wrap_node", SigSpec::fixed(&[Ptr], Some(Value))),
    host("unwrap_node", SigSpec::fixed(&[Value], Some(Ptr))),
    host("eval_node", SigSpec::fixed(&[Value, Ptr], Some(Value))),
    // frame/scope interpreter state
    host_only(FS, "svar", Some(SigSpec::fixed(&[Int], Some(Ptr)))),
    host_only(FS, "ruby_frame", None),
    host_only(FS, "ruby_scope", None),
    host_only(FS, "splat_iterate_proc", Some(SigSpec::fixed(&[Value, Value], Some(Value)))),
    // call-frame VM state
    host_only(CF, "vm_spp", Some(SigSpec::fixed(&[], Some(Ptr)))),
    host_only(CF, "thread_jmp_buf", Some(SigSpec::fixed(&[], Some(Ptr)))),
    host_only(CF, "thread_tag", Some(SigSpec::fixed(&[], Some(Ptr)))),
    host_only(CF, "set_thread_tag", Some(SigSpec::fixed(&[Ptr], None))),
    // provided by this crate
    bridge("frame_protect", SigSpec::fixed(&[I64, Ptr, Ptr, Ptr], Some(I64))),
    bridge("frame_signal", SigSpec::fixed(&[Int, I64, I64], None)),
    bridge("frame_pending", SigSpec::fixed(&[], Some(Int))),
    bridge("frame_current", SigSpec::fixed(&[], Some(Ptr))),
    bridge("block_pass_call", SigSpec::fixed(&[Value, Id, Value, Value], Some(Value))),
    bridge("block_pass_fcall", SigSpec::fixed(&[Value, Id, Value, Value], Some(Value))),
    bridge("current_location", SigSpec::fixed(&[], Some(Ptr))),
];

/// Catalogue entry by name
pub fn find(name: &str) -> Option<&'static ServiceEntry> {
    SERVICE_CATALOGUE.iter().find(|entry| entry.name == name)
}

/// Entries the host must supply under `abi`
pub fn host_services(abi: HostAbi) -> impl Iterator<Item = &'static ServiceEntry> {
    SERVICE_CATALOGUE
        .iter()
        .filter(move |e| e.provider == Provider::Host && e.scope.includes(abi))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_names_unique() {
        let names: HashSet<&str> = SERVICE_CATALOGUE.iter().map(|e| e.name).collect();
        assert_eq!(names.len(), SERVICE_CATALOGUE.len());
    }

    #[test]
    fn test_scoping() {
        let fs: Vec<&str> = host_services(HostAbi::FrameScope).map(|e| e.name).collect();
        let cf: Vec<&str> = host_services(HostAbi::CallFrame).map(|e| e.name).collect();
        assert!(fs.contains(&"ruby_frame"));
        assert!(!cf.contains(&"ruby_frame"));
        assert!(cf.contains(&"thread_tag"));
        assert!(fs.contains(&"funcall") && cf.contains(&"funcall"));
        assert!(!fs.contains(&"frame_protect"));
    }

    #[test]
    fn test_signature() {
        let spec = find("ary_store").unwrap().sig.unwrap();
        let sig = spec.to_signature(CallConv::SystemV, types::I64);
        assert_eq!(sig.params.len(), 3);
        assert!(sig.returns.is_empty());

        let spec = find("block_given_p").unwrap().sig.unwrap();
        let sig = spec.to_signature(CallConv::SystemV, types::I32);
        assert_eq!(sig.returns[0].value_type, types::I32);
        assert!(find("ruby_scope").unwrap().sig.is_none());
    }
}

//! Code generator adapter
//!
//! Thin layer over Cranelift: host ISA creation, a [`FunctionEmitter`] that
//! pairs a `FunctionBuilder` with the objects the finished function must keep
//! alive, and a [`MethodCompiler`] that turns an emitted body into callable
//! machine code.

pub mod abi;

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use cranelift_codegen::ir::{self, types, AbiParam, InstBuilder, MemFlags, Signature, Type};
use cranelift_codegen::isa::{CallConv, OwnedTargetIsa, TargetIsa};
use cranelift_codegen::settings::{self, Configurable};
use cranelift_codegen::Context;
use cranelift_frontend::{FunctionBuilder, FunctionBuilderContext};
use cranelift_jit::{JITBuilder, JITModule};
use cranelift_module::{default_libcall_names, Linkage, Module};
use tracing::{debug, trace};

use crate::config::PointerWidth;
use crate::error::{BridgeError, BridgeResult};
use crate::layout::FieldDescriptor;
use crate::symbols::FunctionAddress;

/// Create an ISA for the machine we are running on
pub fn host_isa() -> BridgeResult<OwnedTargetIsa> {
    let mut flag_builder = settings::builder();
    flag_builder
        .set("opt_level", "speed")
        .map_err(|e| BridgeError::Codegen(format!("Failed to set opt_level: {}", e)))?;
    flag_builder
        .set("is_pic", "false")
        .map_err(|e| BridgeError::Codegen(format!("Failed to set is_pic: {}", e)))?;
    let flags = settings::Flags::new(flag_builder);

    cranelift_native::builder()
        .map_err(|e| BridgeError::Codegen(format!("Failed to create native ISA builder: {}", e)))?
        .finish(flags)
        .map_err(|e| BridgeError::Codegen(format!("Failed to finish ISA: {}", e)))
}

/// Pointer width of an ISA's target triple
pub fn pointer_width_of(isa: &dyn TargetIsa) -> BridgeResult<PointerWidth> {
    PointerWidth::of_triple(isa.triple()).ok_or_else(|| {
        BridgeError::Codegen(format!("unsupported pointer width for {}", isa.triple()))
    })
}

/// Objects a compiled function must keep alive while its code exists
#[derive(Clone, Default)]
pub struct RetainedObjects(Vec<Arc<dyn Any + Send + Sync>>);

impl RetainedObjects {
    /// Keep `object` alive
    pub fn push(&mut self, object: Arc<dyn Any + Send + Sync>) {
        self.0.push(object);
    }

    /// Number of retained objects
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether nothing is retained
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Retained objects of type `T`
    pub fn of_type<T: Any + Send + Sync>(&self) -> impl Iterator<Item = Arc<T>> + '_ {
        self.0.iter().filter_map(|o| o.clone().downcast::<T>().ok())
    }
}

impl fmt::Debug for RetainedObjects {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("RetainedObjects").field(&self.0.len()).finish()
    }
}

/// The function currently being built
pub struct FunctionEmitter<'a> {
    builder: FunctionBuilder<'a>,
    retained: &'a mut RetainedObjects,
    pointer_type: Type,
    call_conv: CallConv,
    params: Vec<ir::Value>,
}

impl<'a> FunctionEmitter<'a> {
    /// Wrap a builder positioned in the function's entry block
    pub fn new(
        builder: FunctionBuilder<'a>,
        retained: &'a mut RetainedObjects,
        pointer_type: Type,
        call_conv: CallConv,
        params: Vec<ir::Value>,
    ) -> Self {
        FunctionEmitter { builder, retained, pointer_type, call_conv, params }
    }

    /// Underlying Cranelift builder
    pub fn builder(&mut self) -> &mut FunctionBuilder<'a> {
        &mut self.builder
    }

    /// Target pointer type
    pub fn pointer_type(&self) -> Type {
        self.pointer_type
    }

    /// Calling convention of native calls
    pub fn call_conv(&self) -> CallConv {
        self.call_conv
    }

    /// Entry block parameters
    pub fn params(&self) -> &[ir::Value] {
        &self.params
    }

    /// Type of a value in this function
    pub fn value_type(&self, value: ir::Value) -> Type {
        self.builder.func.dfg.value_type(value)
    }

    /// Keep `object` alive for as long as the compiled function
    pub fn retain(&mut self, object: Arc<dyn Any + Send + Sync>) {
        self.retained.push(object);
    }

    /// Pointer-sized constant
    pub fn iconst_ptr(&mut self, bits: u64) -> ir::Value {
        let ty = self.pointer_type;
        self.builder.ins().iconst(ty, bits as i64)
    }

    /// Load a record member
    pub fn load_field(&mut self, field: FieldDescriptor, base: ir::Value) -> ir::Value {
        let ty = field.native_type.ir_type(self.pointer_type);
        self.builder
            .ins()
            .load(ty, MemFlags::trusted(), base, field.offset as i32)
    }

    /// Store a record member
    pub fn store_field(&mut self, field: FieldDescriptor, base: ir::Value, value: ir::Value) {
        self.builder
            .ins()
            .store(MemFlags::trusted(), value, base, field.offset as i32);
    }

    /// Store to an absolute address
    pub fn store_absolute(&mut self, address: usize, value: ir::Value) {
        let addr = self.iconst_ptr(address as u64);
        self.builder.ins().store(MemFlags::trusted(), value, addr, 0);
    }

    /// Call native code at a fixed address with a caller-supplied signature
    pub fn call_native(
        &mut self,
        address: FunctionAddress,
        sig: Signature,
        args: &[ir::Value],
    ) -> Vec<ir::Value> {
        let sig_ref = self.builder.import_signature(sig);
        let callee = self.iconst_ptr(address.get() as u64);
        let call = self.builder.ins().call_indirect(sig_ref, callee, args);
        self.builder.inst_results(call).to_vec()
    }

    /// Return from the function while an exit is pending
    ///
    /// `frame_pending` is the address of the bridge's `frame_pending` helper.
    /// Emit this after every call that can signal an exit. The early return
    /// yields zero for each return value; the frame that resumes the exit
    /// ignores it.
    pub fn exit_if_pending(&mut self, frame_pending: FunctionAddress) {
        let mut sig = Signature::new(self.call_conv);
        sig.returns.push(AbiParam::new(types::I32));
        let status = self.call_native(frame_pending, sig, &[])[0];

        let leave = self.builder.create_block();
        let resume = self.builder.create_block();
        self.builder.ins().brif(status, leave, &[], resume, &[]);

        self.builder.switch_to_block(leave);
        let returns: Vec<Type> = self
            .builder
            .func
            .signature
            .returns
            .iter()
            .map(|param| param.value_type)
            .collect();
        let zeros: Vec<ir::Value> = returns.into_iter().map(|ty| self.zero(ty)).collect();
        self.builder.ins().return_(&zeros);

        self.builder.switch_to_block(resume);
    }

    fn zero(&mut self, ty: Type) -> ir::Value {
        if ty == types::F32 {
            self.builder.ins().f32const(0.0)
        } else if ty == types::F64 {
            self.builder.ins().f64const(0.0)
        } else {
            self.builder.ins().iconst(ty, 0)
        }
    }
}

/// Machine code for one method plus what it keeps alive
///
/// The code belongs to the [`MethodCompiler`] that produced it and is valid
/// while that compiler exists.
#[derive(Debug)]
pub struct CompiledMethod {
    name: String,
    code: *const u8,
    retained: RetainedObjects,
}

impl CompiledMethod {
    /// Symbol name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Entry point
    pub fn code_ptr(&self) -> *const u8 {
        self.code
    }

    /// Objects kept alive for this method
    pub fn retained(&self) -> &RetainedObjects {
        &self.retained
    }
}

/// JIT compiler for bridge-aware methods
pub struct MethodCompiler {
    module: JITModule,
    ctx: Context,
    func_ctx: FunctionBuilderContext,
}

impl MethodCompiler {
    /// Compiler targeting the host
    pub fn new() -> BridgeResult<Self> {
        let isa = host_isa()?;
        let builder = JITBuilder::with_isa(isa, default_libcall_names());
        let module = JITModule::new(builder);
        let ctx = module.make_context();
        Ok(MethodCompiler { module, ctx, func_ctx: FunctionBuilderContext::new() })
    }

    /// Target pointer type
    pub fn pointer_type(&self) -> Type {
        self.module.target_config().pointer_type()
    }

    /// Pointer width of the target
    pub fn pointer_width(&self) -> BridgeResult<PointerWidth> {
        pointer_width_of(self.module.isa())
    }

    /// Default calling convention
    pub fn call_conv(&self) -> CallConv {
        self.module.isa().default_call_conv()
    }

    /// Signature in the default calling convention
    pub fn signature(&self, params: &[Type], ret: Option<Type>) -> Signature {
        let mut sig = self.module.make_signature();
        for &param in params {
            sig.params.push(AbiParam::new(param));
        }
        if let Some(ret) = ret {
            sig.returns.push(AbiParam::new(ret));
        }
        sig
    }

    /// Emit a function with `body` and compile it
    ///
    /// `body` starts in the entry block and returns the values to return.
    pub fn compile<F>(
        &mut self,
        name: &str,
        sig: &Signature,
        body: F,
    ) -> BridgeResult<CompiledMethod>
    where
        F: FnOnce(&mut FunctionEmitter<'_>) -> BridgeResult<Vec<ir::Value>>,
    {
        self.module.clear_context(&mut self.ctx);
        self.ctx.func.signature = sig.clone();
        let pointer_type = self.pointer_type();
        let call_conv = self.call_conv();
        let mut retained = RetainedObjects::default();

        {
            let mut builder = FunctionBuilder::new(&mut self.ctx.func, &mut self.func_ctx);
            let entry = builder.create_block();
            builder.append_block_params_for_function_params(entry);
            builder.switch_to_block(entry);
            let params = builder.block_params(entry).to_vec();

            let mut emitter =
                FunctionEmitter::new(builder, &mut retained, pointer_type, call_conv, params);
            let results = body(&mut emitter)?;
            emitter.builder.ins().return_(&results);
            emitter.builder.seal_all_blocks();
            emitter.builder.finalize();
        }
        trace!(name, ir = %self.ctx.func.display(), "emitted");

        let id = self
            .module
            .declare_function(name, Linkage::Local, sig)
            .map_err(BridgeError::codegen)?;
        self.module
            .define_function(id, &mut self.ctx)
            .map_err(BridgeError::codegen)?;
        self.module.clear_context(&mut self.ctx);
        self.module.finalize_definitions().map_err(BridgeError::codegen)?;

        let code = self.module.get_finalized_function(id);
        debug!(name, retained = retained.len(), "compiled method");
        Ok(CompiledMethod { name: name.to_string(), code, retained })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_isa() {
        let isa = host_isa().unwrap();
        assert_eq!(pointer_width_of(&*isa).unwrap(), PointerWidth::host());
    }

    #[test]
    fn test_compile_identity() {
        let mut compiler = MethodCompiler::new().unwrap();
        let sig = compiler.signature(&[types::I64], Some(types::I64));
        let method = compiler
            .compile("identity", &sig, |e| Ok(vec![e.params()[0]]))
            .unwrap();
        let f: extern "C" fn(i64) -> i64 = unsafe { std::mem::transmute(method.code_ptr()) };
        assert_eq!(f(17), 17);
        assert!(method.retained().is_empty());
        assert_eq!(method.name(), "identity");
    }

    #[test]
    fn test_retained_objects() {
        let mut compiler = MethodCompiler::new().unwrap();
        let sig = compiler.signature(&[], None);
        let keep = Arc::new(String::from("kept"));
        let method = compiler
            .compile("retain", &sig, |e| {
                e.retain(keep.clone());
                Ok(vec![])
            })
            .unwrap();
        assert_eq!(Arc::strong_count(&keep), 2);
        let kept: Vec<Arc<String>> = method.retained().of_type::<String>().collect();
        assert_eq!(kept[0].as_str(), "kept");
        drop(kept);
        drop(method);
        assert_eq!(Arc::strong_count(&keep), 1);
    }
}

//! Accessor facade
//!
//! The operations the per-node translator uses: member access on host
//! records, runtime service addresses, location updates and synthetic calls.
//! A [`Bridge`] is built once from a [`BuildConfig`] and the host's service
//! addresses, then installed process-wide so helpers called from generated
//! code can reach it.

use std::fmt;
use std::sync::{Arc, OnceLock};

use cranelift_codegen::ir::{self, Signature};
use tracing::{debug, trace};

use crate::codegen::{abi, FunctionEmitter};
use crate::config::BuildConfig;
use crate::constants::{ConstantTable, HostValue};
use crate::error::{BridgeError, BridgeResult};
use crate::invoke::{self, HostEvaluator, HostId, SyntheticInvocation};
use crate::layout::bootstrap::bootstrap_layouts;
use crate::layout::{FieldDescriptor, NativeType, TypeLayoutTable};
use crate::location::{emit_location_update, LocationSlots, SourceNode};
use crate::symbols::{bootstrap_functions, FunctionAddress, FunctionRegistry, HostServices};

static GLOBAL: OnceLock<Bridge> = OnceLock::new();

/// Bootstrapped registries plus the host collaborators
pub struct Bridge {
    config: BuildConfig,
    layouts: TypeLayoutTable,
    functions: FunctionRegistry,
    slots: LocationSlots,
    evaluator: Option<Box<dyn HostEvaluator>>,
}

/// Collects everything a [`Bridge`] is built from
pub struct BridgeBuilder {
    config: BuildConfig,
    services: HostServices,
    slots: Option<LocationSlots>,
    evaluator: Option<Box<dyn HostEvaluator>>,
    extra_members: Vec<(String, String, u32, NativeType)>,
}

impl BridgeBuilder {
    /// Host service addresses
    pub fn services(mut self, services: HostServices) -> Self {
        self.services = services;
        self
    }

    /// One more host service
    pub fn function(mut self, name: &str, address: FunctionAddress) -> Self {
        self.services.provide(name, address);
        self
    }

    /// Host-owned location slots (defaults to the bridge's own)
    pub fn location_slots(mut self, slots: LocationSlots) -> Self {
        self.slots = Some(slots);
        self
    }

    /// Host evaluator for synthetic invocations
    pub fn evaluator(mut self, evaluator: impl HostEvaluator + 'static) -> Self {
        self.evaluator = Some(Box::new(evaluator));
        self
    }

    /// A record member beyond the bootstrap tables
    pub fn member(
        mut self,
        type_name: &str,
        field: &str,
        offset: u32,
        native_type: NativeType,
    ) -> Self {
        self.extra_members
            .push((type_name.to_string(), field.to_string(), offset, native_type));
        self
    }

    /// Run the bootstraps
    pub fn build(self) -> Bridge {
        let mut layouts = bootstrap_layouts(&self.config);
        for (type_name, field, offset, native_type) in &self.extra_members {
            layouts.register(type_name, field, *offset, *native_type);
        }
        let functions = bootstrap_functions(self.config.abi, &self.services);
        debug!(
            abi = %self.config.abi,
            members = layouts.len(),
            functions = functions.len(),
            evaluator = self.evaluator.is_some(),
            "bridge built"
        );
        Bridge {
            config: self.config,
            layouts,
            functions,
            slots: self.slots.unwrap_or_else(LocationSlots::bridge_owned),
            evaluator: self.evaluator,
        }
    }
}

impl Bridge {
    /// Start building a bridge for a host build
    pub fn builder(config: BuildConfig) -> BridgeBuilder {
        BridgeBuilder {
            config,
            services: HostServices::new(),
            slots: None,
            evaluator: None,
            extra_members: Vec::new(),
        }
    }

    /// Make this bridge the process-wide one
    pub fn install(self) -> BridgeResult<&'static Bridge> {
        GLOBAL.set(self).map_err(|_| BridgeError::AlreadyInstalled)?;
        Bridge::global()
    }

    /// The installed bridge
    pub fn global() -> BridgeResult<&'static Bridge> {
        GLOBAL.get().ok_or(BridgeError::NotInstalled)
    }

    /// Host build configuration
    pub fn config(&self) -> &BuildConfig {
        &self.config
    }

    /// Struct layout registry
    pub fn layouts(&self) -> &TypeLayoutTable {
        &self.layouts
    }

    /// Function pointer registry
    pub fn functions(&self) -> &FunctionRegistry {
        &self.functions
    }

    /// Where location updates are stored
    pub fn location_slots(&self) -> &LocationSlots {
        &self.slots
    }

    /// Host evaluator, if one was supplied
    pub fn evaluator(&self) -> Option<&dyn HostEvaluator> {
        self.evaluator.as_deref()
    }

    /// Constants of the configured ABI
    pub fn constants(&self) -> ConstantTable {
        ConstantTable::for_abi(self.config.abi)
    }

    fn check_pointer(&self, emitter: &FunctionEmitter<'_>, ptr: ir::Value) -> BridgeResult<()> {
        let pointer_type = emitter.pointer_type();
        if pointer_type.bytes() as usize != self.config.pointer_width.bytes() {
            return Err(BridgeError::Config(format!(
                "layouts are for {}-bit pointers but the target uses {}",
                self.config.pointer_width.bits(),
                pointer_type
            )));
        }
        let found = emitter.value_type(ptr);
        if found != pointer_type {
            return Err(BridgeError::TypeMismatch {
                what: "pointer",
                expected: pointer_type.to_string(),
                found: found.to_string(),
            });
        }
        Ok(())
    }

    fn member(&self, type_name: &str, member: &str) -> BridgeResult<FieldDescriptor> {
        self.layouts.lookup(type_name, member)
    }

    /// Emit a load of `type_name.member` from the record at `ptr`
    pub fn get_member(
        &self,
        emitter: &mut FunctionEmitter<'_>,
        type_name: &str,
        member: &str,
        ptr: ir::Value,
    ) -> BridgeResult<ir::Value> {
        let field = self.member(type_name, member)?;
        self.check_pointer(emitter, ptr)?;
        trace!(type_name, member, offset = field.offset, "emit load");
        Ok(emitter.load_field(field, ptr))
    }

    /// Emit a store of `value` to `type_name.member` of the record at `ptr`
    pub fn set_member(
        &self,
        emitter: &mut FunctionEmitter<'_>,
        type_name: &str,
        member: &str,
        ptr: ir::Value,
        value: ir::Value,
    ) -> BridgeResult<()> {
        let field = self.member(type_name, member)?;
        self.check_pointer(emitter, ptr)?;
        let expected = field.native_type.ir_type(emitter.pointer_type());
        let found = emitter.value_type(value);
        if found != expected {
            return Err(BridgeError::TypeMismatch {
                what: "value",
                expected: format!("{} ({})", expected, field.native_type),
                found: found.to_string(),
            });
        }
        trace!(type_name, member, offset = field.offset, "emit store");
        emitter.store_field(field, ptr, value);
        Ok(())
    }

    /// Whether `type_name.member` exists in this build
    pub fn has_member(&self, type_name: &str, member: &str) -> bool {
        self.layouts.has(type_name, member)
    }

    /// Byte offset of `type_name.member`
    pub fn member_offset(&self, type_name: &str, member: &str) -> BridgeResult<u32> {
        self.layouts.offset_of(type_name, member)
    }

    /// Address bound to a service name
    pub fn function_pointer(&self, name: &str) -> BridgeResult<FunctionAddress> {
        self.functions.pointer_of(name)
    }

    /// Emit a call to a registered service
    ///
    /// Without an explicit signature the catalogue's advisory one is used.
    pub fn emit_call_native(
        &self,
        emitter: &mut FunctionEmitter<'_>,
        name: &str,
        sig: Option<Signature>,
        args: &[ir::Value],
    ) -> BridgeResult<Vec<ir::Value>> {
        let address = self.function_pointer(name)?;
        let sig = match sig {
            Some(sig) => sig,
            None => self
                .functions
                .signature_of(name, emitter.call_conv(), emitter.pointer_type())
                .ok_or_else(|| BridgeError::Codegen(format!("no signature known for {name}")))?,
        };
        trace!(name, %address, "emit native call");
        Ok(emitter.call_native(address, sig, args))
    }

    /// Emit an early return taken while an exit is pending
    pub fn emit_exit_check(&self, emitter: &mut FunctionEmitter<'_>) -> BridgeResult<()> {
        let frame_pending = self.function_pointer("frame_pending")?;
        emitter.exit_if_pending(frame_pending);
        Ok(())
    }

    /// Emit a call to a service that can signal an exit
    ///
    /// Like [`Bridge::emit_call_native`], followed by [`Bridge::emit_exit_check`].
    pub fn emit_call_checked(
        &self,
        emitter: &mut FunctionEmitter<'_>,
        name: &str,
        sig: Option<Signature>,
        args: &[ir::Value],
    ) -> BridgeResult<Vec<ir::Value>> {
        let results = self.emit_call_native(emitter, name, sig, args)?;
        self.emit_exit_check(emitter)?;
        Ok(results)
    }

    /// Emit an update of the current source location to `node`'s
    pub fn set_source_location(&self, emitter: &mut FunctionEmitter<'_>, node: &Arc<SourceNode>) {
        emit_location_update(emitter, &self.slots, self.config.abi, node);
    }

    /// Evaluate a call with a block through the host evaluator
    pub fn call_with_block(&self, invocation: &SyntheticInvocation) -> BridgeResult<HostValue> {
        let evaluator = self.evaluator().ok_or(BridgeError::NoEvaluator)?;
        invoke::call_with_block(evaluator, self.config.abi, invocation)
    }

    /// Emit a call with a block, evaluated at run time
    #[allow(clippy::too_many_arguments)]
    pub fn emit_call_with_block(
        &self,
        emitter: &mut FunctionEmitter<'_>,
        bound: bool,
        recv: ir::Value,
        method: HostId,
        args: ir::Value,
        block: ir::Value,
    ) -> BridgeResult<ir::Value> {
        invoke::emit_call_with_block(emitter, &self.functions, bound, recv, method, args, block)
    }

    /// Emit `RBasic.flags & T_MASK` of `obj`
    pub fn emit_builtin_type(
        &self,
        emitter: &mut FunctionEmitter<'_>,
        obj: ir::Value,
    ) -> BridgeResult<ir::Value> {
        self.check_pointer(emitter, obj)?;
        abi::emit_builtin_type(emitter, &self.layouts, self.config.abi, obj)
    }
}

impl fmt::Debug for Bridge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bridge")
            .field("config", &self.config)
            .field("members", &self.layouts.len())
            .field("functions", &self.functions.len())
            .field("slots", &self.slots)
            .field("evaluator", &self.evaluator.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HostAbi;
    use crate::invoke::{CallNode, Receiver};

    struct Echo;

    impl HostEvaluator for Echo {
        fn evaluate(&self, _node: &CallNode, self_value: HostValue) -> HostValue {
            self_value
        }

        fn is_sequence(&self, _value: HostValue) -> bool {
            true
        }

        fn type_error(&self, _message: &str) -> HostValue {
            HostValue::NIL
        }
    }

    fn bridge() -> Bridge {
        Bridge::builder(BuildConfig::for_abi(HostAbi::FrameScope))
            .function("concat", FunctionAddress(0x4000))
            .member("Box", "value", 8, NativeType::Pointer)
            .build()
    }

    #[test]
    fn test_registry_queries() {
        let bridge = bridge();
        assert!(bridge.has_member("Box", "value"));
        assert!(bridge.has_member("RArray", "ptr"));
        assert!(!bridge.has_member("Box", "lid"));
        assert_eq!(bridge.member_offset("Box", "value").unwrap(), 8);
        assert_eq!(bridge.function_pointer("concat").unwrap(), FunctionAddress(0x4000));
        assert!(matches!(
            bridge.function_pointer("missing"),
            Err(BridgeError::UnknownFunction { .. })
        ));
        assert_eq!(bridge.constants().get("Qnil"), Some(4));
    }

    #[test]
    fn test_call_with_block_needs_evaluator() {
        let inv = SyntheticInvocation {
            receiver: Receiver::Implicit { self_value: HostValue::TRUE },
            method: HostId(1),
            args: HostValue(0x10),
            block: None,
        };
        assert_eq!(bridge().call_with_block(&inv), Err(BridgeError::NoEvaluator));

        let with_eval =
            Bridge::builder(BuildConfig::for_abi(HostAbi::CallFrame)).evaluator(Echo).build();
        assert_eq!(with_eval.call_with_block(&inv).unwrap(), HostValue::TRUE);
    }
}

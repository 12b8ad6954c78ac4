//! Synthetic invocations
//!
//! Attaching a block to a call is a property of the call site, not an
//! argument, so "call `m` with these arguments and this block" cannot be a
//! flat native call. Instead a small call tree is built and handed to the
//! host's own evaluator.

use cranelift_codegen::ir;
use tracing::trace;

use crate::bridge::Bridge;
use crate::codegen::FunctionEmitter;
use crate::config::HostAbi;
use crate::constants::HostValue;
use crate::control::{fatal, run_native, signal_exit, ExitKind, OwnerTag};
use crate::error::{BridgeError, BridgeResult};
use crate::symbols::FunctionRegistry;

/// Interned method name
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct HostId(pub u64);

/// Who receives the call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Receiver {
    /// Method call on a value
    Bound(HostValue),
    /// Function call resolved in the current lexical scope
    Implicit {
        /// `self` of that scope
        self_value: HostValue,
    },
}

/// Call tree understood by the host evaluator
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallNode {
    /// Literal value
    Lit(HostValue),
    /// Spread a sequence as positional arguments
    Splat(Box<CallNode>),
    /// `recv.method(args)`
    Call {
        /// Receiver expression
        recv: Box<CallNode>,
        /// Method name
        method: HostId,
        /// Argument expression
        args: Box<CallNode>,
    },
    /// `method(args)` on the implicit receiver
    FCall {
        /// Method name
        method: HostId,
        /// Argument expression
        args: Box<CallNode>,
    },
    /// `call` with `block` attached
    BlockPass {
        /// The call
        call: Box<CallNode>,
        /// Block expression
        block: Box<CallNode>,
    },
    /// Argument list carrying a block
    BlockArg {
        /// Positional arguments
        args: Box<CallNode>,
        /// Block expression
        block: Box<CallNode>,
    },
}

/// One-shot request to evaluate a call with a block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyntheticInvocation {
    /// Receiver shape
    pub receiver: Receiver,
    /// Method name
    pub method: HostId,
    /// Arguments; must already be a sequence
    pub args: HostValue,
    /// Block to attach
    pub block: Option<HostValue>,
}

impl SyntheticInvocation {
    /// `self` the evaluator runs the call under
    pub fn self_value(&self) -> HostValue {
        match self.receiver {
            Receiver::Bound(recv) => recv,
            Receiver::Implicit { self_value } => self_value,
        }
    }

    /// Build the call tree for an ABI
    pub fn to_call_node(&self, abi: HostAbi) -> CallNode {
        let lit = |v| Box::new(CallNode::Lit(v));
        let args = Box::new(CallNode::Splat(lit(self.args)));

        match (self.receiver, self.block) {
            (Receiver::Bound(recv), block) => {
                let call = CallNode::Call { recv: lit(recv), method: self.method, args };
                wrap_block(call, block)
            }
            (Receiver::Implicit { .. }, None) => CallNode::FCall { method: self.method, args },
            (Receiver::Implicit { .. }, Some(block)) => match abi {
                HostAbi::FrameScope => {
                    wrap_block(CallNode::FCall { method: self.method, args }, Some(block))
                }
                HostAbi::CallFrame => CallNode::FCall {
                    method: self.method,
                    args: Box::new(CallNode::BlockArg { args, block: lit(block) }),
                },
            },
        }
    }
}

fn wrap_block(call: CallNode, block: Option<HostValue>) -> CallNode {
    match block {
        Some(block) => CallNode::BlockPass {
            call: Box::new(call),
            block: Box::new(CallNode::Lit(block)),
        },
        None => call,
    }
}

/// The host runtime's expression evaluator
pub trait HostEvaluator: Send + Sync {
    /// Evaluate a call tree with `self_value` as `self`
    ///
    /// May leave through a non-local exit like any host call.
    fn evaluate(&self, node: &CallNode, self_value: HostValue) -> HostValue;

    /// Whether a value can be spread as positional arguments
    fn is_sequence(&self, value: HostValue) -> bool;

    /// Build the host exception raised for a type error
    fn type_error(&self, message: &str) -> HostValue;

    /// Short description of a value for error messages
    fn describe(&self, value: HostValue) -> String {
        value.to_string()
    }
}

/// Evaluate `invocation` through `evaluator`
///
/// `invocation.args` must already be a sequence; fixed-arity argument lists
/// are not assembled here.
pub fn call_with_block(
    evaluator: &dyn HostEvaluator,
    abi: HostAbi,
    invocation: &SyntheticInvocation,
) -> BridgeResult<HostValue> {
    if !evaluator.is_sequence(invocation.args) {
        return Err(BridgeError::TypeMismatch {
            what: "args",
            expected: "sequence".to_string(),
            found: evaluator.describe(invocation.args),
        });
    }
    let node = invocation.to_call_node(abi);
    trace!(?node, "synthetic invocation");
    Ok(evaluator.evaluate(&node, invocation.self_value()))
}

/// Entry used by generated code
///
/// A type error becomes a raised host exception. Any exit, including one
/// raised by the evaluator, is left pending for the caller.
fn call_from_generated(invocation: SyntheticInvocation) -> usize {
    let bridge = Bridge::global().unwrap_or_else(|err| fatal(&err));
    let evaluator = bridge
        .evaluator()
        .unwrap_or_else(|| fatal(&BridgeError::NoEvaluator));
    let abi = bridge.config().abi;

    run_native(|| match call_with_block(evaluator, abi, &invocation) {
        Ok(value) => value.bits(),
        Err(err) => {
            let exc = evaluator.type_error(&err.to_string());
            signal_exit(ExitKind::Raise, OwnerTag::ANY, exc.bits())
        }
    }) as usize
}

/// `recv.method(*args, &block)` from generated code
pub extern "C" fn block_pass_call(recv: usize, method: usize, args: usize, block: usize) -> usize {
    call_from_generated(SyntheticInvocation {
        receiver: Receiver::Bound(HostValue(recv as u64)),
        method: HostId(method as u64),
        args: HostValue(args as u64),
        block: Some(HostValue(block as u64)),
    })
}

/// `method(*args, &block)` with `recv` as `self`, from generated code
pub extern "C" fn block_pass_fcall(recv: usize, method: usize, args: usize, block: usize) -> usize {
    call_from_generated(SyntheticInvocation {
        receiver: Receiver::Implicit { self_value: HostValue(recv as u64) },
        method: HostId(method as u64),
        args: HostValue(args as u64),
        block: Some(HostValue(block as u64)),
    })
}

/// Emit a call to the bridge's block-passing helper
///
/// `recv` is the receiver for a method call, or `self` for a function call.
/// All operands are pointer-sized host words. The emitted code returns early
/// if the call leaves an exit pending.
pub fn emit_call_with_block(
    emitter: &mut FunctionEmitter<'_>,
    functions: &FunctionRegistry,
    bound: bool,
    recv: ir::Value,
    method: HostId,
    args: ir::Value,
    block: ir::Value,
) -> BridgeResult<ir::Value> {
    let name = if bound { "block_pass_call" } else { "block_pass_fcall" };
    let address = functions.pointer_of(name)?;
    let sig = functions
        .signature_of(name, emitter.call_conv(), emitter.pointer_type())
        .ok_or_else(|| BridgeError::UnknownFunction { name: name.to_string() })?;
    let method = emitter.iconst_ptr(method.0);
    let results = emitter.call_native(address, sig, &[recv, method, args, block]);
    let value = results
        .first()
        .copied()
        .ok_or_else(|| BridgeError::Codegen(format!("{name} returned no value")))?;
    emitter.exit_if_pending(functions.pointer_of("frame_pending")?);
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    const EACH: HostId = HostId(0x51);
    const ARGS: HostValue = HostValue(0x1000);
    const BLOCK: HostValue = HostValue(0x2000);
    const SELF: HostValue = HostValue(0x3000);

    struct Recorder {
        seen: Mutex<Vec<(CallNode, HostValue)>>,
    }

    impl HostEvaluator for Recorder {
        fn evaluate(&self, node: &CallNode, self_value: HostValue) -> HostValue {
            self.seen.lock().unwrap().push((node.clone(), self_value));
            HostValue::from_fixnum(6)
        }

        fn is_sequence(&self, value: HostValue) -> bool {
            value == ARGS
        }

        fn type_error(&self, _message: &str) -> HostValue {
            HostValue(0xe)
        }
    }

    fn recorder() -> Recorder {
        Recorder { seen: Mutex::new(Vec::new()) }
    }

    fn implicit_each() -> SyntheticInvocation {
        SyntheticInvocation {
            receiver: Receiver::Implicit { self_value: SELF },
            method: EACH,
            args: ARGS,
            block: Some(BLOCK),
        }
    }

    fn splat() -> Box<CallNode> {
        Box::new(CallNode::Splat(Box::new(CallNode::Lit(ARGS))))
    }

    #[test]
    fn test_function_call_shapes() {
        let inv = implicit_each();
        assert_eq!(
            inv.to_call_node(HostAbi::FrameScope),
            CallNode::BlockPass {
                call: Box::new(CallNode::FCall { method: EACH, args: splat() }),
                block: Box::new(CallNode::Lit(BLOCK)),
            }
        );
        assert_eq!(
            inv.to_call_node(HostAbi::CallFrame),
            CallNode::FCall {
                method: EACH,
                args: Box::new(CallNode::BlockArg {
                    args: splat(),
                    block: Box::new(CallNode::Lit(BLOCK)),
                }),
            }
        );
    }

    #[test]
    fn test_method_call_shape_is_shared() {
        let inv = SyntheticInvocation { receiver: Receiver::Bound(SELF), ..implicit_each() };
        let expected = CallNode::BlockPass {
            call: Box::new(CallNode::Call {
                recv: Box::new(CallNode::Lit(SELF)),
                method: EACH,
                args: splat(),
            }),
            block: Box::new(CallNode::Lit(BLOCK)),
        };
        for abi in HostAbi::ALL {
            assert_eq!(inv.to_call_node(abi), expected);
        }
    }

    #[test]
    fn test_without_block() {
        let inv = SyntheticInvocation { block: None, ..implicit_each() };
        assert_eq!(
            inv.to_call_node(HostAbi::CallFrame),
            CallNode::FCall { method: EACH, args: splat() }
        );
    }

    #[test]
    fn test_call_with_block_evaluates_once() {
        let evaluator = recorder();
        let result = call_with_block(&evaluator, HostAbi::CallFrame, &implicit_each()).unwrap();
        assert_eq!(result, HostValue::from_fixnum(6));
        let seen = evaluator.seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].1, SELF);
    }

    #[test]
    fn test_args_must_be_sequence() {
        let evaluator = recorder();
        let inv = SyntheticInvocation { args: HostValue::from_fixnum(1), ..implicit_each() };
        let err = call_with_block(&evaluator, HostAbi::FrameScope, &inv).unwrap_err();
        assert_eq!(
            err,
            BridgeError::TypeMismatch {
                what: "args",
                expected: "sequence".into(),
                found: "1".into(),
            }
        );
        assert!(evaluator.seen.lock().unwrap().is_empty());
    }
}

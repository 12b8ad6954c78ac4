//! Ludic Engine
//!
//! Native bridge between a JIT method compiler and the internals of the host
//! runtime it compiles for:
//! - **Layouts**: offsets and native types of host record members (`layout`)
//! - **Symbols**: addresses of runtime services callable from generated code (`symbols`)
//! - **Control**: non-local exits through protected regions (`control`)
//! - **Location**: current source location updates (`location`)
//! - **Invoke**: calls with an attached block evaluated by the host (`invoke`)
//! - **Bridge**: the facade the translator talks to (`bridge`)
//!
//! # Example
//!
//! ```rust,ignore
//! use ludic_engine::{Bridge, BuildConfig, HostAbi, MethodCompiler};
//!
//! let bridge = Bridge::builder(BuildConfig::for_abi(HostAbi::CallFrame)).build();
//! let mut compiler = MethodCompiler::new()?;
//! let ptr = compiler.pointer_type();
//! let sig = compiler.signature(&[ptr], Some(ptr));
//! let len = compiler.compile("ary_len", &sig, |e| {
//!     let ary = e.params()[0];
//!     Ok(vec![bridge.get_member(e, "RArray", "as.heap.len", ary)?])
//! })?;
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![allow(clippy::not_unsafe_ptr_arg_deref)]

/// Accessor facade and process-wide install
pub mod bridge;

/// Cranelift adapter and value-encoding helpers
pub mod codegen;

/// Host build configuration
pub mod config;

/// Numeric constants shared with generated code
pub mod constants;

/// Non-local control-flow runtime
pub mod control;

/// Error types
pub mod error;

/// Synthetic invocation builder
pub mod invoke;

/// Struct layout registry
pub mod layout;

/// Source-location instrumentation
pub mod location;

/// Function pointer registry
pub mod symbols;

// ============================================================================
// Re-exports
// ============================================================================

pub use bridge::{Bridge, BridgeBuilder};
pub use codegen::{CompiledMethod, FunctionEmitter, MethodCompiler, RetainedObjects};
pub use config::{BuildConfig, HostAbi, LayoutFeature, PointerWidth};
pub use constants::{ConstantTable, HostValue, TypeTag};
pub use control::{
    exit_pending, park_exit, protect, push_frame, resolve_exit, resume_pending, signal_exit,
    ActiveFrame, ControlFlowFrame, ExitKind, FrameState, OwnerTag, Outcome,
};
pub use error::{BridgeError, BridgeResult};
pub use invoke::{CallNode, HostEvaluator, HostId, Receiver, SyntheticInvocation};
pub use layout::{FieldDescriptor, NativeType, TypeLayoutTable};
pub use location::{LocationSlots, SourceLocationMarker, SourceNode};
pub use symbols::{FunctionAddress, FunctionRegistry, HostServices};

//! Errors raised by the bridge.
//!
//! Registry misses and type mismatches are developer-facing: they mean the
//! translator asked for something the bootstrap tables do not describe, and
//! they propagate back to whoever drives code generation.

use crate::control::ExitKind;
use crate::control::OwnerTag;

/// Error during a bridge operation
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BridgeError {
    /// No record with this name was registered
    #[error("Invalid struct name {type_name}")]
    UnknownType {
        /// Requested record name
        type_name: String,
    },

    /// The record exists but has no member with this name
    #[error("Invalid member name {field} for struct {type_name}")]
    UnknownField {
        /// Record name
        type_name: String,
        /// Requested member name
        field: String,
    },

    /// No function pointer was registered under this name
    #[error("No such function pointer defined: {name}")]
    UnknownFunction {
        /// Requested symbolic name
        name: String,
    },

    /// A value of the wrong native kind was supplied
    #[error("Wrong type for {what}; expected {expected} but got {found}")]
    TypeMismatch {
        /// Which argument was wrong
        what: &'static str,
        /// Kind that was required
        expected: String,
        /// Kind that was supplied
        found: String,
    },

    /// A non-local exit found no enclosing frame to land on
    #[error("No enclosing frame accepts {kind:?} exit targeting {target}")]
    UnmatchedExit {
        /// Exit kind that was signaled
        kind: ExitKind,
        /// Requested owner tag
        target: OwnerTag,
    },

    /// A frame was popped while another frame was on top of the stack
    #[error("Frame #{popped} popped out of order (top of stack is #{top})")]
    FrameOrder {
        /// Serial of the frame being popped
        popped: u64,
        /// Serial of the actual top of stack (0 if empty)
        top: u64,
    },

    /// An exit code outside the known set
    #[error("Invalid exit code {0:#x}")]
    InvalidExitCode(u32),

    /// Build configuration could not be read or is inconsistent
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// The code generator rejected a request
    #[error("Code generation failed: {0}")]
    Codegen(String),

    /// `Bridge::install` was called twice
    #[error("Bridge is already installed")]
    AlreadyInstalled,

    /// A helper ran before `Bridge::install`
    #[error("Bridge is not installed")]
    NotInstalled,

    /// A synthetic invocation was requested but no evaluator was supplied
    #[error("No host evaluator installed")]
    NoEvaluator,
}

/// Result alias used across the crate
pub type BridgeResult<T> = Result<T, BridgeError>;

impl BridgeError {
    pub(crate) fn codegen(e: impl std::fmt::Display) -> Self {
        BridgeError::Codegen(e.to_string())
    }
}

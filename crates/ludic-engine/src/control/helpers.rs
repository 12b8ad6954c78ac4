//! C entry points of the control-flow runtime
//!
//! Generated code reaches these through the function registry
//! (`frame_protect`, `frame_signal`, `frame_pending`, `frame_current`).
//! None of them unwinds into its caller: an exit aimed past the caller is
//! left pending, and the caller checks `frame_pending` and returns.

use std::ffi::c_void;

use super::{
    current_frame, exit_pending, fatal, park_exit, protect, run_native, ControlFlowFrame, ExitKind,
    OwnerTag,
};

/// Body of a protected region as generated code supplies it
///
/// Rust bodies may unwind; generated bodies return with an exit pending.
pub type ProtectedBody = unsafe extern "C-unwind" fn(data: *mut c_void) -> u64;

/// Run `body(data)` inside a frame tagged `tag`
///
/// Returns the body's value, or the value carried by an exit that landed on
/// the frame. `*state_out` (if non-null) receives 0 on normal completion or
/// the exit code. An exit aimed further out is left pending and 0 returned.
///
/// # Safety
///
/// `body` must be safe to call with `data`; `state_out` must be null or
/// valid for a `u32` write.
pub unsafe extern "C" fn frame_protect(
    tag: u64,
    body: ProtectedBody,
    data: *mut c_void,
    state_out: *mut u32,
) -> u64 {
    run_native(|| {
        // SAFETY: upheld by the caller
        let outcome = protect(OwnerTag(tag), || unsafe { body(data) });
        if !state_out.is_null() {
            // SAFETY: upheld by the caller
            unsafe { *state_out = outcome.state_code() };
        }
        outcome.value()
    })
}

/// Signal a non-local exit from generated code
///
/// The exit is left pending; the caller must return until it reaches the
/// frame that resumes it. An invalid exit code is fatal, like an exit no
/// frame accepts.
pub extern "C" fn frame_signal(kind: u32, tag: u64, value: u64) {
    match ExitKind::from_code(kind) {
        Ok(kind) => park_exit(kind, OwnerTag(tag), value),
        Err(err) => fatal(&err),
    }
}

/// 1 while an exit is pending on the calling thread, else 0
pub extern "C" fn frame_pending() -> u32 {
    exit_pending() as u32
}

/// Innermost frame of the calling thread (null if none)
pub extern "C" fn frame_current() -> *mut ControlFlowFrame {
    current_frame()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::current_depth;

    unsafe extern "C-unwind" fn add_one(data: *mut c_void) -> u64 {
        unsafe { *(data as *const u64) + 1 }
    }

    unsafe extern "C-unwind" fn break_out(data: *mut c_void) -> u64 {
        let tag = unsafe { *(data as *const u64) };
        frame_signal(ExitKind::Break.code(), tag, 77);
        assert_eq!(frame_pending(), 1);
        0
    }

    unsafe extern "C-unwind" fn nested(data: *mut c_void) -> u64 {
        let mut state = u32::MAX;
        let value = unsafe { frame_protect(0x2, break_out, data, &mut state) };
        if frame_pending() != 0 {
            return 0;
        }
        unreachable!("inner region returned {value} with state {state}")
    }

    #[test]
    fn test_protect_completes() {
        let mut input = 41u64;
        let mut state = u32::MAX;
        let value = unsafe {
            frame_protect(0x1, add_one, &mut input as *mut u64 as *mut c_void, &mut state)
        };
        assert_eq!(value, 42);
        assert_eq!(state, 0);
        assert!(frame_current().is_null());
    }

    #[test]
    fn test_signal_lands_on_matching_tag() {
        let mut tag = 0x1u64;
        let mut state = 0;
        let value = unsafe {
            frame_protect(0x1, nested, &mut tag as *mut u64 as *mut c_void, &mut state)
        };
        assert_eq!(value, 77);
        assert_eq!(state, ExitKind::Break.code());
        assert_eq!(frame_pending(), 0);
        assert_eq!(current_depth(), 0);
    }

    #[test]
    fn test_null_state_out() {
        let mut input = 1u64;
        let value = unsafe {
            frame_protect(0x1, add_one, &mut input as *mut u64 as *mut c_void, std::ptr::null_mut())
        };
        assert_eq!(value, 2);
    }
}

//! Non-local control flow
//!
//! Generated code brackets every protected region (method body, block
//! invocation, rescue/ensure region) with a [`ControlFlowFrame`]. Frames form a
//! singly linked stack whose top lives in thread-local state; one thread is one
//! execution context. A non-local exit ([`signal_exit`]) picks the nearest
//! frame that accepts it, writes the frame's result slot and unwinds the native
//! stack to the point where that frame is executing ([`ActiveFrame::exec`]).
//!
//! Between Rust frames, unwinding rides on Rust panic unwinding with a private
//! payload, so every intermediate frame guard is dropped (and its frame
//! popped) on the way out. Panics that did not originate from [`signal_exit`]
//! pass through protected regions untouched, after the regions' frames have
//! been popped.
//!
//! Generated code has no unwind tables, so nothing may unwind through it.
//! Helpers it calls run under [`run_native`], which parks any unwind as the
//! thread's pending exit and returns normally. Generated code tests
//! `frame_pending` after each such call and returns early while an exit is
//! pending; the next [`ActiveFrame::exec`] it returns into resumes the unwind.
//! Rust code calling generated code directly must do the same with
//! [`resume_pending`].

pub mod helpers;

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::ptr::{self, NonNull};
use std::thread;

use tracing::{error, trace, warn};

use crate::constants::HostValue;
use crate::error::{BridgeError, BridgeResult};

/// Mask applied to raw exit codes by the host
pub const TAG_MASK: u32 = 0xf;

/// Identity of a protected region
///
/// Exits that carry a target tag land on the nearest frame pushed with the same
/// tag. [`OwnerTag::ANY`] as a target lands on the nearest frame of any tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
#[repr(transparent)]
pub struct OwnerTag(pub u64);

impl OwnerTag {
    /// Wildcard target
    pub const ANY: OwnerTag = OwnerTag(0);

    /// Raw bits as seen by generated code
    pub fn bits(self) -> u64 {
        self.0
    }
}

impl fmt::Display for OwnerTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == OwnerTag::ANY {
            f.write_str("<any>")
        } else {
            write!(f, "{:#x}", self.0)
        }
    }
}

/// Kind of non-local exit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ExitKind {
    /// `return` out of a block to its defining method
    Return = 1,
    /// `break` out of a block to the call that yielded
    Break = 2,
    /// `next` in a block
    Next = 3,
    /// `retry` in a rescue clause
    Retry = 4,
    /// `redo` in a block
    Redo = 5,
    /// Exception raised
    Raise = 6,
    /// `throw` to a matching `catch`
    Throw = 7,
    /// Unrescuable error
    Fatal = 8,
}

impl ExitKind {
    /// Every exit kind in code order
    pub const ALL: [ExitKind; 8] = [
        ExitKind::Return,
        ExitKind::Break,
        ExitKind::Next,
        ExitKind::Retry,
        ExitKind::Redo,
        ExitKind::Raise,
        ExitKind::Throw,
        ExitKind::Fatal,
    ];

    /// Numeric exit code
    pub fn code(self) -> u32 {
        self as u32
    }

    /// Decode a numeric exit code
    pub fn from_code(code: u32) -> BridgeResult<ExitKind> {
        ExitKind::ALL
            .into_iter()
            .find(|kind| kind.code() == code)
            .ok_or(BridgeError::InvalidExitCode(code))
    }

    /// `Raise` and `Fatal` land on the nearest frame whatever its tag
    pub fn ignores_target(self) -> bool {
        matches!(self, ExitKind::Raise | ExitKind::Fatal)
    }

    /// Host constant name (`TAG_RETURN`, ...)
    pub fn constant_name(self) -> &'static str {
        match self {
            ExitKind::Return => "TAG_RETURN",
            ExitKind::Break => "TAG_BREAK",
            ExitKind::Next => "TAG_NEXT",
            ExitKind::Retry => "TAG_RETRY",
            ExitKind::Redo => "TAG_REDO",
            ExitKind::Raise => "TAG_RAISE",
            ExitKind::Throw => "TAG_THROW",
            ExitKind::Fatal => "TAG_FATAL",
        }
    }
}

/// Lifecycle of a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum FrameState {
    /// Pushed, region executing
    Active = 0,
    /// Region finished normally
    Completed = 1,
    /// Region was left through a non-local exit
    Unwound = 2,
}

impl FrameState {
    fn from_code(code: u32) -> FrameState {
        match code {
            1 => FrameState::Completed,
            2 => FrameState::Unwound,
            _ => FrameState::Active,
        }
    }
}

/// Opaque resumption point saved when a frame is pushed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(C)]
pub struct ResumptionToken {
    serial: u64,
    depth: u32,
}

impl ResumptionToken {
    /// Unique (per thread) frame serial
    pub fn serial(&self) -> u64 {
        self.serial
    }

    /// Stack depth of the frame, 1 for the outermost
    pub fn depth(&self) -> u32 {
        self.depth
    }
}

/// One protected region on the control-flow stack
///
/// Shared with generated code, which reads `tag`, `retval`, `prev` and
/// `state` through the `ControlFrame` record of the layout registry.
#[derive(Debug)]
#[repr(C)]
pub struct ControlFlowFrame {
    pub(crate) saved: ResumptionToken,
    pub(crate) tag: OwnerTag,
    pub(crate) retval: u64,
    pub(crate) prev: *mut ControlFlowFrame,
    pub(crate) state: u32,
    pub(crate) exit_code: u32,
    pub(crate) armed: u32,
}

impl ControlFlowFrame {
    /// Saved resumption point
    pub fn token(&self) -> ResumptionToken {
        self.saved
    }

    /// Owner tag the frame was pushed with
    pub fn tag(&self) -> OwnerTag {
        self.tag
    }

    /// Result slot
    pub fn retval(&self) -> u64 {
        self.retval
    }

    /// Current lifecycle state
    pub fn state(&self) -> FrameState {
        FrameState::from_code(self.state)
    }

    /// Exit code of the exit that landed here (0 if none)
    pub fn exit_code(&self) -> u32 {
        self.exit_code
    }

    /// Whether the frame is inside [`ActiveFrame::exec`] and can be resumed
    pub fn is_armed(&self) -> bool {
        self.armed != 0
    }

    fn accepts(&self, kind: ExitKind, target: OwnerTag) -> bool {
        self.is_armed()
            && (kind.ignores_target() || target == OwnerTag::ANY || self.tag == target)
    }
}

thread_local! {
    static CURRENT: Cell<*mut ControlFlowFrame> = const { Cell::new(ptr::null_mut()) };
    static NEXT_SERIAL: Cell<u64> = const { Cell::new(1) };
    static PENDING: RefCell<Option<Box<dyn Any + Send>>> = const { RefCell::new(None) };
}

/// Unwind payload carried from `signal_exit` to the landing frame
struct ExitSignal {
    target_serial: u64,
    kind: ExitKind,
}

/// Result of running a protected region
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The region returned normally with this value
    Completed(u64),
    /// The region was left through a non-local exit landing on its frame
    Unwound {
        /// Exit that landed
        kind: ExitKind,
        /// Value placed in the frame's result slot
        value: u64,
    },
}

impl Outcome {
    /// Final state of the frame
    pub fn state(&self) -> FrameState {
        match self {
            Outcome::Completed(_) => FrameState::Completed,
            Outcome::Unwound { .. } => FrameState::Unwound,
        }
    }

    /// Value returned or carried by the exit
    pub fn value(&self) -> u64 {
        match *self {
            Outcome::Completed(value) | Outcome::Unwound { value, .. } => value,
        }
    }

    /// Host-style state: 0 for normal completion, otherwise the exit code
    pub fn state_code(&self) -> u32 {
        match self {
            Outcome::Completed(_) => 0,
            Outcome::Unwound { kind, .. } => kind.code(),
        }
    }
}

/// Guard for a pushed frame; pops it when dropped
///
/// Not `Send`: a frame belongs to the thread that pushed it.
pub struct ActiveFrame {
    frame: NonNull<ControlFlowFrame>,
    popped: bool,
}

/// Push a new frame on the current thread's stack
pub fn push_frame(tag: OwnerTag) -> ActiveFrame {
    let prev = current_frame();
    // SAFETY: a non-null top of stack is a live frame owned by an ActiveFrame
    let depth = unsafe { prev.as_ref() }.map_or(1, |p| p.saved.depth + 1);
    let serial = NEXT_SERIAL.with(|next| {
        let serial = next.get();
        next.set(serial + 1);
        serial
    });

    let frame = Box::new(ControlFlowFrame {
        saved: ResumptionToken { serial, depth },
        tag,
        retval: HostValue::NIL.bits(),
        prev,
        state: FrameState::Active as u32,
        exit_code: 0,
        armed: 0,
    });
    let frame = NonNull::from(Box::leak(frame));
    CURRENT.with(|current| current.set(frame.as_ptr()));
    trace!(serial, depth, tag = %tag, "push frame");

    ActiveFrame { frame, popped: false }
}

impl ActiveFrame {
    fn frame(&self) -> &ControlFlowFrame {
        // SAFETY: the frame stays allocated until this guard pops it
        unsafe { self.frame.as_ref() }
    }

    fn frame_mut(&mut self) -> &mut ControlFlowFrame {
        // SAFETY: as above; the guard is the only Rust owner
        unsafe { self.frame.as_mut() }
    }

    /// Saved resumption point
    pub fn token(&self) -> ResumptionToken {
        self.frame().saved
    }

    /// Owner tag
    pub fn tag(&self) -> OwnerTag {
        self.frame().tag
    }

    /// Current state
    pub fn state(&self) -> FrameState {
        self.frame().state()
    }

    /// Raw frame pointer for generated code
    pub fn as_ptr(&self) -> *mut ControlFlowFrame {
        self.frame.as_ptr()
    }

    /// Run the protected region
    ///
    /// This is the resumption point: an exit resolved to this frame while
    /// `body` runs returns here as [`Outcome::Unwound`]. Exits aimed further
    /// out, and foreign panics, continue unwinding. An exit left pending by
    /// generated code inside `body` is resumed when `body` returns.
    pub fn exec<F>(&mut self, body: F) -> Outcome
    where
        F: FnOnce() -> u64,
    {
        let serial = self.token().serial;
        self.frame_mut().armed = 1;
        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            let value = body();
            resume_pending();
            value
        }));
        self.frame_mut().armed = 0;
        match result {
            Ok(value) => {
                let frame = self.frame_mut();
                frame.retval = value;
                frame.state = FrameState::Completed as u32;
                Outcome::Completed(value)
            }
            Err(payload) => {
                self.frame_mut().state = FrameState::Unwound as u32;
                match payload.downcast::<ExitSignal>() {
                    Ok(signal) if signal.target_serial == serial => {
                        trace!(serial, kind = ?signal.kind, "exit landed");
                        Outcome::Unwound {
                            kind: signal.kind,
                            value: self.frame().retval,
                        }
                    }
                    Ok(signal) => panic::resume_unwind(signal),
                    Err(foreign) => panic::resume_unwind(foreign),
                }
            }
        }
    }

    /// Pop the frame, checking it is the top of the stack
    pub fn pop(mut self) -> BridgeResult<FrameState> {
        let result = self.pop_inner();
        self.popped = true;
        result
    }

    fn pop_inner(&mut self) -> BridgeResult<FrameState> {
        let raw = self.frame.as_ptr();
        let top = current_frame();
        if top != raw {
            // SAFETY: a non-null top of stack is a live frame
            let top_serial = unsafe { top.as_ref() }.map_or(0, |t| t.saved.serial);
            return Err(BridgeError::FrameOrder {
                popped: self.token().serial,
                top: top_serial,
            });
        }

        self.popped = true;
        // SAFETY: allocated by push_frame through Box::leak, freed once here
        let frame = unsafe { Box::from_raw(raw) };
        CURRENT.with(|current| current.set(frame.prev));

        let state = match frame.state() {
            FrameState::Active if thread::panicking() => FrameState::Unwound,
            FrameState::Active => FrameState::Completed,
            done => done,
        };
        trace!(serial = frame.saved.serial, ?state, "pop frame");
        Ok(state)
    }
}

impl Drop for ActiveFrame {
    fn drop(&mut self) {
        if self.popped {
            return;
        }
        if let Err(err) = self.pop_inner() {
            // Frames above still link to this one; leave it allocated.
            error!(%err, "leaking control-flow frame");
            self.popped = true;
        }
    }
}

impl fmt::Debug for ActiveFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActiveFrame")
            .field("token", &self.token())
            .field("tag", &self.tag())
            .field("state", &self.state())
            .finish()
    }
}

/// Push a frame, run `body` inside it, pop it
pub fn protect<F>(tag: OwnerTag, body: F) -> Outcome
where
    F: FnOnce() -> u64,
{
    let mut frame = push_frame(tag);
    let outcome = frame.exec(body);
    if let Err(err) = frame.pop() {
        error!(%err, "protected region left frames on the stack");
    }
    outcome
}

fn find_target(kind: ExitKind, target: OwnerTag) -> Option<NonNull<ControlFlowFrame>> {
    let mut cursor = current_frame();
    while let Some(frame) = NonNull::new(cursor) {
        // SAFETY: every frame reachable from the top of stack is live
        let f = unsafe { frame.as_ref() };
        if f.accepts(kind, target) {
            return Some(frame);
        }
        cursor = f.prev;
    }
    None
}

/// Resolve which frame an exit would land on, without unwinding
pub fn resolve_exit(kind: ExitKind, target: OwnerTag) -> BridgeResult<ResumptionToken> {
    find_target(kind, target)
        // SAFETY: find_target only yields live frames
        .map(|frame| unsafe { frame.as_ref() }.saved)
        .ok_or(BridgeError::UnmatchedExit { kind, target })
}

/// Log `err` and abort the process
pub(crate) fn fatal(err: &BridgeError) -> ! {
    error!(%err, "aborting");
    eprintln!("ludic: fatal: {err}");
    std::process::abort()
}

fn prepare_exit(kind: ExitKind, target: OwnerTag, value: u64) -> ExitSignal {
    let Some(mut frame) = find_target(kind, target) else {
        fatal(&BridgeError::UnmatchedExit { kind, target })
    };

    // SAFETY: live frame, and only this thread touches its stack
    let frame = unsafe { frame.as_mut() };
    frame.retval = value;
    frame.exit_code = kind.code();
    trace!(serial = frame.saved.serial, ?kind, target = %target, "signal exit");
    ExitSignal { target_serial: frame.saved.serial, kind }
}

/// Transfer control to the nearest frame accepting `kind` aimed at `target`
///
/// Only frames inside [`ActiveFrame::exec`] accept exits. `value` is placed
/// in the accepting frame's result slot. An exit nothing accepts is fatal to
/// the process.
pub fn signal_exit(kind: ExitKind, target: OwnerTag, value: u64) -> ! {
    panic::resume_unwind(Box::new(prepare_exit(kind, target, value)))
}

/// Like [`signal_exit`], but leave the exit pending instead of unwinding
pub fn park_exit(kind: ExitKind, target: OwnerTag, value: u64) {
    park(Box::new(prepare_exit(kind, target, value)));
}

fn park(payload: Box<dyn Any + Send>) {
    let replaced = PENDING.with(|pending| pending.borrow_mut().replace(payload));
    if replaced.is_some() {
        warn!("pending exit replaced before it was resumed");
    }
}

/// Whether an exit is pending on this thread
pub fn exit_pending() -> bool {
    PENDING.with(|pending| pending.borrow().is_some())
}

/// Continue unwinding a pending exit, if there is one
pub fn resume_pending() {
    if let Some(payload) = PENDING.with(|pending| pending.borrow_mut().take()) {
        panic::resume_unwind(payload);
    }
}

/// Run a helper called from generated code
///
/// An unwind out of `f` is parked as the pending exit and 0 is returned.
pub fn run_native<F>(f: F) -> u64
where
    F: FnOnce() -> u64,
{
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(value) => value,
        Err(payload) => {
            trace!("parking exit at native boundary");
            park(payload);
            0
        }
    }
}

/// Top of the current thread's stack (null if empty)
pub fn current_frame() -> *mut ControlFlowFrame {
    CURRENT.with(|current| current.get())
}

/// Number of frames on the current thread's stack
pub fn current_depth() -> u32 {
    // SAFETY: a non-null top of stack is a live frame
    unsafe { current_frame().as_ref() }.map_or(0, |f| f.saved.depth)
}

/// Tag of the innermost frame
pub fn current_tag() -> Option<OwnerTag> {
    // SAFETY: as above
    unsafe { current_frame().as_ref() }.map(|f| f.tag)
}

/// Tags on the current thread's stack, innermost first
pub fn stack_tags() -> Vec<OwnerTag> {
    let mut tags = Vec::new();
    let mut cursor = current_frame();
    // SAFETY: every frame reachable from the top of stack is live
    while let Some(f) = unsafe { cursor.as_ref() } {
        tags.push(f.tag);
        cursor = f.prev;
    }
    tags
}

#[cfg(test)]
mod tests {
    use super::*;

    const LOOP1: OwnerTag = OwnerTag(0x11);
    const LOOP2: OwnerTag = OwnerTag(0x22);

    #[test]
    fn test_exit_codes() {
        for kind in ExitKind::ALL {
            assert_eq!(ExitKind::from_code(kind.code()).unwrap(), kind);
            assert!(kind.code() & !TAG_MASK == 0);
        }
        assert_eq!(ExitKind::from_code(0), Err(BridgeError::InvalidExitCode(0)));
        assert_eq!(ExitKind::from_code(9), Err(BridgeError::InvalidExitCode(9)));
        assert_eq!(ExitKind::Fatal.code(), 8);
    }

    #[test]
    fn test_push_pop_returns_to_baseline() {
        assert_eq!(current_depth(), 0);
        let outer = push_frame(LOOP1);
        let inner = push_frame(LOOP2);
        assert_eq!(current_depth(), 2);
        assert_eq!(current_tag(), Some(LOOP2));
        assert_eq!(stack_tags(), vec![LOOP2, LOOP1]);
        assert_eq!(inner.pop().unwrap(), FrameState::Completed);
        assert_eq!(outer.pop().unwrap(), FrameState::Completed);
        assert!(current_frame().is_null());
    }

    #[test]
    fn test_completed_region() {
        let outcome = protect(LOOP1, || 42);
        assert_eq!(outcome, Outcome::Completed(42));
        assert_eq!(outcome.state_code(), 0);
        assert_eq!(current_depth(), 0);
    }

    #[test]
    fn test_next_skips_inner_frame() {
        let mut inner_finished = false;
        let outcome = protect(LOOP1, || {
            protect(LOOP2, || {
                signal_exit(ExitKind::Next, LOOP1, 7);
            });
            inner_finished = true;
            0
        });
        assert!(!inner_finished);
        assert_eq!(outcome, Outcome::Unwound { kind: ExitKind::Next, value: 7 });
        assert_eq!(outcome.state(), FrameState::Unwound);
        assert_eq!(current_depth(), 0);
    }

    #[test]
    fn test_raise_lands_on_nearest_frame() {
        let outer = protect(LOOP1, || {
            let inner = protect(LOOP2, || signal_exit(ExitKind::Raise, LOOP1, 99));
            assert_eq!(inner, Outcome::Unwound { kind: ExitKind::Raise, value: 99 });
            assert_eq!(current_tag(), Some(LOOP1));
            5
        });
        assert_eq!(outer, Outcome::Completed(5));
    }

    #[test]
    fn test_any_target_lands_on_nearest_frame() {
        let outcome = protect(LOOP1, || {
            let inner = protect(LOOP2, || signal_exit(ExitKind::Break, OwnerTag::ANY, 3));
            inner.value() + 1
        });
        assert_eq!(outcome, Outcome::Completed(4));
    }

    #[test]
    fn test_resolve_exit() {
        assert_eq!(
            resolve_exit(ExitKind::Throw, LOOP1),
            Err(BridgeError::UnmatchedExit { kind: ExitKind::Throw, target: LOOP1 })
        );

        let mut outer = push_frame(LOOP1);
        let outer_token = outer.token();
        outer.exec(|| {
            let mut inner = push_frame(LOOP2);
            let inner_token = inner.token();
            inner.exec(|| {
                assert_eq!(resolve_exit(ExitKind::Throw, LOOP1).unwrap(), outer_token);
                assert_eq!(resolve_exit(ExitKind::Raise, LOOP1).unwrap(), inner_token);
                assert!(resolve_exit(ExitKind::Break, OwnerTag(0x33)).is_err());
                0
            });
            0
        });
        drop(outer);
        assert_eq!(current_depth(), 0);
    }

    #[test]
    fn test_only_executing_frames_accept_exits() {
        let frame = push_frame(LOOP1);
        assert!(!unsafe { &*frame.as_ptr() }.is_armed());
        assert!(matches!(
            resolve_exit(ExitKind::Raise, OwnerTag::ANY),
            Err(BridgeError::UnmatchedExit { .. })
        ));
        drop(frame);

        let outcome = protect(LOOP1, || {
            let _idle = push_frame(LOOP1);
            assert_eq!(current_depth(), 2);
            signal_exit(ExitKind::Break, LOOP1, 5)
        });
        assert_eq!(outcome, Outcome::Unwound { kind: ExitKind::Break, value: 5 });
        assert_eq!(current_depth(), 0);
    }

    #[test]
    fn test_parked_exit_resumes_in_exec() {
        let outcome = protect(LOOP1, || {
            let inner = protect(LOOP2, || {
                park_exit(ExitKind::Next, LOOP1, 8);
                assert!(exit_pending());
                1
            });
            unreachable!("inner region returned {inner:?}")
        });
        assert_eq!(outcome, Outcome::Unwound { kind: ExitKind::Next, value: 8 });
        assert!(!exit_pending());
        assert_eq!(current_depth(), 0);
    }

    #[test]
    fn test_run_native_parks_unwind() {
        let outcome = protect(LOOP1, || {
            let value = run_native(|| signal_exit(ExitKind::Break, LOOP1, 3));
            assert_eq!(value, 0);
            assert!(exit_pending());
            assert_eq!(current_depth(), 1);
            value
        });
        assert_eq!(outcome, Outcome::Unwound { kind: ExitKind::Break, value: 3 });
        assert!(!exit_pending());

        let result = panic::catch_unwind(|| {
            assert_eq!(run_native(|| panic!("host bug")), 0);
            resume_pending();
        });
        assert_eq!(result.unwrap_err().downcast_ref::<&str>(), Some(&"host bug"));
        assert!(!exit_pending());
    }

    #[test]
    fn test_foreign_panic_passes_through() {
        let result = panic::catch_unwind(|| {
            protect(LOOP1, || protect(LOOP2, || panic!("host bug")).value())
        });
        let payload = result.unwrap_err();
        assert_eq!(payload.downcast_ref::<&str>(), Some(&"host bug"));
        assert_eq!(current_depth(), 0);
    }

    #[test]
    fn test_pop_out_of_order() {
        thread::spawn(|| {
            let outer = push_frame(LOOP1);
            let inner = push_frame(LOOP2);
            let outer_serial = outer.token().serial();
            let err = outer.pop().unwrap_err();
            assert_eq!(
                err,
                BridgeError::FrameOrder { popped: outer_serial, top: inner.token().serial() }
            );
            assert_eq!(inner.pop().unwrap(), FrameState::Completed);
        })
        .join()
        .unwrap();
    }

    #[test]
    fn test_frame_records_result() {
        let mut frame = push_frame(LOOP1);
        let outcome = frame.exec(|| signal_exit(ExitKind::Return, LOOP1, 11));
        assert_eq!(outcome.state_code(), ExitKind::Return.code());
        // SAFETY: still pushed
        let raw = unsafe { &*frame.as_ptr() };
        assert_eq!(raw.retval(), 11);
        assert_eq!(raw.exit_code(), ExitKind::Return.code());
        assert_eq!(frame.pop().unwrap(), FrameState::Unwound);
    }
}

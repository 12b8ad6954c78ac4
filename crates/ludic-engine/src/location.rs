//! Source-location instrumentation
//!
//! Before a generated call that can raise, the translator emits stores that
//! point the runtime's "current line / file / node" state at the node being
//! translated, so a diagnostic raised by that call reports the right place.

use std::ffi::{c_char, c_void, CStr, CString};
use std::ptr;
use std::sync::atomic::{AtomicI32, AtomicPtr, Ordering};
use std::sync::Arc;

use cranelift_codegen::ir::{types, InstBuilder};
use parking_lot::Mutex;
use tracing::trace;

use crate::codegen::FunctionEmitter;
use crate::config::HostAbi;
use crate::error::{BridgeError, BridgeResult};

/// A translated source node's location
#[derive(Debug, PartialEq, Eq)]
pub struct SourceNode {
    line: i32,
    file: CString,
    id: u64,
}

impl SourceNode {
    /// New shared node
    pub fn new(line: i32, file: &str, id: u64) -> BridgeResult<Arc<SourceNode>> {
        let file = CString::new(file).map_err(|_| BridgeError::TypeMismatch {
            what: "file",
            expected: "string without NUL".to_string(),
            found: "string with NUL".to_string(),
        })?;
        Ok(Arc::new(SourceNode { line, file, id }))
    }

    /// Line number
    pub fn line(&self) -> i32 {
        self.line
    }

    /// File name
    pub fn file(&self) -> &CStr {
        &self.file
    }

    /// Host node identity
    pub fn id(&self) -> u64 {
        self.id
    }
}

/// The bridge's own current-location state, laid out for generated code
#[repr(C)]
#[derive(Debug)]
pub struct LocationState {
    /// Current line
    pub line: AtomicI32,
    /// Current file (NUL-terminated)
    pub file: AtomicPtr<c_char>,
    /// Current node
    pub node: AtomicPtr<c_void>,
}

static BRIDGE_LOCATION: LocationState = LocationState {
    line: AtomicI32::new(0),
    file: AtomicPtr::new(ptr::null_mut()),
    node: AtomicPtr::new(ptr::null_mut()),
};

/// Node whose location was last set from the host side
static HOST_SET: Mutex<Option<Arc<SourceNode>>> = Mutex::new(None);

/// Address of the bridge-owned location state (`current_location` symbol)
pub extern "C" fn location_state() -> *const LocationState {
    &BRIDGE_LOCATION
}

/// Addresses generated location updates store to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocationSlots {
    /// `int` current line
    pub line: usize,
    /// `const char *` current file
    pub file: usize,
    /// Current node pointer, if the runtime keeps one
    pub node: Option<usize>,
}

impl LocationSlots {
    /// Slots of the bridge's own state
    pub fn bridge_owned() -> Self {
        LocationSlots {
            line: BRIDGE_LOCATION.line.as_ptr() as usize,
            file: BRIDGE_LOCATION.file.as_ptr() as usize,
            node: Some(BRIDGE_LOCATION.node.as_ptr() as usize),
        }
    }
}

/// Snapshot of the bridge-owned location state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceLocationMarker {
    /// Current line
    pub line: i32,
    /// Current file, null if never set
    pub file: *const c_char,
    /// Current node, null if not tracked
    pub node: *const c_void,
}

impl SourceLocationMarker {
    /// File name as a string
    ///
    /// # Safety
    ///
    /// The node the marker was written from must still be alive.
    pub unsafe fn file_name(&self) -> Option<String> {
        if self.file.is_null() {
            return None;
        }
        // SAFETY: upheld by the caller
        Some(unsafe { CStr::from_ptr(self.file) }.to_string_lossy().into_owned())
    }
}

/// Emit stores updating the current location to `node`'s
///
/// The node is retained by the function being built, so the stored file and
/// node pointers stay valid for as long as the compiled code exists.
pub fn emit_location_update(
    emitter: &mut FunctionEmitter<'_>,
    slots: &LocationSlots,
    abi: HostAbi,
    node: &Arc<SourceNode>,
) {
    let line = emitter.builder().ins().iconst(types::I32, node.line as i64);
    emitter.store_absolute(slots.line, line);

    let file = emitter.iconst_ptr(node.file.as_ptr() as usize as u64);
    emitter.store_absolute(slots.file, file);

    if abi.tracks_current_node() {
        if let Some(node_slot) = slots.node {
            let node_ptr = emitter.iconst_ptr(Arc::as_ptr(node) as usize as u64);
            emitter.store_absolute(node_slot, node_ptr);
        }
    }

    emitter.retain(node.clone());
    trace!(line = node.line, id = node.id, %abi, "emit location update");
}

/// Read the bridge-owned location state
pub fn current_location() -> SourceLocationMarker {
    SourceLocationMarker {
        line: BRIDGE_LOCATION.line.load(Ordering::Acquire),
        file: BRIDGE_LOCATION.file.load(Ordering::Acquire),
        node: BRIDGE_LOCATION.node.load(Ordering::Acquire),
    }
}

/// Set the bridge-owned location from host code
///
/// The node stays alive until the next call.
pub fn set_current_location(node: &Arc<SourceNode>, abi: HostAbi) {
    let mut held = HOST_SET.lock();
    BRIDGE_LOCATION.line.store(node.line, Ordering::Release);
    BRIDGE_LOCATION
        .file
        .store(node.file.as_ptr() as *mut c_char, Ordering::Release);
    let node_ptr = if abi.tracks_current_node() {
        Arc::as_ptr(node) as *mut c_void
    } else {
        ptr::null_mut()
    };
    BRIDGE_LOCATION.node.store(node_ptr, Ordering::Release);
    *held = Some(node.clone());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_nul_in_file() {
        assert!(matches!(
            SourceNode::new(1, "a\0b", 0),
            Err(BridgeError::TypeMismatch { what: "file", .. })
        ));
    }

    #[test]
    fn test_slots_point_at_state() {
        let slots = LocationSlots::bridge_owned();
        let state = location_state();
        assert_eq!(slots.line, state as usize);
        assert!(slots.node.is_some());
    }

    #[test]
    fn test_host_side_set() {
        let node = SourceNode::new(12, "lib/widget.rb", 0xabc).unwrap();
        set_current_location(&node, HostAbi::FrameScope);
        let marker = current_location();
        assert_eq!(marker.line, 12);
        assert_eq!(marker.node, Arc::as_ptr(&node) as *const c_void);
        assert_eq!(unsafe { marker.file_name() }.as_deref(), Some("lib/widget.rb"));

        set_current_location(&node, HostAbi::CallFrame);
        assert!(current_location().node.is_null());
    }
}

//! Function pointer registry
//!
//! Symbolic name to raw callable address. Filled once at bootstrap from the
//! host's services and the bridge's own helpers, read-only afterward. The
//! registry does no signature checking; callers build calls with a signature
//! they supply (or borrow one from the [`catalogue`]).

pub mod catalogue;

use std::ffi::c_void;
use std::fmt;

use cranelift_codegen::ir::{Signature, Type};
use cranelift_codegen::isa::CallConv;
use rustc_hash::FxHashMap;
use serde::Serialize;
use tracing::{debug, warn};

use crate::config::HostAbi;
use crate::control::helpers::{frame_current, frame_pending, frame_protect, frame_signal};
use crate::error::{BridgeError, BridgeResult};
use crate::invoke::{block_pass_call, block_pass_fcall};
use crate::location::location_state;

use self::catalogue::{Provider, SERVICE_CATALOGUE};

/// Raw address of a callable (or of runtime state)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[repr(transparent)]
pub struct FunctionAddress(pub usize);

impl FunctionAddress {
    /// From a raw pointer
    pub fn from_ptr<T>(ptr: *const T) -> Self {
        FunctionAddress(ptr as usize)
    }

    /// Raw pointer
    pub fn as_ptr(self) -> *const c_void {
        self.0 as *const c_void
    }

    /// Address as an integer
    pub fn get(self) -> usize {
        self.0
    }
}

impl fmt::Display for FunctionAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// `name -> address`
#[derive(Debug, Clone, Default)]
pub struct FunctionRegistry {
    entries: FxHashMap<String, FunctionAddress>,
}

impl FunctionRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a name (overwrites)
    pub fn register_pointer(&mut self, name: &str, address: FunctionAddress) {
        self.entries.insert(name.to_string(), address);
    }

    /// Address bound to a name
    pub fn pointer_of(&self, name: &str) -> BridgeResult<FunctionAddress> {
        self.entries
            .get(name)
            .copied()
            .ok_or_else(|| BridgeError::UnknownFunction { name: name.to_string() })
    }

    /// Whether a name is bound
    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Bound names, sorted
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.entries.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Advisory signature from the catalogue, for catalogued code addresses
    pub fn signature_of(
        &self,
        name: &str,
        call_conv: CallConv,
        pointer_type: Type,
    ) -> Option<Signature> {
        let spec = catalogue::find(name)?.sig?;
        Some(spec.to_signature(call_conv, pointer_type))
    }

    /// Number of bound names
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is bound
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Service addresses supplied by the embedding host
#[derive(Debug, Clone, Default)]
pub struct HostServices {
    entries: Vec<(String, FunctionAddress)>,
}

impl HostServices {
    /// No services
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one service
    pub fn provide(&mut self, name: &str, address: FunctionAddress) -> &mut Self {
        self.entries.push((name.to_string(), address));
        self
    }

    /// Builder form of [`HostServices::provide`]
    pub fn with(mut self, name: &str, address: FunctionAddress) -> Self {
        self.provide(name, address);
        self
    }

    /// Address supplied for a name (last one wins)
    pub fn get(&self, name: &str) -> Option<FunctionAddress> {
        self.entries.iter().rev().find(|(n, _)| n == name).map(|(_, a)| *a)
    }

    /// Every supplied `(name, address)`
    pub fn iter(&self) -> impl Iterator<Item = (&str, FunctionAddress)> {
        self.entries.iter().map(|(n, a)| (n.as_str(), *a))
    }
}

/// Helpers implemented by this crate, under their registry names
pub fn bridge_helpers() -> [(&'static str, FunctionAddress); 7] {
    [
        ("frame_protect", FunctionAddress(frame_protect as *const () as usize)),
        ("frame_signal", FunctionAddress(frame_signal as *const () as usize)),
        ("frame_pending", FunctionAddress(frame_pending as *const () as usize)),
        ("frame_current", FunctionAddress(frame_current as *const () as usize)),
        ("block_pass_call", FunctionAddress(block_pass_call as *const () as usize)),
        ("block_pass_fcall", FunctionAddress(block_pass_fcall as *const () as usize)),
        ("current_location", FunctionAddress(location_state as *const () as usize)),
    ]
}

/// Build the registry for a host ABI
///
/// Every host-supplied address is registered. Catalogued services for `abi`
/// that the host did not supply are skipped with a warning. Bridge helpers
/// are registered last and cannot be replaced by the host.
pub fn bootstrap_functions(abi: HostAbi, host: &HostServices) -> FunctionRegistry {
    let mut registry = FunctionRegistry::new();

    for (name, address) in host.iter() {
        match catalogue::find(name) {
            Some(entry) if entry.provider == Provider::Bridge => {
                warn!(name, "host service shadows a bridge helper; ignored");
                continue;
            }
            Some(entry) if !entry.scope.includes(abi) => {
                debug!(name, %abi, "registering service outside its ABI");
            }
            None => debug!(name, "registering uncatalogued service"),
            Some(_) => {}
        }
        registry.register_pointer(name, address);
    }

    let missing: Vec<&str> = catalogue::host_services(abi)
        .map(|entry| entry.name)
        .filter(|name| !registry.contains(name))
        .collect();
    if !missing.is_empty() {
        warn!(%abi, count = missing.len(), ?missing, "host did not provide services");
    }

    for (name, address) in bridge_helpers() {
        registry.register_pointer(name, address);
    }

    debug!(
        %abi,
        functions = registry.len(),
        catalogue = SERVICE_CATALOGUE.len(),
        "function bootstrap"
    );
    registry
}

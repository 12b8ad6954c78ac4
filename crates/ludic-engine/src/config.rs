//! Host build configuration
//!
//! Everything ABI-specific is keyed off a [`BuildConfig`] resolved once at
//! startup. The rest of the crate never branches on ABI identity except the
//! bootstrap tables and the few places that pick between two shapes of the
//! same thing (record tables, constant codes, synthetic call trees).

use std::collections::BTreeSet;
use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{BridgeError, BridgeResult};

/// Which family of host runtime internals the generated code talks to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HostAbi {
    /// Tree-walking interpreter with global frame and scope pointers
    FrameScope,
    /// Bytecode VM with per-thread control frames and an instruction pointer
    CallFrame,
}

impl HostAbi {
    /// All known ABIs
    pub const ALL: [HostAbi; 2] = [HostAbi::FrameScope, HostAbi::CallFrame];

    /// Whether the runtime keeps a "current node" alongside line and file
    pub fn tracks_current_node(self) -> bool {
        matches!(self, HostAbi::FrameScope)
    }

    /// Stable short name (as used in config files and on the command line)
    pub fn name(self) -> &'static str {
        match self {
            HostAbi::FrameScope => "frame-scope",
            HostAbi::CallFrame => "call-frame",
        }
    }

    /// Parse a short name
    pub fn from_name(name: &str) -> Option<HostAbi> {
        HostAbi::ALL.into_iter().find(|abi| abi.name() == name)
    }
}

impl fmt::Display for HostAbi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Pointer width of the host build
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub enum PointerWidth {
    /// 4-byte pointers
    W32,
    /// 8-byte pointers
    W64,
}

impl PointerWidth {
    /// Pointer width of the host triple the JIT targets
    pub fn host() -> PointerWidth {
        PointerWidth::of_triple(&target_lexicon::HOST).unwrap_or(PointerWidth::W64)
    }

    /// Pointer width of a target triple, if it is one a host build can have
    pub fn of_triple(triple: &target_lexicon::Triple) -> Option<PointerWidth> {
        match triple.pointer_width() {
            Ok(target_lexicon::PointerWidth::U32) => Some(PointerWidth::W32),
            Ok(target_lexicon::PointerWidth::U64) => Some(PointerWidth::W64),
            _ => None,
        }
    }

    /// Pointer size in bytes
    pub fn bytes(self) -> usize {
        match self {
            PointerWidth::W32 => 4,
            PointerWidth::W64 => 8,
        }
    }

    /// Pointer size in bits
    pub fn bits(self) -> u32 {
        self.bytes() as u32 * 8
    }
}

impl TryFrom<u32> for PointerWidth {
    type Error = String;

    fn try_from(bits: u32) -> Result<Self, Self::Error> {
        match bits {
            32 => Ok(PointerWidth::W32),
            64 => Ok(PointerWidth::W64),
            other => Err(format!("unsupported pointer width {other}")),
        }
    }
}

impl From<PointerWidth> for u32 {
    fn from(width: PointerWidth) -> u32 {
        width.bits()
    }
}

/// Optional record members whose presence depends on how the host was built
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LayoutFeature {
    /// `RObject.iv_tbl`
    ObjectIvTable,
    /// `RClass.iv_tbl`
    ClassIvTable,
    /// `RClass.super`
    ClassSuper,
    /// `RHash.tbl`
    HashTable,
    /// `RRegexp.len`
    RegexpLen,
    /// `RRegexp.str`
    RegexpSource,
    /// The `FRAME` record exists
    FrameRecord,
    /// The `SCOPE` record exists
    ScopeRecord,
}

impl LayoutFeature {
    /// Members present in a stock build of `abi`
    pub fn defaults_for(abi: HostAbi) -> &'static [LayoutFeature] {
        match abi {
            HostAbi::FrameScope => &[
                LayoutFeature::ObjectIvTable,
                LayoutFeature::ClassIvTable,
                LayoutFeature::ClassSuper,
                LayoutFeature::HashTable,
                LayoutFeature::RegexpLen,
                LayoutFeature::RegexpSource,
                LayoutFeature::FrameRecord,
                LayoutFeature::ScopeRecord,
            ],
            HostAbi::CallFrame => &[],
        }
    }
}

/// Resolved host build configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "ConfigFile")]
pub struct BuildConfig {
    /// Runtime family
    pub abi: HostAbi,
    /// Pointer width of the host build
    pub pointer_width: PointerWidth,
    /// Optional members present in this build
    pub features: BTreeSet<LayoutFeature>,
}

/// A configuration file; omitted keys take the ABI's defaults
#[derive(Deserialize)]
struct ConfigFile {
    abi: HostAbi,
    pointer_width: Option<PointerWidth>,
    features: Option<BTreeSet<LayoutFeature>>,
}

impl From<ConfigFile> for BuildConfig {
    fn from(file: ConfigFile) -> Self {
        let mut config = BuildConfig::for_abi(file.abi);
        if let Some(width) = file.pointer_width {
            config.pointer_width = width;
        }
        if let Some(features) = file.features {
            config.features = features;
        }
        config
    }
}

impl BuildConfig {
    /// Defaults for an ABI on the current machine
    pub fn for_abi(abi: HostAbi) -> Self {
        BuildConfig {
            abi,
            pointer_width: PointerWidth::host(),
            features: LayoutFeature::defaults_for(abi).iter().copied().collect(),
        }
    }

    /// Same configuration with a different pointer width
    pub fn with_pointer_width(mut self, width: PointerWidth) -> Self {
        self.pointer_width = width;
        self
    }

    /// Whether an optional member is present
    pub fn has(&self, feature: LayoutFeature) -> bool {
        self.features.contains(&feature)
    }

    /// Parse a TOML document:
    ///
    /// ```toml
    /// abi = "frame-scope"
    /// pointer_width = 64
    /// features = ["class-super", "hash-table"]
    /// ```
    pub fn from_toml_str(source: &str) -> BridgeResult<Self> {
        toml::from_str(source).map_err(|e| BridgeError::Config(e.to_string()))
    }

    /// Read a TOML configuration file
    pub fn load(path: impl AsRef<Path>) -> BridgeResult<Self> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path)
            .map_err(|e| BridgeError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_toml_str(&source)
    }

    /// Serialize back to TOML
    pub fn to_toml_string(&self) -> BridgeResult<String> {
        toml::to_string(self).map_err(|e| BridgeError::Config(e.to_string()))
    }
}

impl Default for BuildConfig {
    fn default() -> Self {
        BuildConfig::for_abi(HostAbi::CallFrame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_per_abi() {
        let fs = BuildConfig::for_abi(HostAbi::FrameScope);
        assert!(fs.has(LayoutFeature::FrameRecord));
        assert!(fs.has(LayoutFeature::ObjectIvTable));

        let cf = BuildConfig::for_abi(HostAbi::CallFrame);
        assert!(cf.features.is_empty());
        assert_eq!(cf.pointer_width, PointerWidth::host());
    }

    #[test]
    fn test_parse_toml() {
        let config = BuildConfig::from_toml_str(
            r#"
            abi = "frame-scope"
            pointer_width = 32
            features = ["class-super", "hash-table"]
            "#,
        )
        .unwrap();
        assert_eq!(config.abi, HostAbi::FrameScope);
        assert_eq!(config.pointer_width, PointerWidth::W32);
        assert!(config.has(LayoutFeature::ClassSuper));
        assert!(!config.has(LayoutFeature::FrameRecord));
    }

    #[test]
    fn test_parse_toml_defaults_width_and_features() {
        let config = BuildConfig::from_toml_str("abi = \"call-frame\"").unwrap();
        assert_eq!(config.pointer_width, PointerWidth::host());
        assert!(config.features.is_empty());

        let config = BuildConfig::from_toml_str("abi = \"frame-scope\"").unwrap();
        assert_eq!(config, BuildConfig::for_abi(HostAbi::FrameScope));
        assert!(config.has(LayoutFeature::FrameRecord));
        assert!(config.has(LayoutFeature::ClassSuper));
    }

    #[test]
    fn test_empty_feature_list_is_kept() {
        let config = BuildConfig::from_toml_str("abi = \"frame-scope\"\nfeatures = []").unwrap();
        assert!(config.features.is_empty());
    }

    #[test]
    fn test_host_width_matches_target() {
        assert_eq!(PointerWidth::host().bytes(), std::mem::size_of::<usize>());
    }

    #[test]
    fn test_rejects_bad_width() {
        let err =
            BuildConfig::from_toml_str("abi = \"call-frame\"\npointer_width = 16").unwrap_err();
        assert!(matches!(err, BridgeError::Config(_)));
    }

    #[test]
    fn test_rejects_unknown_abi() {
        assert!(BuildConfig::from_toml_str("abi = \"stack-machine\"").is_err());
    }

    #[test]
    fn test_toml_round_trip() {
        let config =
            BuildConfig::for_abi(HostAbi::FrameScope).with_pointer_width(PointerWidth::W32);
        let text = config.to_toml_string().unwrap();
        assert_eq!(BuildConfig::from_toml_str(&text).unwrap(), config);
    }

    #[test]
    fn test_abi_names() {
        for abi in HostAbi::ALL {
            assert_eq!(HostAbi::from_name(abi.name()), Some(abi));
        }
        assert_eq!(HostAbi::from_name("nope"), None);
    }
}

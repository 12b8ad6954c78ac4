//! Subcommands

pub mod constants;
pub mod info;
pub mod layout;
pub mod services;

use std::path::PathBuf;

use anyhow::Context;
use clap::Args;
use ludic_engine::{BuildConfig, HostAbi, PointerWidth};

/// Which host build to describe
#[derive(Args, Debug)]
pub struct TargetArgs {
    /// Host runtime family (`frame-scope` or `call-frame`)
    #[arg(long)]
    pub abi: Option<String>,
    /// Pointer width in bits (32 or 64)
    #[arg(long)]
    pub width: Option<u32>,
    /// Build configuration file (TOML)
    #[arg(long)]
    pub config: Option<PathBuf>,
}

impl TargetArgs {
    /// Resolve the configuration: file first, then flags on top
    pub fn resolve(&self) -> anyhow::Result<BuildConfig> {
        let abi = match &self.abi {
            Some(name) => Some(HostAbi::from_name(name).with_context(|| {
                format!("unknown ABI `{}` (expected frame-scope or call-frame)", name)
            })?),
            None => None,
        };

        let mut config = match &self.config {
            Some(path) => BuildConfig::load(path)?,
            None => BuildConfig::for_abi(abi.unwrap_or(HostAbi::CallFrame)),
        };
        if let Some(abi) = abi {
            if abi != config.abi {
                config = BuildConfig::for_abi(abi).with_pointer_width(config.pointer_width);
            }
        }
        if let Some(bits) = self.width {
            let width = PointerWidth::try_from(bits).map_err(anyhow::Error::msg)?;
            config = config.with_pointer_width(width);
        }
        tracing::debug!(?config, "resolved build configuration");
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn args(abi: Option<&str>, width: Option<u32>, config: Option<PathBuf>) -> TargetArgs {
        TargetArgs { abi: abi.map(str::to_string), width, config }
    }

    #[test]
    fn test_defaults_to_call_frame_at_host_width() {
        let config = args(None, None, None).resolve().unwrap();
        assert_eq!(config, BuildConfig::for_abi(HostAbi::CallFrame));
    }

    #[test]
    fn test_flags() {
        let config = args(Some("frame-scope"), Some(32), None).resolve().unwrap();
        assert_eq!(config.abi, HostAbi::FrameScope);
        assert_eq!(config.pointer_width, PointerWidth::W32);

        assert!(args(Some("stack"), None, None).resolve().is_err());
        assert!(args(None, Some(16), None).resolve().is_err());
    }

    #[test]
    fn test_width_overrides_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "abi = \"frame-scope\"\npointer_width = 64\nfeatures = [\"class-super\"]"
        )
        .unwrap();

        let config = args(None, Some(32), Some(file.path().to_path_buf())).resolve().unwrap();
        assert_eq!(config.abi, HostAbi::FrameScope);
        assert_eq!(config.pointer_width, PointerWidth::W32);
        assert_eq!(config.features.len(), 1);
    }
}

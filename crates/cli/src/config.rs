//! Settings from the optional config file, overridden by flags.

use anyhow::Context;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tapnat_net::{Backend, DEFAULT_MTU, EngineConfig};

/// Contents of a TOML config file. Every key is optional.
#[derive(Debug, Default, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    pub mtu: Option<u32>,
    pub enable_ipv6: Option<bool>,
    pub host_loopback: Option<bool>,
    pub helper: Option<PathBuf>,
}

impl FileConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("invalid config file {}", path.display()))
    }

    pub fn parse(text: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(text)?)
    }
}

/// Values given on the command line. `None`/`false` means "not given".
#[derive(Debug, Default)]
pub struct Overrides {
    pub mtu: Option<u32>,
    pub enable_ipv6: bool,
    pub disable_host_loopback: bool,
    pub helper: Option<PathBuf>,
}

#[derive(Debug, PartialEq)]
pub struct Settings {
    pub mtu: u32,
    pub enable_ipv6: bool,
    pub host_loopback: bool,
    pub helper: Option<PathBuf>,
}

impl Settings {
    pub fn merge(file: FileConfig, flags: Overrides) -> Self {
        Self {
            mtu: flags.mtu.or(file.mtu).unwrap_or(DEFAULT_MTU),
            enable_ipv6: flags.enable_ipv6 || file.enable_ipv6.unwrap_or(false),
            host_loopback: !flags.disable_host_loopback && file.host_loopback.unwrap_or(true),
            helper: flags.helper.or(file.helper),
        }
    }

    pub fn backend(&self) -> Backend {
        match &self.helper {
            Some(program) => Backend::Helper {
                program: program.clone(),
            },
            None => Backend::UserNat(
                EngineConfig::new(self.mtu, self.enable_ipv6).host_loopback(self.host_loopback),
            ),
        }
    }
}

//! Target platforms (`os/arch`).

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Result, ShipyardError};

/// Platforms the release train knows how to build.
pub const SUPPORTED_PLATFORMS: &[&str] = &["linux/amd64", "linux/arm64"];

/// An `os/arch` pair drawn from [`SUPPORTED_PLATFORMS`].
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Platform {
    os: String,
    arch: String,
}

impl Platform {
    /// `linux/amd64`.
    pub fn primary() -> Self {
        Self {
            os: "linux".to_string(),
            arch: "amd64".to_string(),
        }
    }

    /// Parse `os/arch` and check it against the supported set.
    pub fn parse(input: &str) -> Result<Self> {
        let (os, arch) = input.trim().split_once('/').ok_or_else(|| {
            ShipyardError::Configuration(format!("platform must be os/arch, got '{input}'"))
        })?;
        if os.is_empty() || arch.is_empty() {
            return Err(ShipyardError::Configuration(format!(
                "platform must be os/arch, got '{input}'"
            )));
        }
        let platform = Self {
            os: os.to_string(),
            arch: arch.to_string(),
        };
        if !platform.is_supported() {
            return Err(ShipyardError::Configuration(format!(
                "unsupported platform '{platform}', expected one of {}",
                SUPPORTED_PLATFORMS.join(", ")
            )));
        }
        Ok(platform)
    }

    /// Parse a comma-separated list, preserving order and dropping duplicates.
    pub fn parse_list(input: &str) -> Result<Vec<Self>> {
        let mut out: Vec<Self> = Vec::new();
        for part in input.split(',').filter(|p| !p.trim().is_empty()) {
            let platform = Self::parse(part)?;
            if !out.contains(&platform) {
                out.push(platform);
            }
        }
        if out.is_empty() {
            return Err(ShipyardError::Configuration(
                "platform list must not be empty".to_string(),
            ));
        }
        Ok(out)
    }

    /// Build from a bare architecture, assuming linux.
    pub fn from_arch(arch: &str) -> Result<Self> {
        Self::parse(&format!("linux/{arch}"))
    }

    pub fn os(&self) -> &str {
        &self.os
    }

    pub fn arch(&self) -> &str {
        &self.arch
    }

    pub fn is_supported(&self) -> bool {
        SUPPORTED_PLATFORMS.contains(&self.to_string().as_str())
    }

    pub fn is_primary(&self) -> bool {
        *self == Self::primary()
    }

    /// `linux-amd64`: path-safe form used in storage keys and asset groups.
    pub fn path_segment(&self) -> String {
        format!("{}-{}", self.os, self.arch)
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.os, self.arch)
    }
}

impl FromStr for Platform {
    type Err = ShipyardError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Platform {
    type Error = ShipyardError;

    fn try_from(s: String) -> Result<Self> {
        Self::parse(&s)
    }
}

impl From<Platform> for String {
    fn from(p: Platform) -> Self {
        p.to_string()
    }
}

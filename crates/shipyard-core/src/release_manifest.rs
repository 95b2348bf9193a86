//! `release.json` model.
//!
//! Only the parts the release train reads are modelled; unknown fields are
//! ignored.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Result, ShipyardError};
use crate::versions::VersionPair;

/// Image name whose versions come from the ops-manager mapping.
pub const AGENT_IMAGE: &str = "mongodb-agent";

/// Line key used for the cloud-manager baseline pair.
pub const BASELINE_LINE: &str = "cloud_manager";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseManifest {
    #[serde(rename = "supportedImages", default)]
    pub supported_images: BTreeMap<String, SupportedImage>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SupportedImage {
    #[serde(default)]
    pub versions: Vec<String>,

    #[serde(default)]
    pub variants: Vec<String>,

    #[serde(rename = "opsManagerMapping", default, skip_serializing_if = "Option::is_none")]
    pub ops_manager_mapping: Option<OpsManagerMapping>,
}

/// Agent/tools versions per ops-manager release, plus the cloud-manager tier.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpsManagerMapping {
    #[serde(default)]
    pub cloud_manager: Option<String>,

    #[serde(default)]
    pub cloud_manager_tools: Option<String>,

    #[serde(default)]
    pub ops_manager: BTreeMap<String, AgentToolsPair>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentToolsPair {
    pub agent_version: String,
    pub tools_version: String,
}

/// One buildable entry of an image, with the key its major line is read from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestEntry {
    /// Version whose major component groups this entry (ops-manager version for agents).
    pub line_key: String,
    pub pair: VersionPair,
}

impl ReleaseManifest {
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            ShipyardError::Configuration(format!(
                "cannot read release manifest {}: {e}",
                path.display()
            ))
        })?;
        Self::from_json(&raw)
    }

    pub fn image(&self, image: &str) -> Result<&SupportedImage> {
        self.supported_images.get(image).ok_or_else(|| {
            ShipyardError::Configuration(format!("image '{image}' is not in the release manifest"))
        })
    }

    /// Every entry referenced for `image`, in manifest order, without the baseline.
    pub fn entries(&self, image: &str) -> Result<Vec<ManifestEntry>> {
        let supported = self.image(image)?;
        match &supported.ops_manager_mapping {
            Some(mapping) => Ok(mapping
                .ops_manager
                .iter()
                .map(|(om_version, pair)| ManifestEntry {
                    line_key: om_version.clone(),
                    pair: VersionPair::with_tooling(&pair.agent_version, &pair.tools_version),
                })
                .collect()),
            None => Ok(supported
                .versions
                .iter()
                .map(|v| ManifestEntry {
                    line_key: v.clone(),
                    pair: VersionPair::new(v),
                })
                .collect()),
        }
    }

    /// The long-lived service tier pair, when the image declares one.
    pub fn baseline(&self, image: &str) -> Result<Option<VersionPair>> {
        let supported = self.image(image)?;
        Ok(supported.ops_manager_mapping.as_ref().and_then(|m| {
            m.cloud_manager.as_ref().map(|agent| match &m.cloud_manager_tools {
                Some(tools) => VersionPair::with_tooling(agent, tools),
                None => VersionPair::new(agent),
            })
        }))
    }
}

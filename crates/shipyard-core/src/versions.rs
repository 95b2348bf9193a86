//! Version matrix resolution.
//!
//! Turns a scenario plus `release.json` into the ordered, deduplicated list
//! of [`VersionPair`]s to build.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Result, ShipyardError};
use crate::release_manifest::{ManifestEntry, ReleaseManifest};
use crate::scenario::BuildScenario;

// ---------------------------------------------------------------------------
// Semver helpers (manual, no external dep)
// ---------------------------------------------------------------------------

/// Parsed version: at least MAJOR.MINOR.PATCH, optional extra numeric
/// components (agent build numbers), optional pre-release suffix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Semver {
    numbers: Vec<u64>,
    pre: Option<String>,
}

impl Semver {
    pub fn parse(input: &str) -> Option<Self> {
        let (version_part, pre) = match input.split_once('-') {
            Some((v, p)) if !p.is_empty() => (v, Some(p.to_string())),
            Some(_) => return None,
            None => (input, None),
        };

        let numbers = version_part
            .split('.')
            .map(|part| part.parse::<u64>().ok())
            .collect::<Option<Vec<_>>>()?;
        if numbers.len() < 3 {
            return None;
        }
        Some(Self { numbers, pre })
    }

    pub fn major(&self) -> u64 {
        self.numbers[0]
    }

    /// Compare two versions. Pre-release < release for equal numbers.
    pub fn cmp_version(&self, other: &Self) -> Ordering {
        let numeric = self.numbers.cmp(&other.numbers);
        if numeric != Ordering::Equal {
            return numeric;
        }
        match (&self.pre, &other.pre) {
            (None, None) => Ordering::Equal,
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (Some(a), Some(b)) => cmp_prerelease(a, b),
        }
    }
}

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
enum Chunk<'a> {
    Number(u64),
    Text(&'a str),
}

/// Digit and non-digit runs of one identifier.
fn chunks(identifier: &str) -> Vec<Chunk<'_>> {
    let bytes = identifier.as_bytes();
    let mut out = Vec::new();
    let mut start = 0;
    for i in 1..=bytes.len() {
        if i < bytes.len() && bytes[i].is_ascii_digit() == bytes[start].is_ascii_digit() {
            continue;
        }
        let run = &identifier[start..i];
        out.push(match run.parse::<u64>() {
            Ok(n) if bytes[start].is_ascii_digit() => Chunk::Number(n),
            _ => Chunk::Text(run),
        });
        start = i;
    }
    out
}

/// Dot-separated identifiers left to right, digit runs numerically, so
/// `rc2 < rc10` and `rc.2 < rc.10`. A shorter prefix sorts first.
fn cmp_prerelease(a: &str, b: &str) -> Ordering {
    a.split('.').map(chunks).cmp(b.split('.').map(chunks))
}

/// Semantic comparison of two raw version strings.
///
/// Parseable versions sort before unparseable ones; unparseable ones compare
/// lexicographically. Distinct spellings of the same version compare `Equal`.
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    match (Semver::parse(a), Semver::parse(b)) {
        (Some(x), Some(y)) => x.cmp_version(&y),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => a.cmp(b),
    }
}

/// Major line of a version string: semver major, else the first `.` segment.
fn major_line(version: &str) -> String {
    match Semver::parse(version) {
        Some(v) => v.major().to_string(),
        None => version.split('.').next().unwrap_or(version).to_string(),
    }
}

// ---------------------------------------------------------------------------
// VersionPair
// ---------------------------------------------------------------------------

/// One buildable unit: the image version and, for the agent family, the
/// tooling version it bundles. Identity is the pair itself.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VersionPair {
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tooling_version: Option<String>,
}

impl VersionPair {
    pub fn new(version: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            tooling_version: None,
        }
    }

    pub fn with_tooling(version: impl Into<String>, tooling: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            tooling_version: Some(tooling.into()),
        }
    }
}

impl Ord for VersionPair {
    fn cmp(&self, other: &Self) -> Ordering {
        compare_versions(&self.version, &other.version)
            .then_with(|| self.version.cmp(&other.version))
            .then_with(|| match (&self.tooling_version, &other.tooling_version) {
                (Some(a), Some(b)) => compare_versions(a, b).then_with(|| a.cmp(b)),
                (a, b) => a.cmp(b),
            })
    }
}

impl PartialOrd for VersionPair {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for VersionPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.tooling_version {
            Some(tooling) => write!(f, "{} (tools {})", self.version, tooling),
            None => f.write_str(&self.version),
        }
    }
}

// ---------------------------------------------------------------------------
// Resolution
// ---------------------------------------------------------------------------

/// Resolve the versions of `image` to build.
///
/// * `pin` set: exactly the matching pair, or `NotFound`.
/// * Release scenario or `all_artifacts`: every pair, plus the baseline.
/// * Otherwise: the highest pair per major line, plus the baseline.
///
/// The result is sorted and free of duplicates.
pub fn resolve_versions(
    scenario: BuildScenario,
    manifest: &ReleaseManifest,
    image: &str,
    pin: Option<&str>,
    all_artifacts: bool,
) -> Result<Vec<VersionPair>> {
    let entries = manifest.entries(image)?;
    let baseline = manifest.baseline(image)?;

    if let Some(pin) = pin {
        return entries
            .iter()
            .map(|e| &e.pair)
            .chain(baseline.iter())
            .filter(|pair| pair.version == pin)
            .chain(
                entries
                    .iter()
                    .filter(|e| e.line_key == pin)
                    .map(|e| &e.pair),
            )
            .max()
            .map(|pair| vec![pair.clone()])
            .ok_or_else(|| ShipyardError::NotFound {
                image: image.to_string(),
                pin: pin.to_string(),
            });
    }

    let mut selected: BTreeSet<VersionPair> = if scenario == BuildScenario::Release || all_artifacts
    {
        entries.into_iter().map(|e| e.pair).collect()
    } else {
        latest_per_major_line(image, entries)?
    };
    selected.extend(baseline);
    Ok(selected.into_iter().collect())
}

fn latest_per_major_line(image: &str, entries: Vec<ManifestEntry>) -> Result<BTreeSet<VersionPair>> {
    let mut lines: BTreeMap<String, Vec<ManifestEntry>> = BTreeMap::new();
    for entry in entries {
        lines
            .entry(major_line(&entry.line_key))
            .or_default()
            .push(entry);
    }

    let mut out = BTreeSet::new();
    for (line, mut members) in lines {
        members.sort_by(|a, b| {
            compare_versions(&a.line_key, &b.line_key).then_with(|| a.pair.cmp(&b.pair))
        });
        members.dedup_by(|a, b| a.pair == b.pair && a.line_key == b.line_key);

        let Some(top) = members.last() else {
            continue;
        };
        if let Some(runner_up) = members.len().checked_sub(2).map(|i| &members[i]) {
            let tie = compare_versions(&runner_up.line_key, &top.line_key) == Ordering::Equal;
            if tie && runner_up.pair != top.pair {
                return Err(ShipyardError::InvalidManifest(format!(
                    "image {image}: major line {line} has equal versions '{}' and '{}'",
                    runner_up.line_key, top.line_key
                )));
            }
        }
        out.insert(top.pair.clone());
    }
    Ok(out)
}

// ---------------------------------------------------------------------------
// Daily rebuild narrowing
// ---------------------------------------------------------------------------

/// Operator slice keeping only agent versions without an operator suffix.
pub const ONLY_AGENTS: &str = "onlyAgents";

/// Narrows a resolved version list for a daily rebuild.
///
/// The range applies only when both bounds are set. Equal bounds select
/// exactly that version, even one the release manifest does not list.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RebuildFilter {
    pub min_version: Option<String>,
    pub max_version: Option<String>,
    /// Substring a version must contain, or [`ONLY_AGENTS`].
    pub operator_version: Option<String>,
}

impl RebuildFilter {
    pub fn is_empty(&self) -> bool {
        self.min_version.is_none() && self.max_version.is_none() && self.operator_version.is_none()
    }

    pub fn apply(&self, pairs: Vec<VersionPair>) -> Vec<VersionPair> {
        let ranged = self.in_range(pairs);
        match self.operator_version.as_deref() {
            Some(operator) => ranged
                .into_iter()
                .filter(|pair| matches_operator(&pair.version, operator))
                .collect(),
            None => ranged,
        }
    }

    fn in_range(&self, pairs: Vec<VersionPair>) -> Vec<VersionPair> {
        let (min, max) = (self.min_version.as_deref(), self.max_version.as_deref());
        if let (Some(min), Some(max)) = (min, max) {
            if min == max {
                let exact: Vec<_> = pairs.into_iter().filter(|p| p.version == min).collect();
                if exact.is_empty() {
                    return vec![VersionPair::new(min)];
                }
                return exact;
            }
        }
        pairs
            .into_iter()
            .filter(|pair| is_version_in_range(&pair.version, min, max))
            .collect()
    }
}

/// Range check for daily rebuilds.
///
/// Strict `MAJOR.MINOR.PATCH` pre-releases are always excluded. Versions
/// that are not strict semver (agent build numbers) are always kept. With
/// both bounds set, keeps `min <= version < max`.
pub fn is_version_in_range(version: &str, min: Option<&str>, max: Option<&str>) -> bool {
    let Some(parsed) = Semver::parse(version).filter(|v| v.numbers.len() == 3) else {
        return true;
    };
    if parsed.pre.is_some() {
        tracing::debug!(version, "excluding pre-release from rebuild range");
        return false;
    }
    match (min, max) {
        (Some(min), Some(max)) => {
            compare_versions(version, min) != Ordering::Less
                && compare_versions(version, max) == Ordering::Less
        }
        _ => true,
    }
}

/// Operator versions are appended as `_<operator>`; plain agents never carry `1_`.
fn matches_operator(version: &str, operator: &str) -> bool {
    if operator == ONLY_AGENTS {
        !version.contains("1_")
    } else {
        version.contains(operator)
    }
}

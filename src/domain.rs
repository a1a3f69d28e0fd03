use std::fmt;
use std::path::Path;
use std::str::FromStr;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::error::HarvestError;

/// Ordered pipeline phases. Grouping is a view over Transform and has no stage of its own.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Discover,
    Fetch,
    Unpack,
    Transform,
    Merge,
}

impl Stage {
    pub const ALL: [Stage; 5] = [
        Stage::Discover,
        Stage::Fetch,
        Stage::Unpack,
        Stage::Transform,
        Stage::Merge,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Discover => "discover",
            Stage::Fetch => "fetch",
            Stage::Unpack => "unpack",
            Stage::Transform => "transform",
            Stage::Merge => "merge",
        }
    }

    pub fn upstream(self) -> Option<Stage> {
        match self {
            Stage::Discover => None,
            Stage::Fetch => Some(Stage::Discover),
            Stage::Unpack => Some(Stage::Fetch),
            Stage::Transform => Some(Stage::Unpack),
            Stage::Merge => Some(Stage::Transform),
        }
    }

    /// This stage followed by every stage whose state derives from it.
    pub fn with_downstream(self) -> Vec<Stage> {
        Stage::ALL.into_iter().filter(|stage| *stage >= self).collect()
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = HarvestError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "discover" => Ok(Stage::Discover),
            "fetch" => Ok(Stage::Fetch),
            "unpack" => Ok(Stage::Unpack),
            "transform" => Ok(Stage::Transform),
            "merge" => Ok(Stage::Merge),
            _ => Err(HarvestError::InvalidStage(value.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Success,
    Failure,
}

impl Outcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::Failure => "failure",
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Outcome {
    type Err = HarvestError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "success" => Ok(Outcome::Success),
            "failure" => Ok(Outcome::Failure),
            other => Err(HarvestError::StageLog(format!("unknown outcome: {other}"))),
        }
    }
}

/// `(region, sub-region, locality)` triple identifying one discovery request.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LocalityKey {
    region: String,
    subregion: String,
    locality: String,
}

impl LocalityKey {
    pub fn new(region: &str, subregion: &str, locality: &str) -> Result<Self, HarvestError> {
        let parts = [region.trim(), subregion.trim(), locality.trim()];
        if parts.iter().any(|part| !is_key_component(part)) {
            return Err(HarvestError::InvalidLocality(format!(
                "{region}/{subregion}/{locality}"
            )));
        }
        Ok(Self {
            region: parts[0].to_string(),
            subregion: parts[1].to_string(),
            locality: parts[2].to_string(),
        })
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    pub fn subregion(&self) -> &str {
        &self.subregion
    }

    pub fn locality(&self) -> &str {
        &self.locality
    }
}

impl fmt::Display for LocalityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.region, self.subregion, self.locality)
    }
}

impl FromStr for LocalityKey {
    type Err = HarvestError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let parts = value.trim().split('/').collect::<Vec<_>>();
        match parts.as_slice() {
            [region, subregion, locality] => Self::new(region, subregion, locality),
            _ => Err(HarvestError::InvalidLocality(value.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ProductName(String);

impl ProductName {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProductName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ProductName {
    type Err = HarvestError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        if !is_key_component(trimmed) || trimmed.contains("::") {
            return Err(HarvestError::InvalidProduct(value.to_string()));
        }
        Ok(Self(trimmed.to_string()))
    }
}

/// One data member inside a fetched archive, addressed by its internal relative path.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MemberKey {
    product: ProductName,
    member: String,
}

impl MemberKey {
    pub fn new(product: ProductName, member: &str) -> Result<Self, HarvestError> {
        let member = member.trim().replace('\\', "/");
        let is_valid = !member.is_empty()
            && !member.starts_with('/')
            && !member.contains("::")
            && member
                .split('/')
                .all(|segment| !segment.is_empty() && segment != "..");
        if !is_valid {
            return Err(HarvestError::InvalidMember(format!("{product}::{member}")));
        }
        Ok(Self { product, member })
    }

    pub fn product(&self) -> &ProductName {
        &self.product
    }

    /// Relative path of the member inside its archive, `/`-separated.
    pub fn member(&self) -> &str {
        &self.member
    }

    pub fn stem(&self) -> &str {
        let file = self.member.rsplit('/').next().unwrap_or(&self.member);
        match file.rfind('.') {
            Some(idx) if idx > 0 => &file[..idx],
            _ => file,
        }
    }
}

impl fmt::Display for MemberKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}", self.product, self.member)
    }
}

impl FromStr for MemberKey {
    type Err = HarvestError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let (product, member) = value
            .split_once("::")
            .ok_or_else(|| HarvestError::InvalidMember(value.to_string()))?;
        Self::new(product.parse()?, member)
    }
}

/// Normalised fan-in key: case-folded, path- and extension-stripped artifact name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct GroupKey(String);

impl GroupKey {
    pub fn of_artifact(path: &Path) -> Result<Self, HarvestError> {
        path.file_stem()
            .and_then(|stem| stem.to_str())
            .ok_or_else(|| HarvestError::InvalidGroup(path.display().to_string()))?
            .parse()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for GroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for GroupKey {
    type Err = HarvestError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_lowercase();
        if !is_key_component(&normalized) {
            return Err(HarvestError::InvalidGroup(value.to_string()));
        }
        Ok(Self(normalized))
    }
}

/// A product reported by the catalog for one locality.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductDescriptor {
    pub name: ProductName,
    pub source_path: String,
    pub size_hint: Option<String>,
}

/// Parses catalog size strings such as `248MB`, `12.5KB`, `1GB` or a plain byte count.
pub fn parse_size_hint(value: &str) -> Option<u64> {
    let normalized = value.trim().to_ascii_uppercase();
    if normalized.is_empty() {
        return None;
    }
    let (number, multiplier) = if let Some(rest) = normalized.strip_suffix("GB") {
        (rest, 1024.0 * 1024.0 * 1024.0)
    } else if let Some(rest) = normalized.strip_suffix("MB") {
        (rest, 1024.0 * 1024.0)
    } else if let Some(rest) = normalized.strip_suffix("KB") {
        (rest, 1024.0)
    } else if let Some(rest) = normalized.strip_suffix('B') {
        (rest, 1.0)
    } else {
        (normalized.as_str(), 1.0)
    };
    let parsed = number.trim().parse::<f64>().ok()?;
    if !parsed.is_finite() || parsed < 0.0 {
        return None;
    }
    Some((parsed * multiplier) as u64)
}

fn is_key_component(value: &str) -> bool {
    !value.is_empty()
        && value != "."
        && value != ".."
        && !value
            .chars()
            .any(|ch| ch == '/' || ch == '\\' || ch.is_control())
}

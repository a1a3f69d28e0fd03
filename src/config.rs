use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use camino::Utf8PathBuf;
use directories::BaseDirs;
use serde::{Deserialize, Serialize};

use crate::error::HarvestError;

pub const DEFAULT_CONFIG_FILE: &str = "geo-harvest.json";

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct HarvestConfig {
    pub paths: PathsConfig,
    pub network: NetworkConfig,
    pub tool: ToolConfig,
    pub pipeline: PipelineConfig,
    pub catalog: CatalogConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PathsConfig {
    pub download_root: Utf8PathBuf,
    pub extract_root: Utf8PathBuf,
    pub transform_root: Utf8PathBuf,
    pub merge_root: Utf8PathBuf,
    /// Fast local storage for converter temp files and merge workspaces.
    pub scratch_root: Utf8PathBuf,
    pub state_db: Utf8PathBuf,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub base_url: String,
    pub user_agent: String,
    pub timeout_seconds: u64,
    /// Whole-transfer limit for a single archive download.
    pub download_timeout_seconds: u64,
    pub rate_limit_seconds: f64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ToolConfig {
    pub ogr2ogr: String,
    pub ogrinfo: String,
    pub target_crs: String,
    pub encoding: String,
    pub skip_failures: bool,
    pub strict: bool,
    pub timeout_seconds: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub workers: usize,
    pub member_extension: String,
    pub archive_extension: String,
    pub artifact_extension: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CatalogConfig {
    pub regions: Vec<String>,
    pub product_description: String,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self::under(&default_data_root())
    }
}

impl PathsConfig {
    /// Standard layout rooted at `root`.
    pub fn under(root: &Utf8PathBuf) -> Self {
        Self {
            download_root: root.join("downloads"),
            extract_root: root.join("extracted"),
            transform_root: root.join("converted"),
            merge_root: root.join("merged"),
            scratch_root: root.join("scratch"),
            state_db: root.join("stage-log.sqlite3"),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            base_url: "https://msc.fema.gov".to_string(),
            user_agent: format!("geo-harvest/{}", env!("CARGO_PKG_VERSION")),
            timeout_seconds: 30,
            download_timeout_seconds: 3600,
            rate_limit_seconds: 0.2,
        }
    }
}

impl NetworkConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    pub fn download_timeout(&self) -> Duration {
        Duration::from_secs(self.download_timeout_seconds)
    }

    pub fn rate_limit(&self) -> Duration {
        Duration::from_secs_f64(self.rate_limit_seconds.max(0.0))
    }
}

impl Default for ToolConfig {
    fn default() -> Self {
        Self {
            ogr2ogr: "ogr2ogr".to_string(),
            ogrinfo: "ogrinfo".to_string(),
            target_crs: "EPSG:4326".to_string(),
            encoding: "UTF-8".to_string(),
            skip_failures: true,
            strict: false,
            timeout_seconds: 900,
        }
    }
}

impl ToolConfig {
    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout_seconds > 0).then(|| Duration::from_secs(self.timeout_seconds))
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            member_extension: "shp".to_string(),
            archive_extension: "zip".to_string(),
            artifact_extension: "gpkg".to_string(),
        }
    }
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            regions: Vec::new(),
            product_description: "ShapeFiles".to_string(),
        }
    }
}

/// Command-line values that take precedence over the file.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub workers: Option<usize>,
    pub regions: Option<Vec<String>>,
    pub scratch_root: Option<Utf8PathBuf>,
    pub encoding: Option<String>,
    pub strict: bool,
}

pub struct ConfigLoader;

impl ConfigLoader {
    pub fn resolve(
        path: Option<&str>,
        overrides: &ConfigOverrides,
    ) -> Result<HarvestConfig, HarvestError> {
        let config_path = match path {
            Some(path) => PathBuf::from(path),
            None => PathBuf::from(DEFAULT_CONFIG_FILE),
        };

        let config = if path.is_none() && !config_path.exists() {
            tracing::debug!("no {DEFAULT_CONFIG_FILE} found, using built-in defaults");
            HarvestConfig::default()
        } else {
            let content = fs::read_to_string(&config_path)
                .map_err(|_| HarvestError::ConfigRead(config_path.clone()))?;
            Self::parse(&content)?
        };

        Self::apply(config, overrides)
    }

    pub fn parse(content: &str) -> Result<HarvestConfig, HarvestError> {
        serde_json::from_str(content).map_err(|err| HarvestError::ConfigParse(err.to_string()))
    }

    pub fn apply(
        mut config: HarvestConfig,
        overrides: &ConfigOverrides,
    ) -> Result<HarvestConfig, HarvestError> {
        if let Some(workers) = overrides.workers {
            config.pipeline.workers = workers;
        }
        if let Some(regions) = &overrides.regions {
            config.catalog.regions = regions.clone();
        }
        if let Some(scratch) = &overrides.scratch_root {
            config.paths.scratch_root = scratch.clone();
        }
        if let Some(encoding) = &overrides.encoding {
            config.tool.encoding = encoding.clone();
        }
        if overrides.strict {
            config.tool.strict = true;
            config.tool.skip_failures = false;
        }
        Self::validate(&config)?;
        Ok(config)
    }

    pub fn validate(config: &HarvestConfig) -> Result<(), HarvestError> {
        if config.pipeline.workers == 0 {
            return Err(HarvestError::ConfigInvalid(
                "pipeline.workers must be at least 1".to_string(),
            ));
        }
        let paths = &config.paths;
        let protected = [
            ("paths.download_root", &paths.download_root),
            ("paths.extract_root", &paths.extract_root),
            ("paths.transform_root", &paths.transform_root),
            ("paths.merge_root", &paths.merge_root),
        ];
        for (name, root) in protected {
            if paths.scratch_root == *root || paths.scratch_root.starts_with(root) {
                return Err(HarvestError::ConfigInvalid(format!(
                    "paths.scratch_root must be separate from {name}"
                )));
            }
        }
        if paths.extract_root == paths.download_root {
            return Err(HarvestError::ConfigInvalid(
                "paths.extract_root must differ from paths.download_root".to_string(),
            ));
        }
        if config.pipeline.member_extension.trim().is_empty() {
            return Err(HarvestError::ConfigInvalid(
                "pipeline.member_extension must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

fn default_data_root() -> Utf8PathBuf {
    BaseDirs::new()
        .and_then(|dirs| Utf8PathBuf::from_path_buf(dirs.data_local_dir().join("geo-harvest")).ok())
        .unwrap_or_else(|| Utf8PathBuf::from(".geo-harvest"))
}

#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::{Cursor, Write};
use std::sync::Mutex;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use zip::write::SimpleFileOptions;

use geo_harvest::app::{Harvester, ProgressEvent, ProgressSink};
use geo_harvest::catalog::Catalog;
use geo_harvest::config::{HarvestConfig, PathsConfig};
use geo_harvest::domain::{LocalityKey, ProductDescriptor};
use geo_harvest::error::HarvestError;
use geo_harvest::pool::ShutdownFlag;
use geo_harvest::stage_log::StageLog;
use geo_harvest::store::{Relocator, Store};
use geo_harvest::tool::{Ogr2Ogr, ToolOutput, ToolRunner};
use geo_harvest::transport::{FetchReceipt, Transport};

pub type TestHarvester<M> = Harvester<MockCatalog, MockTransport, MockTool, M>;

pub fn zip_bytes(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    let options = SimpleFileOptions::default().compression_method(zip::CompressionMethod::Stored);
    for (name, content) in entries {
        writer.start_file(*name, options).unwrap();
        writer.write_all(content).unwrap();
    }
    writer.finish().unwrap().into_inner()
}

pub fn test_config(root: &Utf8Path) -> HarvestConfig {
    let mut config = HarvestConfig::default();
    config.paths = PathsConfig::under(&root.to_path_buf());
    config.network.base_url = "https://catalog.test".to_string();
    config.network.rate_limit_seconds = 0.0;
    config.pipeline.workers = 2;
    config.catalog.regions = vec!["FL".to_string()];
    config
}

pub fn utf8_root(temp: &tempfile::TempDir) -> Utf8PathBuf {
    Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap()
}

pub fn descriptor(name: &str, source_path: &str) -> ProductDescriptor {
    ProductDescriptor {
        name: name.parse().unwrap(),
        source_path: source_path.to_string(),
        size_hint: None,
    }
}

#[derive(Default)]
pub struct MockCatalog {
    pub localities: Vec<LocalityKey>,
    pub products: BTreeMap<String, Vec<ProductDescriptor>>,
    pub failing_localities: BTreeSet<String>,
    pub product_calls: Mutex<Vec<String>>,
}

impl MockCatalog {
    pub fn with_locality(mut self, key: &str, products: Vec<ProductDescriptor>) -> Self {
        self.localities.push(key.parse().unwrap());
        self.products.insert(key.to_string(), products);
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.product_calls.lock().unwrap().clone()
    }
}

impl Catalog for MockCatalog {
    fn localities(&self, regions: &[String]) -> Result<Vec<LocalityKey>, HarvestError> {
        Ok(self
            .localities
            .iter()
            .filter(|locality| regions.iter().any(|region| region == locality.region()))
            .cloned()
            .collect())
    }

    fn products(&self, locality: &LocalityKey) -> Result<Vec<ProductDescriptor>, HarvestError> {
        let key = locality.to_string();
        self.product_calls.lock().unwrap().push(key.clone());
        if self.failing_localities.contains(&key) {
            return Err(HarvestError::CatalogStatus {
                status: 503,
                message: "service unavailable".to_string(),
            });
        }
        Ok(self.products.get(&key).cloned().unwrap_or_default())
    }
}

/// Serves archive bytes keyed by source path suffix.
#[derive(Default)]
pub struct MockTransport {
    pub archives: BTreeMap<String, Vec<u8>>,
    pub failing: BTreeSet<String>,
    pub calls: Mutex<Vec<String>>,
}

impl MockTransport {
    pub fn serve(mut self, source_path: &str, bytes: Vec<u8>) -> Self {
        self.archives.insert(source_path.to_string(), bytes);
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

impl Transport for MockTransport {
    fn fetch(
        &self,
        url: &str,
        local_path: &Utf8Path,
        resume_from: u64,
    ) -> Result<FetchReceipt, HarvestError> {
        self.calls.lock().unwrap().push(url.to_string());
        if self.failing.iter().any(|source| url.ends_with(source.as_str())) {
            return Err(HarvestError::TransportHttp("connection reset".to_string()));
        }
        let bytes = self
            .archives
            .iter()
            .find(|(source, _)| url.ends_with(source.as_str()))
            .map(|(_, bytes)| bytes.clone())
            .ok_or_else(|| HarvestError::TransportStatus {
                status: 404,
                message: url.to_string(),
            })?;

        fs::create_dir_all(local_path.parent().unwrap()).unwrap();
        let start = (resume_from as usize).min(bytes.len());
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(local_path)
            .unwrap();
        if resume_from == 0 {
            file.set_len(0).unwrap();
        }
        file.write_all(&bytes[start..]).unwrap();
        Ok(FetchReceipt {
            bytes_written: (bytes.len() - start) as u64,
            total_size: Some(bytes.len() as u64),
        })
    }
}

/// Stand-in for `ogr2ogr`/`ogrinfo`: the destination file records which sources went into it.
#[derive(Default)]
pub struct MockTool {
    pub failing_sources: BTreeSet<String>,
    pub calls: Mutex<Vec<(String, Vec<String>)>>,
    /// Requested after the first conversion, to simulate an interrupt mid-stage.
    pub interrupt_after_convert: Option<ShutdownFlag>,
}

impl MockTool {
    pub fn failing_on(sources: &[&str]) -> Self {
        Self {
            failing_sources: sources.iter().map(|source| source.to_string()).collect(),
            ..Self::default()
        }
    }

    pub fn invocations(&self, program: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(called, _)| called == program)
            .count()
    }

    /// Member conversions only; merge seeds and appends carry no target CRS.
    pub fn conversions(&self) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, args)| args.iter().any(|arg| arg == "-a_srs"))
            .count()
    }

    pub fn appends(&self) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, args)| args.iter().any(|arg| arg == "-append"))
            .count()
    }
}

impl ToolRunner for MockTool {
    fn run(
        &self,
        program: &str,
        args: &[String],
        _timeout: Option<Duration>,
    ) -> Result<ToolOutput, HarvestError> {
        self.calls
            .lock()
            .unwrap()
            .push((program.to_string(), args.to_vec()));
        let source = args.last().cloned().unwrap_or_default();

        if self.failing_sources.iter().any(|needle| source.contains(needle.as_str())) {
            return Ok(ToolOutput {
                exit_code: Some(1),
                stdout: String::new(),
                stderr: format!("ERROR 1: Unable to open datasource `{source}'"),
            });
        }

        if program == "ogrinfo" {
            let layer = Utf8Path::new(&source).file_stem().unwrap_or("layer").to_string();
            return Ok(ToolOutput {
                exit_code: Some(0),
                stdout: format!(
                    "INFO: Open of `{source}'\nLayer name: {layer}\nGeometry: Multi Polygon\nFeature Count: 3\nFLD_ZONE: String (10.0)\nSHAPE_Area: Real (19.11)\n"
                ),
                stderr: String::new(),
            });
        }

        let dest = Utf8PathBuf::from(&args[args.len() - 2]);
        fs::create_dir_all(dest.parent().unwrap()).unwrap();
        let mut file = if args.iter().any(|arg| arg == "-append") {
            fs::OpenOptions::new().append(true).open(&dest).unwrap()
        } else {
            fs::File::create(&dest).unwrap()
        };
        writeln!(file, "{source}").unwrap();

        let is_convert = args.iter().any(|arg| arg == "-a_srs");
        if is_convert {
            if let Some(flag) = &self.interrupt_after_convert {
                flag.request();
            }
        }
        Ok(ToolOutput {
            exit_code: Some(0),
            stdout: String::new(),
            stderr: String::new(),
        })
    }
}

/// Refuses every publish without touching the destination.
pub struct RejectingRelocator;

impl Relocator for RejectingRelocator {
    fn relocate(&self, from: &Utf8Path, to: &Utf8Path) -> Result<u64, HarvestError> {
        Err(HarvestError::Relocation {
            from: from.to_string(),
            to: to.to_string(),
            message: "destination volume unavailable".to_string(),
        })
    }
}

#[derive(Default)]
pub struct RecordingSink {
    pub events: Mutex<Vec<String>>,
}

impl ProgressSink for RecordingSink {
    fn event(&self, event: ProgressEvent) {
        self.events.lock().unwrap().push(event.message);
    }
}

pub fn build<M: Relocator>(
    config: HarvestConfig,
    log: StageLog,
    catalog: MockCatalog,
    transport: MockTransport,
    tool: MockTool,
    relocator: M,
) -> TestHarvester<M> {
    let temp_dir = Store::new(&config).tool_temp_dir();
    let tool = Ogr2Ogr::new(tool, config.tool.clone(), temp_dir).unwrap();
    Harvester::new(config, log, catalog, transport, tool, relocator)
}

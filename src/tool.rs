use std::io::{self, Read};
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use camino::{Utf8Path, Utf8PathBuf};
use regex::Regex;
use serde::Serialize;

use crate::config::ToolConfig;
use crate::error::HarvestError;

const DIAGNOSTIC_LIMIT: usize = 2000;

/// Captured result of one external process.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ToolOutput {
    /// `None` when the process was terminated by a signal.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ToolOutput {
    pub fn exited_cleanly(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Boundary to external binaries: a program name and an argument vector, nothing else.
pub trait ToolRunner: Send + Sync {
    /// Spawn or timeout problems are errors; a non-zero exit is reported in the output.
    fn run(
        &self,
        program: &str,
        args: &[String],
        timeout: Option<Duration>,
    ) -> Result<ToolOutput, HarvestError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemToolRunner;

impl ToolRunner for SystemToolRunner {
    fn run(
        &self,
        program: &str,
        args: &[String],
        timeout: Option<Duration>,
    ) -> Result<ToolOutput, HarvestError> {
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|err| match err.kind() {
                io::ErrorKind::NotFound => HarvestError::MissingTool(program.to_string()),
                _ => HarvestError::ToolFailed {
                    program: program.to_string(),
                    message: format!("spawn: {err}"),
                },
            })?;

        let stdout = child.stdout.take().map(drain);
        let stderr = child.stderr.take().map(drain);

        let started = Instant::now();
        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) => {}
                Err(err) => {
                    return Err(HarvestError::ToolFailed {
                        program: program.to_string(),
                        message: format!("wait: {err}"),
                    });
                }
            }
            if let Some(limit) = timeout
                && started.elapsed() >= limit
            {
                let _ = child.kill();
                let _ = child.wait();
                return Err(HarvestError::ToolTimeout {
                    program: program.to_string(),
                    seconds: limit.as_secs(),
                });
            }
            thread::sleep(Duration::from_millis(50));
        };

        Ok(ToolOutput {
            exit_code: status.code(),
            stdout: join_drain(stdout),
            stderr: join_drain(stderr),
        })
    }
}

fn drain<R: Read + Send + 'static>(mut stream: R) -> thread::JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = stream.read_to_end(&mut buf);
        buf
    })
}

fn join_drain(handle: Option<thread::JoinHandle<Vec<u8>>>) -> String {
    handle
        .and_then(|handle| handle.join().ok())
        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
        .unwrap_or_default()
}

/// Layer name and attribute fields reported by `ogrinfo -so -al`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProbedLayer {
    pub name: String,
    pub fields: Vec<String>,
}

/// `(source field, normalised alias)` pairs used to reconcile schemas across sources.
pub type FieldMapping = Vec<(String, String)>;

/// Adapter for the GDAL `ogr2ogr` / `ogrinfo` pair.
pub struct Ogr2Ogr<R> {
    runner: R,
    config: ToolConfig,
    temp_dir: Utf8PathBuf,
    fatal_marker: Regex,
    warning_marker: Regex,
    layer_line: Regex,
    field_line: Regex,
}

impl<R: ToolRunner> Ogr2Ogr<R> {
    pub fn new(runner: R, config: ToolConfig, temp_dir: Utf8PathBuf) -> Result<Self, HarvestError> {
        let compile = |pattern: &str| {
            Regex::new(pattern).map_err(|err| HarvestError::ConfigInvalid(err.to_string()))
        };
        Ok(Self {
            runner,
            config,
            temp_dir,
            fatal_marker: compile(r"(?m)^(ERROR \d+|FAILURE):")?,
            warning_marker: compile(r"(?mi)^warning\b")?,
            layer_line: compile(r"(?m)^Layer name: (.+?)\s*$")?,
            field_line: compile(r"(?m)^([^\s:][^:\n]*): [A-Za-z0-9]+(?:\([A-Za-z0-9]+\))? \(")?,
        })
    }

    pub fn runner(&self) -> &R {
        &self.runner
    }

    pub fn config(&self) -> &ToolConfig {
        &self.config
    }

    /// Shapefile (or any OGR source) to a single-layer GeoPackage named after the member stem.
    pub fn convert_args(&self, source: &Utf8Path, dest: &Utf8Path, layer: &str) -> Vec<String> {
        let mut args = self.common_args(layer);
        args.extend([
            "-a_srs".to_string(),
            self.config.target_crs.clone(),
            "--config".to_string(),
            "OGR_ENABLE_PARTIAL_REPROJECTION".to_string(),
            "TRUE".to_string(),
            "--config".to_string(),
            "SHAPE_ENCODING".to_string(),
            self.config.encoding.clone(),
        ]);
        args.extend([dest.to_string(), source.to_string()]);
        args
    }

    /// First member of a merge group: copy into a fresh output under the group layer name.
    pub fn seed_args(
        &self,
        source: &Utf8Path,
        dest: &Utf8Path,
        layer: &str,
        source_layer: &str,
        mapping: &FieldMapping,
    ) -> Vec<String> {
        let mut args = self.common_args(layer);
        args.extend(select_args(source_layer, mapping));
        args.extend([dest.to_string(), source.to_string()]);
        args
    }

    /// Subsequent members: append into the seeded output, adding any new normalised fields.
    pub fn append_args(
        &self,
        source: &Utf8Path,
        dest: &Utf8Path,
        layer: &str,
        source_layer: &str,
        mapping: &FieldMapping,
    ) -> Vec<String> {
        let mut args = vec![
            "-update".to_string(),
            "-append".to_string(),
            "-addfields".to_string(),
        ];
        args.extend(self.common_args(layer));
        args.extend(select_args(source_layer, mapping));
        args.extend([dest.to_string(), source.to_string()]);
        args
    }

    fn common_args(&self, layer: &str) -> Vec<String> {
        let mut args = vec![
            "-f".to_string(),
            "GPKG".to_string(),
            "-nlt".to_string(),
            "PROMOTE_TO_MULTI".to_string(),
            "-nln".to_string(),
            layer.to_string(),
            "--config".to_string(),
            "CPL_TMPDIR".to_string(),
            self.temp_dir.to_string(),
            "-lco".to_string(),
            "ENCODING=UTF-8".to_string(),
        ];
        if self.config.skip_failures && !self.config.strict {
            args.push("-skipfailures".to_string());
        }
        args
    }

    pub fn convert(&self, source: &Utf8Path, dest: &Utf8Path, layer: &str) -> Result<ToolOutput, HarvestError> {
        let args = self.convert_args(source, dest, layer);
        self.invoke(&self.config.ogr2ogr, &args)
    }

    pub fn seed(
        &self,
        source: &Utf8Path,
        dest: &Utf8Path,
        layer: &str,
        probed: &ProbedLayer,
    ) -> Result<ToolOutput, HarvestError> {
        let mapping = field_mapping(&probed.fields);
        let args = self.seed_args(source, dest, layer, &probed.name, &mapping);
        self.invoke(&self.config.ogr2ogr, &args)
    }

    pub fn append(
        &self,
        source: &Utf8Path,
        dest: &Utf8Path,
        layer: &str,
        probed: &ProbedLayer,
    ) -> Result<ToolOutput, HarvestError> {
        let mapping = field_mapping(&probed.fields);
        let args = self.append_args(source, dest, layer, &probed.name, &mapping);
        self.invoke(&self.config.ogr2ogr, &args)
    }

    /// First layer of `source` with its attribute field names.
    pub fn probe(&self, source: &Utf8Path) -> Result<ProbedLayer, HarvestError> {
        let args = vec!["-so".to_string(), "-al".to_string(), source.to_string()];
        let output = self.invoke(&self.config.ogrinfo, &args)?;
        self.parse_probe(&output.stdout).ok_or_else(|| HarvestError::ToolFailed {
            program: self.config.ogrinfo.clone(),
            message: format!("no layer reported for {source}"),
        })
    }

    fn parse_probe(&self, stdout: &str) -> Option<ProbedLayer> {
        let first = self.layer_line.captures(stdout)?;
        let name = first.get(1)?.as_str().to_string();
        let start = first.get(0)?.end();
        let section = &stdout[start..];
        // Stop at the next layer block.
        let end = self
            .layer_line
            .find(section)
            .map_or(section.len(), |next| next.start());
        let fields = self
            .field_line
            .captures_iter(&section[..end])
            .filter_map(|caps| caps.get(1).map(|m| m.as_str().trim().to_string()))
            .filter(|field| !is_layer_property(field))
            .collect();
        Some(ProbedLayer { name, fields })
    }

    /// Runs the tool and applies the success rule: clean exit and no fatal marker.
    fn invoke(&self, program: &str, args: &[String]) -> Result<ToolOutput, HarvestError> {
        tracing::debug!(program, args = ?args, "invoking external tool");
        let output = self.runner.run(program, args, self.config.timeout())?;
        match self.assess(&output) {
            Ok(()) => Ok(output),
            Err(message) => Err(HarvestError::ToolFailed {
                program: program.to_string(),
                message,
            }),
        }
    }

    /// `Err` carries the diagnostic for a failed invocation.
    pub fn assess(&self, output: &ToolOutput) -> Result<(), String> {
        let fatal = self
            .fatal_marker
            .find_iter(&output.stderr)
            .next()
            .is_some();
        let strict_warning = self.config.strict && self.warning_marker.is_match(&output.stderr);
        if output.exited_cleanly() && !fatal && !strict_warning {
            return Ok(());
        }
        let mut message = match output.exit_code {
            Some(0) if strict_warning && !fatal => "warnings in strict mode".to_string(),
            Some(0) => "fatal marker in diagnostics".to_string(),
            Some(code) => format!("exit status {code}"),
            None => "terminated by signal".to_string(),
        };
        let stderr = output.stderr.trim();
        if !stderr.is_empty() {
            message.push_str(": ");
            message.push_str(truncate(stderr, DIAGNOSTIC_LIMIT));
        }
        Err(message)
    }
}

fn select_args(source_layer: &str, mapping: &FieldMapping) -> Vec<String> {
    if mapping.is_empty() {
        return Vec::new();
    }
    let columns = mapping
        .iter()
        .map(|(original, alias)| format!("\"{}\" AS \"{}\"", escape_ident(original), alias))
        .collect::<Vec<_>>()
        .join(", ");
    vec![
        "-dialect".to_string(),
        "OGRSQL".to_string(),
        "-sql".to_string(),
        format!("SELECT {columns} FROM \"{}\"", escape_ident(source_layer)),
    ]
}

fn escape_ident(value: &str) -> String {
    value.replace('"', "\"\"")
}

fn is_layer_property(field: &str) -> bool {
    matches!(
        field,
        "Layer name" | "Geometry" | "Feature Count" | "Extent" | "Layer SRS WKT"
    )
}

/// Lower-case, every non-alphanumeric character folded to `_`.
pub fn normalize_field_name(name: &str) -> String {
    name.trim()
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() {
                ch.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect()
}

/// Area/length columns computed by the source geometry engine; inconsistent across sources.
pub fn is_computed_field(normalized: &str) -> bool {
    matches!(normalized, "shape_area" | "shape_leng" | "shape_length")
        || normalized.starts_with("st_area")
        || normalized.starts_with("st_length")
}

/// Normalised aliases for `fields`, dropping computed columns and later case-duplicates.
pub fn field_mapping(fields: &[String]) -> FieldMapping {
    let mut seen = std::collections::BTreeSet::new();
    fields
        .iter()
        .filter_map(|field| {
            let alias = normalize_field_name(field);
            if alias.is_empty() || is_computed_field(&alias) || !seen.insert(alias.clone()) {
                return None;
            }
            Some((field.clone(), alias))
        })
        .collect()
}

fn truncate(value: &str, limit: usize) -> &str {
    if value.len() <= limit {
        return value;
    }
    let mut end = limit;
    while !value.is_char_boundary(end) {
        end -= 1;
    }
    &value[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopRunner;

    impl ToolRunner for NoopRunner {
        fn run(&self, _: &str, _: &[String], _: Option<Duration>) -> Result<ToolOutput, HarvestError> {
            Ok(ToolOutput::default())
        }
    }

    fn adapter(config: ToolConfig) -> Ogr2Ogr<NoopRunner> {
        Ogr2Ogr::new(NoopRunner, config, Utf8PathBuf::from("/fast/tmp")).unwrap()
    }

    fn output(code: i32, stderr: &str) -> ToolOutput {
        ToolOutput {
            exit_code: Some(code),
            stdout: String::new(),
            stderr: stderr.to_string(),
        }
    }

    #[test]
    fn convert_args_carry_required_options() {
        let tool = adapter(ToolConfig::default());
        let args = tool.convert_args(
            Utf8Path::new("/x/S_A.shp"),
            Utf8Path::new("/scratch/S_A.gpkg"),
            "S_A",
        );
        let joined = args.join(" ");
        assert!(joined.contains("-nlt PROMOTE_TO_MULTI"));
        assert!(joined.contains("-a_srs EPSG:4326"));
        assert!(joined.contains("--config CPL_TMPDIR /fast/tmp"));
        assert!(joined.contains("--config SHAPE_ENCODING UTF-8"));
        assert!(args.contains(&"-skipfailures".to_string()));
        assert_eq!(&args[args.len() - 2..], ["/scratch/S_A.gpkg", "/x/S_A.shp"]);
    }

    #[test]
    fn strict_mode_drops_skipfailures_and_fails_on_warnings() {
        let tool = adapter(ToolConfig {
            strict: true,
            ..ToolConfig::default()
        });
        let args = tool.convert_args(Utf8Path::new("a.shp"), Utf8Path::new("a.gpkg"), "a");
        assert!(!args.contains(&"-skipfailures".to_string()));
        assert!(tool.assess(&output(0, "Warning 1: ring self-intersection")).is_err());
    }

    #[test]
    fn fatal_marker_fails_despite_zero_exit() {
        let tool = adapter(ToolConfig::default());
        assert!(tool.assess(&output(0, "")).is_ok());
        assert!(tool.assess(&output(0, "Warning 1: something minor")).is_ok());
        let err = tool
            .assess(&output(0, "ERROR 1: Failed to write shape"))
            .unwrap_err();
        assert!(err.contains("ERROR 1"));
        assert!(tool.assess(&output(1, "")).is_err());
    }

    #[test]
    fn field_mapping_normalises_and_drops_computed() {
        let fields = vec![
            "DFIRM_ID".to_string(),
            "Fld Zone".to_string(),
            "SHAPE_Area".to_string(),
            "st_length(shape)".to_string(),
            "dfirm_id".to_string(),
        ];
        let mapping = field_mapping(&fields);
        assert_eq!(
            mapping,
            vec![
                ("DFIRM_ID".to_string(), "dfirm_id".to_string()),
                ("Fld Zone".to_string(), "fld_zone".to_string()),
            ]
        );
    }

    #[test]
    fn probe_output_is_parsed() {
        let tool = adapter(ToolConfig::default());
        let stdout = "INFO: Open of `a.gpkg'\n      using driver `GPKG' successful.\n\n\
Layer name: S_Fld_Haz_Ar\nGeometry: Multi Polygon\nFeature Count: 12\n\
Extent: (-88.1, 30.2) - (-87.9, 30.4)\nLayer SRS WKT:\nGEOGCRS[\"WGS 84\",\n    ID[\"EPSG\",4326]]\n\
FID Column = fid\nGeometry Column = geom\nDFIRM_ID: String (6.0)\nFLD_ZONE: String (17.0)\n\
SHAPE_Area: Real (0.0)\nIS_SFHA: Integer(Boolean) (1.0)\n";
        let probed = tool.parse_probe(stdout).unwrap();
        assert_eq!(probed.name, "S_Fld_Haz_Ar");
        assert_eq!(
            probed.fields,
            vec!["DFIRM_ID", "FLD_ZONE", "SHAPE_Area", "IS_SFHA"]
        );
    }

    #[test]
    fn append_args_select_normalised_columns() {
        let tool = adapter(ToolConfig::default());
        let mapping = field_mapping(&["FLD_ZONE".to_string()]);
        let args = tool.append_args(
            Utf8Path::new("/c/b.gpkg"),
            Utf8Path::new("/s/g.gpkg"),
            "g",
            "S_B",
            &mapping,
        );
        assert_eq!(&args[..3], ["-update", "-append", "-addfields"]);
        assert!(args.contains(&"SELECT \"FLD_ZONE\" AS \"fld_zone\" FROM \"S_B\"".to_string()));
    }
}

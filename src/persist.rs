//! On-disk result files: one `<CC>_ips.txt` per country plus a summary.
//!
//! Line format: `<address>:<port>#<CC> <label> <latency>ms`, fastest first.
use crate::error::{Result, ScanError};
use crate::quota::QuotaTracker;
use crate::store::ResultStore;
use crate::types::{ClassifiedResult, QuotaTarget, SourceType};
use ::time::{format_description::well_known, OffsetDateTime};
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

const RESULT_SUFFIX: &str = "_ips.txt";
pub const SUMMARY_TXT: &str = "summary.txt";
pub const SUMMARY_JSON: &str = "summary.json";

/// Render one result line. Latency is rounded to whole milliseconds.
pub fn format_line(r: &ClassifiedResult) -> String {
    format!(
        "{}#{} {} {:.0}ms",
        r.endpoint(),
        r.country,
        r.source_type.label(),
        r.latency_ms
    )
}

/// Parse one result line back into a result.
pub fn parse_line(line: &str) -> Result<ClassifiedResult> {
    let bad = || ScanError::ResultParse(line.to_string());
    let line = line.trim();
    let (endpoint, rest) = line.split_once('#').ok_or_else(bad)?;
    let endpoint: SocketAddr = endpoint.trim().parse().map_err(|_| bad())?;

    let mut fields = rest.split_whitespace();
    let country = fields.next().ok_or_else(bad)?;
    if !country.chars().all(|c| c.is_ascii_uppercase()) {
        return Err(bad());
    }
    let source_type = fields.next().and_then(SourceType::from_label).ok_or_else(bad)?;
    let latency_ms: f64 = fields
        .next()
        .and_then(|l| l.strip_suffix("ms"))
        .and_then(|l| l.parse().ok())
        .filter(|l: &f64| l.is_finite() && *l >= 0.0)
        .ok_or_else(bad)?;
    if fields.next().is_some() {
        return Err(bad());
    }

    Ok(ClassifiedResult {
        address: endpoint.ip(),
        port: endpoint.port(),
        latency_ms,
        country: country.to_string(),
        source_type,
    })
}

pub fn country_file(dir: &Path, country: &str) -> PathBuf {
    dir.join(format!("{country}{RESULT_SUFFIX}"))
}

pub fn ensure_output_dir(dir: &Path) -> Result<()> {
    fs::create_dir_all(dir).map_err(|source| ScanError::OutputDir {
        path: dir.to_path_buf(),
        source,
    })
}

/// Write via a sibling temp file and rename, so readers never see a partial file.
pub fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    let persist_err = |source| ScanError::Persist {
        path: path.to_path_buf(),
        source,
    };
    fs::write(&tmp, contents).map_err(persist_err)?;
    fs::rename(&tmp, path).map_err(persist_err)
}

/// Per-country line in the summary.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CountrySummary {
    pub country: String,
    pub count: usize,
    pub target: Option<usize>,
    pub mean_latency_ms: Option<f64>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub generated_at: String,
    pub countries: Vec<CountrySummary>,
    /// Target countries that did not reach their quota.
    pub unsatisfied: Vec<String>,
    pub total: usize,
}

impl RunSummary {
    fn from_rows(rows: Vec<(String, Option<usize>, Vec<ClassifiedResult>)>, unsatisfied: Vec<String>) -> Self {
        let countries: Vec<CountrySummary> = rows
            .into_iter()
            .map(|(country, target, results)| {
                let count = results.len();
                let mean_latency_ms = (count > 0)
                    .then(|| results.iter().map(|r| r.latency_ms).sum::<f64>() / count as f64);
                CountrySummary {
                    country,
                    count,
                    target,
                    mean_latency_ms,
                }
            })
            .collect();
        let total = countries.iter().map(|c| c.count).sum();
        RunSummary {
            generated_at: now_rfc3339(),
            countries,
            unsatisfied,
            total,
        }
    }

    pub fn to_text(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "# edge-scan summary");
        let _ = writeln!(out, "# generated: {}", self.generated_at);
        let _ = writeln!(out);
        for c in &self.countries {
            let mean = c
                .mean_latency_ms
                .map(|m| format!("{m:.1}ms"))
                .unwrap_or_else(|| "-".to_string());
            match c.target {
                Some(t) => {
                    let _ = writeln!(out, "{}: {}/{} endpoints, mean latency {}", c.country, c.count, t, mean);
                }
                None => {
                    let _ = writeln!(out, "{}: {} endpoints, mean latency {}", c.country, c.count, mean);
                }
            }
        }
        let _ = writeln!(out);
        if self.unsatisfied.is_empty() {
            let _ = writeln!(out, "unsatisfied: none");
        } else {
            let _ = writeln!(out, "unsatisfied: {}", self.unsatisfied.join(", "));
        }
        let _ = writeln!(out, "total: {}", self.total);
        out
    }
}

fn now_rfc3339() -> String {
    OffsetDateTime::now_utc()
        .format(&well_known::Rfc3339)
        .unwrap_or_else(|_| String::from("1970-01-01T00:00:00Z"))
}

fn render_rows(rows: &[ClassifiedResult]) -> String {
    let mut out = String::new();
    for r in rows {
        out.push_str(&format_line(r));
        out.push('\n');
    }
    out
}

fn write_summary(dir: &Path, summary: &RunSummary) -> Result<()> {
    write_atomic(&dir.join(SUMMARY_TXT), &summary.to_text())?;
    let json = serde_json::to_string_pretty(summary).map_err(|e| ScanError::Persist {
        path: dir.join(SUMMARY_JSON),
        source: e.into(),
    })?;
    write_atomic(&dir.join(SUMMARY_JSON), &json)
}

/// Write each target country's fastest `target_count` results plus the summary.
pub fn write_results(dir: &Path, store: &ResultStore, quota: &QuotaTracker) -> Result<RunSummary> {
    ensure_output_dir(dir)?;
    let mut rows = Vec::new();
    for QuotaTarget { country, target_count } in quota.targets() {
        let top = store.top_n(&country, target_count);
        // Written even when empty.
        write_atomic(&country_file(dir, &country), &render_rows(&top))?;
        rows.push((country, Some(target_count), top));
    }
    let summary = RunSummary::from_rows(rows, quota.unsatisfied());
    write_summary(dir, &summary)?;
    Ok(summary)
}

fn result_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let read = fs::read_dir(dir).map_err(|source| ScanError::Persist {
        path: dir.to_path_buf(),
        source,
    })?;
    let mut files: Vec<PathBuf> = read
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| {
            p.is_file()
                && p.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.ends_with(RESULT_SUFFIX))
        })
        .collect();
    files.sort();
    Ok(files)
}

/// Load every result file in `dir`. Unparsable lines are logged and skipped.
pub fn load_dir(dir: &Path) -> Result<ResultStore> {
    let mut store = ResultStore::new();
    for file in result_files(dir)? {
        let text = fs::read_to_string(&file).map_err(|source| ScanError::Persist {
            path: file.clone(),
            source,
        })?;
        for (idx, line) in text.lines().enumerate() {
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            match parse_line(trimmed) {
                Ok(r) => {
                    store.put(r);
                }
                Err(e) => warn!(file = %file.display(), line = idx + 1, "{e}; skipping"),
            }
        }
    }
    Ok(store)
}

/// Directories holding result files: `root` itself, or else its immediate subdirectories.
fn run_dirs(root: &Path) -> Result<Vec<PathBuf>> {
    if !result_files(root)?.is_empty() {
        return Ok(vec![root.to_path_buf()]);
    }
    let read = fs::read_dir(root).map_err(|source| ScanError::Persist {
        path: root.to_path_buf(),
        source,
    })?;
    let mut dirs: Vec<PathBuf> = read
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| p.is_dir())
        .collect();
    dirs.sort();
    let mut out = Vec::new();
    for d in dirs {
        if !result_files(&d)?.is_empty() {
            out.push(d);
        }
    }
    Ok(out)
}

/// Combine results from independent runs and write them to `output`.
///
/// Each input is a result directory or a parent of several. Entries are
/// deduplicated by endpoint keeping the lowest latency; `cap` limits each country.
pub fn merge_dirs(inputs: &[PathBuf], output: &Path, cap: Option<usize>) -> Result<RunSummary> {
    let mut merged = ResultStore::new();
    let mut runs = 0usize;
    for input in inputs {
        for dir in run_dirs(input)? {
            let store = load_dir(&dir)?;
            info!(dir = %dir.display(), entries = store.len(), "loaded run");
            merged.merge_from(&store);
            runs += 1;
        }
    }
    info!(runs, endpoints = merged.len(), "merged results");

    ensure_output_dir(output)?;
    let limit = cap.unwrap_or(usize::MAX);
    let mut rows = Vec::new();
    for country in merged.countries() {
        let top = merged.top_n(&country, limit);
        write_atomic(&country_file(output, &country), &render_rows(&top))?;
        rows.push((country, None, top));
    }
    let summary = RunSummary::from_rows(rows, Vec::new());
    write_summary(output, &summary)?;
    Ok(summary)
}

/// Destination for accumulated results, called after every batch and at the end.
pub trait ResultSink: Send + Sync {
    fn persist(&self, store: &ResultStore, quota: &QuotaTracker) -> Result<()>;
}

/// Writes result files into one directory.
#[derive(Debug, Clone)]
pub struct DirectorySink {
    dir: PathBuf,
}

impl DirectorySink {
    /// Creates the directory up front; failure here is fatal for a run.
    pub fn create(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        ensure_output_dir(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl ResultSink for DirectorySink {
    fn persist(&self, store: &ResultStore, quota: &QuotaTracker) -> Result<()> {
        write_results(&self.dir, store, quota).map(|_| ())
    }
}

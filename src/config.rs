use crate::error::{Result, ScanError};
use crate::ports;
use crate::prober::ProbeSettings;
use crate::quota::StopPolicy;
use crate::sources::{self, SourceSpec};
use crate::types::QuotaTarget;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

const DEFAULT_CONCURRENCY: usize = 30;
const DEFAULT_MAX_LATENCY_MS: u64 = 2000;

/// Environment profile; replaces sniffing CI variables at runtime.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum RunProfile {
    /// Every known source, large pool.
    #[default]
    Full,
    /// Fewer, reliably reachable sources and tighter limits for CI runners.
    Ci,
}

impl RunProfile {
    pub fn sources(self) -> Vec<SourceSpec> {
        match self {
            RunProfile::Full => sources::default_sources(),
            RunProfile::Ci => sources::ci_sources(),
        }
    }

    pub fn pool_ceiling(self) -> usize {
        match self {
            RunProfile::Full => 10_000,
            RunProfile::Ci => 5_000,
        }
    }

    pub fn source_timeout(self) -> Duration {
        match self {
            RunProfile::Full => Duration::from_secs(30),
            RunProfile::Ci => Duration::from_secs(10),
        }
    }
}

impl FromStr for RunProfile {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "full" => Ok(RunProfile::Full),
            "ci" => Ok(RunProfile::Ci),
            other => Err(format!("unknown profile: {other}")),
        }
    }
}

/// Everything a scan run needs.
#[derive(Debug, Clone)]
pub struct ScanConfig {
    pub targets: Vec<QuotaTarget>,
    pub concurrency: usize,
    /// Defaults to `concurrency` so one batch saturates the worker pool once.
    pub batch_size: Option<usize>,
    pub ports: Vec<u16>,
    /// Results slower than this never count against a quota.
    pub max_latency_ms: u64,
    /// Candidate pool ceiling; `None` uses the profile's.
    pub max_pool: Option<usize>,
    pub output_dir: PathBuf,
    pub probe: ProbeSettings,
    pub stop_policy: StopPolicy,
    pub profile: RunProfile,
    /// Replaces the profile's source list when set.
    pub sources: Option<Vec<SourceSpec>>,
    /// Seed for sampling and shuffling; random when unset.
    pub seed: Option<u64>,
    /// Load existing results from `output_dir` before probing.
    pub resume: bool,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            targets: default_targets(),
            concurrency: DEFAULT_CONCURRENCY,
            batch_size: None,
            ports: ports::default_ports(),
            max_latency_ms: DEFAULT_MAX_LATENCY_MS,
            max_pool: None,
            output_dir: PathBuf::from("ip_results"),
            probe: ProbeSettings::default(),
            stop_policy: StopPolicy::default(),
            profile: RunProfile::default(),
            sources: None,
            seed: None,
            resume: false,
        }
    }
}

/// US and HK with 20 slots each, JP and SG with 5.
pub fn default_targets() -> Vec<QuotaTarget> {
    vec![
        QuotaTarget::new("US", 20),
        QuotaTarget::new("HK", 20),
        QuotaTarget::new("JP", 5),
        QuotaTarget::new("SG", 5),
    ]
}

impl ScanConfig {
    pub fn batch_size(&self) -> usize {
        self.batch_size.unwrap_or(self.concurrency).max(1)
    }

    pub fn pool_ceiling(&self) -> usize {
        self.max_pool.unwrap_or_else(|| self.profile.pool_ceiling())
    }

    pub fn sources(&self) -> Vec<SourceSpec> {
        self.sources.clone().unwrap_or_else(|| self.profile.sources())
    }

    pub fn max_latency_ms(&self) -> f64 {
        self.max_latency_ms as f64
    }

    pub fn validate(&self) -> Result<()> {
        if self.targets.is_empty() {
            return Err(ScanError::Config("at least one target country is required".into()));
        }
        let mut seen = HashSet::new();
        for t in &self.targets {
            if !seen.insert(t.country.as_str()) {
                return Err(ScanError::Config(format!("duplicate target country: {}", t.country)));
            }
        }
        if self.concurrency == 0 {
            return Err(ScanError::Config("concurrency must be at least 1".into()));
        }
        if self.batch_size == Some(0) {
            return Err(ScanError::Config("batch size must be at least 1".into()));
        }
        if self.ports.is_empty() {
            return Err(ScanError::Config("at least one probe port is required".into()));
        }
        if self.max_latency_ms == 0 {
            return Err(ScanError::Config("max latency must be positive".into()));
        }
        if self.probe.retry.attempts == 0 {
            return Err(ScanError::Config("retry attempts must be at least 1".into()));
        }
        if self.probe.connect_timeout.is_zero() {
            return Err(ScanError::Config("connect timeout must be positive".into()));
        }
        if self.stop_policy == StopPolicy::MinCountries(0) {
            return Err(ScanError::Config("min-countries must be at least 1".into()));
        }
        if matches!(self.sources.as_deref(), Some([])) {
            return Err(ScanError::Config("source list is empty".into()));
        }
        Ok(())
    }
}

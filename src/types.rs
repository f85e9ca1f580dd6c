use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

/// Country tag used when a region hint has no mapping.
pub const UNKNOWN_COUNTRY: &str = "UNKNOWN";

/// One endpoint to probe.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Candidate {
    pub address: IpAddr,
    pub port: u16,
}

impl Candidate {
    pub fn new(address: IpAddr, port: u16) -> Self {
        Self { address, port }
    }

    pub fn endpoint(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }
}

impl fmt::Display for Candidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.endpoint())
    }
}

/// Why a probe produced no measurement.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Private, loopback, link-local or unspecified address. Never dialed.
    Invalid,
    Timeout,
    Refused,
    Transport,
}

/// Result of probing one candidate (after retries).
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ProbeOutcome {
    pub candidate: Candidate,
    pub success: bool,
    /// Milliseconds; `f64::INFINITY` when `success` is false.
    pub latency_ms: f64,
    /// Colo code reported by the diagnostic endpoint, empty when unavailable.
    pub region_hint: String,
    /// Client address echoed by the diagnostic endpoint.
    pub echoed_address: Option<String>,
    pub failure_kind: Option<FailureKind>,
    /// Network attempts made; zero for rejected addresses.
    pub attempts: u32,
}

impl ProbeOutcome {
    pub fn measured(
        candidate: Candidate,
        latency_ms: f64,
        region_hint: String,
        echoed_address: Option<String>,
        attempts: u32,
    ) -> Self {
        Self {
            candidate,
            success: true,
            latency_ms,
            region_hint,
            echoed_address,
            failure_kind: None,
            attempts,
        }
    }

    pub fn failed(candidate: Candidate, kind: FailureKind, attempts: u32) -> Self {
        Self {
            candidate,
            success: false,
            latency_ms: f64::INFINITY,
            region_hint: String::new(),
            echoed_address: None,
            failure_kind: Some(kind),
            attempts,
        }
    }
}

/// Direct edge endpoint vs. an address relaying to one.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    Official,
    Proxy,
}

impl SourceType {
    /// Label written into persisted result lines.
    pub fn label(self) -> &'static str {
        match self {
            SourceType::Official => "official",
            SourceType::Proxy => "proxy",
        }
    }

    /// Parse a persisted label. Also understands the labels older result files used.
    pub fn from_label(label: &str) -> Option<Self> {
        match label {
            "official" | "官方优选" => Some(SourceType::Official),
            "proxy" | "反代优选" => Some(SourceType::Proxy),
            _ => None,
        }
    }

    /// `Proxy` when the diagnostic endpoint saw a different address than the one dialed.
    pub fn from_echo(dialed: IpAddr, echoed: Option<&str>) -> Self {
        let Some(echoed) = echoed.map(str::trim).filter(|s| !s.is_empty()) else {
            return SourceType::Official;
        };
        let same = match echoed.parse::<IpAddr>() {
            Ok(ip) => ip == dialed,
            Err(_) => echoed == dialed.to_string(),
        };
        if same {
            SourceType::Official
        } else {
            SourceType::Proxy
        }
    }
}

/// A successful, classified measurement ready for the result store.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ClassifiedResult {
    pub address: IpAddr,
    pub port: u16,
    pub latency_ms: f64,
    pub country: String,
    pub source_type: SourceType,
}

impl ClassifiedResult {
    pub fn endpoint(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }
}

/// Per-country quota supplied at startup.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct QuotaTarget {
    pub country: String,
    pub target_count: usize,
}

impl QuotaTarget {
    pub fn new(country: impl Into<String>, target_count: usize) -> Self {
        Self {
            country: country.into().to_ascii_uppercase(),
            target_count,
        }
    }
}

/// Parses `CC=N`, e.g. `US=20`.
impl FromStr for QuotaTarget {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (country, count) = s
            .split_once('=')
            .ok_or_else(|| format!("target must look like CC=N: {s}"))?;
        let country = country.trim();
        if country.is_empty() || !country.chars().all(|c| c.is_ascii_alphabetic()) {
            return Err(format!("invalid country code: {country:?}"));
        }
        let count = count
            .trim()
            .parse::<usize>()
            .map_err(|e| format!("invalid target count for {country}: {e}"))?;
        Ok(QuotaTarget::new(country, count))
    }
}

/// Transient per-batch bookkeeping; folded into the store and dropped.
#[derive(Debug, Clone)]
pub struct BatchState {
    pub batch_index: usize,
    pub candidates: Vec<Candidate>,
    pub outcomes: Vec<ProbeOutcome>,
}

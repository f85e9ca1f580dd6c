//! Address-list sources and the HTTP fetcher that retrieves them.
use crate::error::{Result, ScanError};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

/// How much a source is trusted; decides how densely its CIDR prefixes are sampled.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SourceTier {
    /// Hand-curated "best address" lists.
    Curated,
    /// Aggregated prefixes announced by an ASN.
    Asn,
    /// The provider's own published ranges.
    Official,
    /// `address[:port][#comment]` lines of known relays.
    ProxyList,
}

impl SourceTier {
    /// Hosts sampled per CIDR prefix.
    pub fn samples_per_cidr(self) -> usize {
        match self {
            SourceTier::Curated => 5,
            SourceTier::Asn | SourceTier::Official | SourceTier::ProxyList => 10,
        }
    }
}

impl FromStr for SourceTier {
    type Err = ScanError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "curated" => Ok(SourceTier::Curated),
            "asn" => Ok(SourceTier::Asn),
            "official" => Ok(SourceTier::Official),
            "proxy" | "proxy-list" | "proxylist" => Ok(SourceTier::ProxyList),
            other => Err(ScanError::Config(format!("unknown source tier: {other}"))),
        }
    }
}

/// One named address list.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SourceSpec {
    pub name: String,
    pub url: String,
    pub tier: SourceTier,
}

impl SourceSpec {
    pub fn new(name: &str, url: &str, tier: SourceTier) -> Self {
        Self {
            name: name.to_string(),
            url: url.to_string(),
            tier,
        }
    }
}

/// Parses `tier:name=url`, e.g. `asn:as13335=https://...`.
impl FromStr for SourceSpec {
    type Err = ScanError;

    fn from_str(s: &str) -> Result<Self> {
        let (head, url) = s
            .split_once('=')
            .ok_or_else(|| ScanError::Config(format!("source must be tier:name=url: {s}")))?;
        let (tier, name) = head
            .split_once(':')
            .ok_or_else(|| ScanError::Config(format!("source must be tier:name=url: {s}")))?;
        let name = name.trim();
        let url = url.trim();
        if name.is_empty() || url.is_empty() {
            return Err(ScanError::Config(format!("source must be tier:name=url: {s}")));
        }
        Ok(SourceSpec::new(name, url, tier.parse()?))
    }
}

const ASN_BASE: &str = "https://raw.githubusercontent.com/ipverse/asn-ip/master/as";

fn asn_source(asn: u32) -> SourceSpec {
    SourceSpec::new(
        &format!("as{asn}"),
        &format!("{ASN_BASE}/{asn}/ipv4-aggregated.txt"),
        SourceTier::Asn,
    )
}

/// Every source a full run draws from.
pub fn default_sources() -> Vec<SourceSpec> {
    vec![
        SourceSpec::new("official", "https://www.cloudflare.com/ips-v4/", SourceTier::Official),
        SourceSpec::new(
            "cm",
            "https://raw.githubusercontent.com/cmliu/cmliu/main/CF-CIDR.txt",
            SourceTier::Official,
        ),
        SourceSpec::new(
            "bestali",
            "https://raw.githubusercontent.com/ymyuuu/IPDB/refs/heads/main/BestAli/bestaliv4.txt",
            SourceTier::Curated,
        ),
        SourceSpec::new(
            "proxyip",
            "https://raw.githubusercontent.com/cmliu/ACL4SSR/main/baipiao.txt",
            SourceTier::ProxyList,
        ),
        SourceSpec::new(
            "cfip",
            "https://raw.githubusercontent.com/qianxiu203/cfipcaiji/refs/heads/main/ip.txt",
            SourceTier::Curated,
        ),
        asn_source(13335),
        asn_source(209242),
        asn_source(24429),
        asn_source(35916),
        asn_source(199524),
        SourceSpec::new(
            "bestcfv4",
            "https://raw.githubusercontent.com/ymyuuu/IPDB/refs/heads/main/BestCF/bestcfv4.txt",
            SourceTier::Curated,
        ),
    ]
}

/// Reduced, reliably reachable set used on CI runners.
pub fn ci_sources() -> Vec<SourceSpec> {
    let keep = ["official", "as13335", "as209242", "cm"];
    let all = default_sources();
    keep.iter()
        .filter_map(|name| all.iter().find(|s| s.name == *name).cloned())
        .collect()
}

/// Retrieves the raw text of a source.
#[async_trait]
pub trait SourceFetcher: Send + Sync {
    async fn fetch(&self, source: &SourceSpec) -> Result<String>;
}

/// Fetches sources over HTTP(S) with a shared connection pool.
#[derive(Clone, Debug)]
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout.min(Duration::from_secs(10)))
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .pool_max_idle_per_host(4)
            .build()
            .map_err(|e| ScanError::Config(format!("failed to create HTTP client: {e}")))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl SourceFetcher for HttpFetcher {
    async fn fetch(&self, source: &SourceSpec) -> Result<String> {
        let response = self
            .client
            .get(&source.url)
            .send()
            .await
            .map_err(|e| ScanError::fetch(&source.name, e))?;
        let status = response.status();
        if !status.is_success() {
            return Err(ScanError::fetch(&source.name, format!("HTTP {status}")));
        }
        response
            .text()
            .await
            .map_err(|e| ScanError::fetch(&source.name, e))
    }
}

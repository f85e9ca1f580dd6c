use crate::error::{Result, ScanError};
use crate::sources::{SourceFetcher, SourceSpec, SourceTier};
use crate::types::Candidate;
use ipnet::Ipv4Net;
use rand::seq::SliceRandom;
use rand::Rng;
use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr};
use tracing::{debug, info, warn};

/// Port assumed for proxy-list entries that carry none.
pub const PROXY_LIST_DEFAULT_PORT: u16 = 443;

/// Draw up to `k` distinct host addresses from `net`.
///
/// Network and broadcast addresses are never returned. When the prefix holds no
/// more usable hosts than requested, all of them are returned; otherwise offsets
/// are drawn at random and duplicates rejected, giving up after `10 * k` draws.
pub fn sample_cidr_hosts<R: Rng>(net: Ipv4Net, k: usize, rng: &mut R) -> Vec<Ipv4Addr> {
    let net = net.trunc();
    let total = 1u64 << (32 - u32::from(net.prefix_len()));
    let usable = total.saturating_sub(2);
    if usable == 0 || k == 0 {
        return Vec::new();
    }
    let base = u32::from(net.network());
    let host = |offset: u64| Ipv4Addr::from(base + offset as u32);

    if usable <= k as u64 {
        return (1..=usable).map(host).collect();
    }

    if usable <= 2 * k as u64 {
        // Dense: shuffle the whole (small) range instead of rejecting.
        let mut offsets: Vec<u64> = (1..=usable).collect();
        let (picked, _) = offsets.partial_shuffle(rng, k);
        return picked.iter().copied().map(host).collect();
    }

    let mut seen = HashSet::with_capacity(k);
    let mut out = Vec::with_capacity(k);
    let mut attempts = 0;
    while out.len() < k && attempts < k * 10 {
        attempts += 1;
        let offset = rng.gen_range(1..=usable);
        if seen.insert(offset) {
            out.push(host(offset));
        }
    }
    out
}

/// Candidates parsed from one source body.
#[derive(Debug, Default, Clone)]
pub struct ParsedSource {
    pub candidates: Vec<Candidate>,
    /// Lines that were neither an address nor a prefix.
    pub skipped_lines: usize,
}

/// Turn the raw text of a source into candidates.
///
/// Bare addresses and sampled prefix hosts are paired with every probe port.
/// Proxy-list entries keep their own port and are dropped unless it is a probe port.
pub fn parse_source_text<R: Rng>(
    text: &str,
    tier: SourceTier,
    ports: &[u16],
    rng: &mut R,
) -> ParsedSource {
    let mut parsed = ParsedSource::default();
    for (idx, raw) in text.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        match parse_line(idx + 1, line, tier, ports, rng) {
            Ok(cands) => parsed.candidates.extend(cands),
            Err(e) => {
                debug!("{e}");
                parsed.skipped_lines += 1;
            }
        }
    }
    parsed
}

fn parse_line<R: Rng>(
    line_no: usize,
    line: &str,
    tier: SourceTier,
    ports: &[u16],
    rng: &mut R,
) -> Result<Vec<Candidate>> {
    if tier == SourceTier::ProxyList {
        return Ok(parse_proxy_entry(line, ports).into_iter().collect());
    }
    let malformed = || ScanError::SourceParse {
        line_no,
        line: line.to_string(),
    };
    let with_ports = |ip: Ipv4Addr| {
        ports
            .iter()
            .map(move |&p| Candidate::new(IpAddr::V4(ip), p))
    };
    if line.contains('/') {
        let net: Ipv4Net = line.parse().map_err(|_| malformed())?;
        return Ok(sample_cidr_hosts(net, tier.samples_per_cidr(), rng)
            .into_iter()
            .flat_map(with_ports)
            .collect());
    }
    let ip: Ipv4Addr = line.parse().map_err(|_| malformed())?;
    Ok(with_ports(ip).collect())
}

/// Parse `address[:port][#comment]`; `None` when malformed or on a port we do not probe.
pub fn parse_proxy_entry(line: &str, ports: &[u16]) -> Option<Candidate> {
    let main = line.split('#').next()?.trim();
    if main.is_empty() {
        return None;
    }
    let (host, port) = match main.split_once(':') {
        Some((h, p)) => (h.trim(), p.trim().parse::<u16>().ok()?),
        None => (main, PROXY_LIST_DEFAULT_PORT),
    };
    if port == 0 || !ports.contains(&port) {
        return None;
    }
    let ip: Ipv4Addr = host.parse().ok()?;
    Some(Candidate::new(IpAddr::V4(ip), port))
}

/// Accumulates a deduplicated candidate pool up to a ceiling.
#[derive(Debug)]
pub struct PoolBuilder {
    ceiling: usize,
    seen: HashSet<Candidate>,
    pool: Vec<Candidate>,
}

impl PoolBuilder {
    /// A ceiling of zero means unbounded.
    pub fn new(ceiling: usize) -> Self {
        Self {
            ceiling: if ceiling == 0 { usize::MAX } else { ceiling },
            seen: HashSet::new(),
            pool: Vec::new(),
        }
    }

    /// Add candidates until the ceiling is hit; returns how many were new.
    pub fn extend(&mut self, candidates: impl IntoIterator<Item = Candidate>) -> usize {
        let before = self.pool.len();
        for c in candidates {
            if self.is_full() {
                break;
            }
            if self.seen.insert(c) {
                self.pool.push(c);
            }
        }
        self.pool.len() - before
    }

    pub fn is_full(&self) -> bool {
        self.pool.len() >= self.ceiling
    }

    pub fn len(&self) -> usize {
        self.pool.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pool.is_empty()
    }

    /// Shuffle so early stopping does not favour whichever source came first.
    pub fn finish<R: Rng>(mut self, rng: &mut R) -> Vec<Candidate> {
        self.pool.shuffle(rng);
        self.pool
    }
}

/// Fetch every source and build the shuffled candidate pool.
///
/// A failing source is logged and skipped. An empty pool is fatal.
pub async fn expand_sources<R: Rng + Send>(
    fetcher: &dyn SourceFetcher,
    sources: &[SourceSpec],
    ports: &[u16],
    ceiling: usize,
    rng: &mut R,
) -> Result<Vec<Candidate>> {
    let mut builder = PoolBuilder::new(ceiling);
    for source in sources {
        if builder.is_full() {
            info!(pool = builder.len(), "candidate pool reached its ceiling, skipping remaining sources");
            break;
        }
        let text = match fetcher.fetch(source).await {
            Ok(text) => text,
            Err(e) => {
                warn!("{e}; skipping source");
                continue;
            }
        };
        let parsed = parse_source_text(&text, source.tier, ports, rng);
        let added = builder.extend(parsed.candidates);
        info!(
            source = %source.name,
            added,
            skipped_lines = parsed.skipped_lines,
            pool = builder.len(),
            "source expanded"
        );
    }
    if builder.is_empty() {
        return Err(ScanError::NoCandidates);
    }
    Ok(builder.finish(rng))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn rng() -> StdRng {
        StdRng::seed_from_u64(7)
    }

    #[test]
    fn slash30_yields_both_hosts() {
        let net: Ipv4Net = "198.51.100.0/30".parse().unwrap();
        let mut hosts = sample_cidr_hosts(net, 5, &mut rng());
        hosts.sort();
        assert_eq!(
            hosts,
            vec![Ipv4Addr::new(198, 51, 100, 1), Ipv4Addr::new(198, 51, 100, 2)]
        );
    }

    #[test]
    fn tiny_prefixes_yield_nothing() {
        let n31: Ipv4Net = "10.0.0.0/31".parse().unwrap();
        let n32: Ipv4Net = "10.0.0.7/32".parse().unwrap();
        assert!(sample_cidr_hosts(n31, 5, &mut rng()).is_empty());
        assert!(sample_cidr_hosts(n32, 5, &mut rng()).is_empty());
    }

    #[test]
    fn samples_are_distinct_and_inside() {
        let net: Ipv4Net = "104.16.0.0/12".parse().unwrap();
        let hosts = sample_cidr_hosts(net, 10, &mut rng());
        assert_eq!(hosts.len(), 10);
        let unique: HashSet<_> = hosts.iter().collect();
        assert_eq!(unique.len(), 10);
        for h in hosts {
            assert!(net.contains(&h));
            assert_ne!(h, net.network());
            assert_ne!(h, net.broadcast());
        }
    }

    #[test]
    fn dense_prefix_returns_exactly_k() {
        // /29 has 6 usable hosts
        let net: Ipv4Net = "192.0.2.8/29".parse().unwrap();
        let hosts = sample_cidr_hosts(net, 5, &mut rng());
        assert_eq!(hosts.len(), 5);
        let unique: HashSet<_> = hosts.iter().collect();
        assert_eq!(unique.len(), 5);
    }

    #[test]
    fn proxy_entries_filtered_by_port() {
        let ports = [443, 8443];
        assert_eq!(
            parse_proxy_entry("1.2.3.4:8443#HK relay", &ports),
            Some(Candidate::new("1.2.3.4".parse().unwrap(), 8443))
        );
        assert_eq!(
            parse_proxy_entry("1.2.3.4", &ports),
            Some(Candidate::new("1.2.3.4".parse().unwrap(), 443))
        );
        assert_eq!(parse_proxy_entry("1.2.3.4:2053", &ports), None);
        assert_eq!(parse_proxy_entry("nope:443", &ports), None);
        assert_eq!(parse_proxy_entry("1.2.3.4:1:2", &ports), None);
    }

    #[test]
    fn parse_text_skips_comments_and_garbage() {
        let text = "# header\n1.1.1.1\n\nnot-an-ip\n2001:db8::/32\n";
        let parsed = parse_source_text(text, SourceTier::Curated, &[443, 8443], &mut rng());
        assert_eq!(parsed.candidates.len(), 2);
        assert_eq!(parsed.skipped_lines, 2);
    }

    #[test]
    fn pool_dedups_and_caps() {
        let a = Candidate::new("1.1.1.1".parse().unwrap(), 443);
        let b = Candidate::new("1.1.1.2".parse().unwrap(), 443);
        let c = Candidate::new("1.1.1.3".parse().unwrap(), 443);
        let mut pool = PoolBuilder::new(2);
        assert_eq!(pool.extend([a, a, b, c]), 2);
        assert!(pool.is_full());
        let out = pool.finish(&mut rng());
        assert_eq!(out.len(), 2);
        assert!(out.contains(&a) && out.contains(&b));
    }
}

use async_trait::async_trait;
use edge_scan_rs::error::{Result, ScanError};
use edge_scan_rs::expander::expand_sources;
use edge_scan_rs::sources::{SourceFetcher, SourceSpec, SourceTier};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr};

struct StaticFetcher {
    bodies: HashMap<String, String>,
}

#[async_trait]
impl SourceFetcher for StaticFetcher {
    async fn fetch(&self, source: &SourceSpec) -> Result<String> {
        self.bodies
            .get(&source.name)
            .cloned()
            .ok_or_else(|| ScanError::fetch(&source.name, "HTTP 404 Not Found"))
    }
}

fn fetcher(entries: &[(&str, &str)]) -> StaticFetcher {
    StaticFetcher {
        bodies: entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
    }
}

#[tokio::test]
async fn slash30_source_expands_to_two_distinct_hosts() {
    let f = fetcher(&[("list", "198.51.100.0/30\n")]);
    let sources = vec![SourceSpec::new("list", "https://example.invalid/list", SourceTier::Curated)];
    let mut rng = StdRng::seed_from_u64(1);
    let pool = expand_sources(&f, &sources, &[443], 10_000, &mut rng)
        .await
        .expect("pool");

    let mut ips: Vec<IpAddr> = pool.iter().map(|c| c.address).collect();
    ips.sort();
    assert_eq!(
        ips,
        vec![
            IpAddr::V4(Ipv4Addr::new(198, 51, 100, 1)),
            IpAddr::V4(Ipv4Addr::new(198, 51, 100, 2)),
        ]
    );
}

#[tokio::test]
async fn failing_source_is_skipped_and_overlap_deduplicated() {
    let f = fetcher(&[
        ("a", "# comment\n1.1.1.1\n1.1.1.2\n"),
        ("c", "1.1.1.2\n1.1.1.3\n"),
    ]);
    let sources = vec![
        SourceSpec::new("a", "https://example.invalid/a", SourceTier::Curated),
        SourceSpec::new("b", "https://example.invalid/b", SourceTier::Asn),
        SourceSpec::new("c", "https://example.invalid/c", SourceTier::Curated),
    ];
    let mut rng = StdRng::seed_from_u64(2);
    let pool = expand_sources(&f, &sources, &[443, 8443], 0, &mut rng)
        .await
        .expect("pool");

    assert_eq!(pool.len(), 6);
    let unique: HashSet<_> = pool.iter().collect();
    assert_eq!(unique.len(), pool.len());
}

#[tokio::test]
async fn ceiling_bounds_pool() {
    let f = fetcher(&[("asn", "104.16.0.0/13\n172.64.0.0/13\n")]);
    let sources = vec![SourceSpec::new("asn", "https://example.invalid/asn", SourceTier::Asn)];
    let mut rng = StdRng::seed_from_u64(3);
    let pool = expand_sources(&f, &sources, &[443], 15, &mut rng)
        .await
        .expect("pool");
    assert_eq!(pool.len(), 15);
}

#[tokio::test]
async fn all_sources_failing_is_fatal() {
    let f = fetcher(&[("junk", "nothing useful here\n")]);
    let sources = vec![
        SourceSpec::new("missing", "https://example.invalid/m", SourceTier::Official),
        SourceSpec::new("junk", "https://example.invalid/j", SourceTier::Curated),
    ];
    let mut rng = StdRng::seed_from_u64(4);
    let err = expand_sources(&f, &sources, &[443], 0, &mut rng)
        .await
        .unwrap_err();
    assert!(matches!(err, ScanError::NoCandidates));
    assert!(err.is_fatal());
}

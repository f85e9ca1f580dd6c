use crate::types::{ClassifiedResult, QuotaTarget};
use std::collections::BTreeMap;
use std::net::SocketAddr;

/// Best-known result per endpoint; lowest latency wins.
#[derive(Debug, Clone, Default)]
pub struct ResultStore {
    entries: BTreeMap<SocketAddr, ClassifiedResult>,
}

/// What `put` did with a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    Inserted,
    Improved,
    /// Existing entry was at least as fast, or the latency was not a valid measurement.
    Kept,
}

impl ResultStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert, or replace an existing entry for the same endpoint if strictly faster.
    pub fn put(&mut self, result: ClassifiedResult) -> PutOutcome {
        if !result.latency_ms.is_finite() || result.latency_ms < 0.0 {
            return PutOutcome::Kept;
        }
        match self.entries.get_mut(&result.endpoint()) {
            Some(existing) if result.latency_ms < existing.latency_ms => {
                *existing = result;
                PutOutcome::Improved
            }
            Some(_) => PutOutcome::Kept,
            None => {
                self.entries.insert(result.endpoint(), result);
                PutOutcome::Inserted
            }
        }
    }

    /// Fold another store in with the same lowest-latency rule.
    pub fn merge_from(&mut self, other: &ResultStore) {
        for r in other.entries.values() {
            self.put(r.clone());
        }
    }

    pub fn contains(&self, endpoint: &SocketAddr) -> bool {
        self.entries.contains_key(endpoint)
    }

    pub fn get(&self, endpoint: &SocketAddr) -> Option<&ClassifiedResult> {
        self.entries.get(endpoint)
    }

    /// The `n` fastest entries for `country`, ascending; ties keep endpoint order.
    pub fn top_n(&self, country: &str, n: usize) -> Vec<ClassifiedResult> {
        let mut rows: Vec<ClassifiedResult> = self
            .entries
            .values()
            .filter(|r| r.country == country)
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.latency_ms.total_cmp(&b.latency_ms));
        rows.truncate(n);
        rows
    }

    pub fn count(&self, country: &str) -> usize {
        self.entries.values().filter(|r| r.country == country).count()
    }

    /// Distinct countries present, sorted.
    pub fn countries(&self) -> Vec<String> {
        let mut out: Vec<String> = self.entries.values().map(|r| r.country.clone()).collect();
        out.sort();
        out.dedup();
        out
    }

    /// Keep only target countries, each cut to its fastest `target_count` entries.
    pub fn truncate_to(&mut self, targets: &[QuotaTarget]) {
        let mut kept = BTreeMap::new();
        for t in targets {
            for r in self.top_n(&t.country, t.target_count) {
                kept.insert(r.endpoint(), r);
            }
        }
        self.entries = kept;
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ClassifiedResult> {
        self.entries.values()
    }
}

impl FromIterator<ClassifiedResult> for ResultStore {
    fn from_iter<I: IntoIterator<Item = ClassifiedResult>>(iter: I) -> Self {
        let mut store = ResultStore::new();
        for r in iter {
            store.put(r);
        }
        store
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SourceType;

    fn r(ip: &str, port: u16, latency_ms: f64, country: &str) -> ClassifiedResult {
        ClassifiedResult {
            address: ip.parse().unwrap(),
            port,
            latency_ms,
            country: country.to_string(),
            source_type: SourceType::Official,
        }
    }

    #[test]
    fn duplicate_keeps_lower_latency() {
        let mut s = ResultStore::new();
        assert_eq!(s.put(r("1.2.3.4", 443, 40.0, "US")), PutOutcome::Inserted);
        assert_eq!(s.put(r("1.2.3.4", 443, 55.0, "US")), PutOutcome::Kept);
        assert_eq!(s.put(r("1.2.3.4", 443, 25.0, "US")), PutOutcome::Improved);
        assert_eq!(s.len(), 1);
        assert_eq!(s.get(&"1.2.3.4:443".parse().unwrap()).unwrap().latency_ms, 25.0);
    }

    #[test]
    fn same_address_other_port_is_distinct() {
        let mut s = ResultStore::new();
        s.put(r("1.2.3.4", 443, 40.0, "US"));
        s.put(r("1.2.3.4", 8443, 40.0, "US"));
        assert_eq!(s.len(), 2);
    }

    #[test]
    fn rejects_non_finite_and_negative() {
        let mut s = ResultStore::new();
        assert_eq!(s.put(r("1.2.3.4", 443, f64::INFINITY, "US")), PutOutcome::Kept);
        assert_eq!(s.put(r("1.2.3.4", 443, f64::NAN, "US")), PutOutcome::Kept);
        assert_eq!(s.put(r("1.2.3.4", 443, -1.0, "US")), PutOutcome::Kept);
        assert!(s.is_empty());
    }

    #[test]
    fn merge_takes_lower() {
        let a: ResultStore = [r("1.2.3.4", 443, 40.0, "US")].into_iter().collect();
        let b: ResultStore = [r("1.2.3.4", 443, 25.0, "US"), r("5.6.7.8", 443, 90.0, "HK")]
            .into_iter()
            .collect();
        let mut merged = a.clone();
        merged.merge_from(&b);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged.top_n("US", 10)[0].latency_ms, 25.0);
    }

    #[test]
    fn top_n_sorted_and_truncate_to_targets() {
        let mut s: ResultStore = [
            r("1.0.0.1", 443, 50.0, "US"),
            r("1.0.0.2", 443, 30.0, "US"),
            r("1.0.0.3", 443, 80.0, "US"),
            r("1.0.0.4", 443, 10.0, "JP"),
        ]
        .into_iter()
        .collect();
        let lat: Vec<f64> = s.top_n("US", 2).iter().map(|x| x.latency_ms).collect();
        assert_eq!(lat, vec![30.0, 50.0]);

        s.truncate_to(&[QuotaTarget::new("US", 2)]);
        assert_eq!(s.len(), 2);
        assert_eq!(s.count("JP"), 0);
        assert_eq!(s.countries(), vec!["US".to_string()]);
    }
}

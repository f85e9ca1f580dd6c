use crate::types::QuotaTarget;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;

/// Current vs. target accepted counts per country.
#[derive(Debug, Clone, Default)]
pub struct QuotaTracker {
    targets: BTreeMap<String, usize>,
    current: BTreeMap<String, usize>,
    /// Target order as supplied, for reporting.
    order: Vec<String>,
}

impl QuotaTracker {
    pub fn new(targets: &[QuotaTarget]) -> Self {
        let mut tracker = QuotaTracker::default();
        for t in targets {
            if tracker.targets.insert(t.country.clone(), t.target_count).is_none() {
                tracker.order.push(t.country.clone());
            }
            tracker.current.entry(t.country.clone()).or_insert(0);
        }
        tracker
    }

    /// Whether one more new endpoint for `country` may be accepted.
    pub fn accept(&self, country: &str) -> bool {
        match self.targets.get(country) {
            Some(&target) => self.current(country) < target,
            None => false,
        }
    }

    /// Count an accepted insert. Ignored for non-target or already full countries.
    pub fn record(&mut self, country: &str) {
        if self.accept(country) {
            *self.current.entry(country.to_string()).or_insert(0) += 1;
        }
    }

    /// Seed a count, e.g. from results loaded for a resumed run. Clamped to the target.
    pub fn set_current(&mut self, country: &str, count: usize) {
        if let Some(&target) = self.targets.get(country) {
            self.current.insert(country.to_string(), count.min(target));
        }
    }

    pub fn current(&self, country: &str) -> usize {
        self.current.get(country).copied().unwrap_or(0)
    }

    pub fn target(&self, country: &str) -> Option<usize> {
        self.targets.get(country).copied()
    }

    pub fn is_satisfied(&self, country: &str) -> bool {
        self.target(country)
            .map(|t| self.current(country) >= t)
            .unwrap_or(false)
    }

    pub fn all_satisfied(&self) -> bool {
        self.order.iter().all(|c| self.is_satisfied(c))
    }

    pub fn satisfied_count(&self) -> usize {
        self.order.iter().filter(|c| self.is_satisfied(c)).count()
    }

    /// Target countries still short of their quota, in supplied order.
    pub fn unsatisfied(&self) -> Vec<String> {
        self.order
            .iter()
            .filter(|c| !self.is_satisfied(c))
            .cloned()
            .collect()
    }

    pub fn countries(&self) -> &[String] {
        &self.order
    }

    pub fn targets(&self) -> Vec<QuotaTarget> {
        self.order
            .iter()
            .map(|c| QuotaTarget::new(c.clone(), self.targets[c]))
            .collect()
    }
}

/// When the orchestrator ends a run early, checked once per batch.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum StopPolicy {
    /// Stop once every target country has met its quota.
    #[default]
    StopOnQuota,
    /// Probe the whole pool regardless of quotas.
    RunAllBatches,
    /// Stop once at least this many target countries have met their quota.
    MinCountries(usize),
}

impl StopPolicy {
    pub fn should_stop(&self, quota: &QuotaTracker) -> bool {
        match *self {
            StopPolicy::StopOnQuota => quota.all_satisfied(),
            StopPolicy::RunAllBatches => false,
            StopPolicy::MinCountries(n) => quota.satisfied_count() >= n.min(quota.countries().len()),
        }
    }
}

/// Accepts `stop-on-quota`, `run-all-batches` and `min-countries=N`.
impl FromStr for StopPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_ascii_lowercase();
        match s.as_str() {
            "stop-on-quota" => Ok(StopPolicy::StopOnQuota),
            "run-all-batches" => Ok(StopPolicy::RunAllBatches),
            other => match other.strip_prefix("min-countries=") {
                Some(n) => match n.parse::<usize>() {
                    Ok(0) => Err("min-countries must be at least 1".to_string()),
                    Ok(n) => Ok(StopPolicy::MinCountries(n)),
                    Err(e) => Err(format!("invalid min-countries value {n:?}: {e}")),
                },
                None => Err(format!("unknown stop policy: {other}")),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> QuotaTracker {
        QuotaTracker::new(&[QuotaTarget::new("US", 2), QuotaTarget::new("HK", 1)])
    }

    #[test]
    fn accept_until_full() {
        let mut q = tracker();
        assert!(q.accept("US"));
        q.record("US");
        q.record("US");
        assert!(!q.accept("US"));
        q.record("US");
        assert_eq!(q.current("US"), 2);
    }

    #[test]
    fn non_target_never_accepted() {
        let mut q = tracker();
        assert!(!q.accept("JP"));
        assert!(!q.accept("UNKNOWN"));
        q.record("JP");
        assert_eq!(q.current("JP"), 0);
    }

    #[test]
    fn all_satisfied_and_unsatisfied() {
        let mut q = tracker();
        assert_eq!(q.unsatisfied(), vec!["US", "HK"]);
        q.record("HK");
        assert!(!q.all_satisfied());
        assert_eq!(q.unsatisfied(), vec!["US"]);
        q.set_current("US", 9);
        assert_eq!(q.current("US"), 2);
        assert!(q.all_satisfied());
    }

    #[test]
    fn zero_target_is_immediately_satisfied() {
        let q = QuotaTracker::new(&[QuotaTarget::new("SG", 0)]);
        assert!(!q.accept("SG"));
        assert!(q.all_satisfied());
    }

    #[test]
    fn stop_policies() {
        let mut q = tracker();
        q.record("HK");
        assert!(!StopPolicy::StopOnQuota.should_stop(&q));
        assert!(StopPolicy::MinCountries(1).should_stop(&q));
        assert!(!StopPolicy::MinCountries(2).should_stop(&q));
        q.record("US");
        q.record("US");
        assert!(StopPolicy::StopOnQuota.should_stop(&q));
        assert!(!StopPolicy::RunAllBatches.should_stop(&q));
    }

    #[test]
    fn parse_stop_policy() {
        assert_eq!("stop-on-quota".parse::<StopPolicy>(), Ok(StopPolicy::StopOnQuota));
        assert_eq!("Run-All-Batches".parse::<StopPolicy>(), Ok(StopPolicy::RunAllBatches));
        assert_eq!("min-countries=3".parse::<StopPolicy>(), Ok(StopPolicy::MinCountries(3)));
        assert!("min-countries=x".parse::<StopPolicy>().is_err());
        assert!("min-countries=0".parse::<StopPolicy>().is_err());
        assert!("whenever".parse::<StopPolicy>().is_err());
    }
}

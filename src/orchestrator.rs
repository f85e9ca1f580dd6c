use crate::classifier::Classifier;
use crate::config::ScanConfig;
use crate::error::Result;
use crate::expander::expand_sources;
use crate::persist::ResultSink;
use crate::prober::{probe_batch, Probe};
use crate::quota::QuotaTracker;
use crate::sources::SourceFetcher;
use crate::store::{PutOutcome, ResultStore};
use crate::types::{BatchState, Candidate, ClassifiedResult, FailureKind, SourceType};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Serialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Where a run currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Expanding,
    Probing(usize),
    Evaluating(usize),
    Done,
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// The stop policy fired.
    QuotaMet,
    PoolExhausted,
    /// Interrupted between batches.
    Cancelled,
}

/// Counters for one batch, or summed over a run.
#[derive(Serialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchStats {
    pub probed: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Rejected before dialing (private, loopback, link-local).
    pub invalid: usize,
    pub too_slow: usize,
    /// Measured but outside the target countries, including `UNKNOWN`.
    pub off_target: usize,
    /// Target country whose quota was already met.
    pub over_quota: usize,
    pub accepted: usize,
    /// Already-stored endpoints that got faster.
    pub improved: usize,
}

impl BatchStats {
    fn add(&mut self, o: &BatchStats) {
        self.probed += o.probed;
        self.succeeded += o.succeeded;
        self.failed += o.failed;
        self.invalid += o.invalid;
        self.too_slow += o.too_slow;
        self.off_target += o.off_target;
        self.over_quota += o.over_quota;
        self.accepted += o.accepted;
        self.improved += o.improved;
    }
}

/// Fastest results kept for one target country.
#[derive(Serialize, Debug, Clone)]
pub struct CountryResults {
    pub country: String,
    pub target: usize,
    pub results: Vec<ClassifiedResult>,
}

#[derive(Serialize, Debug, Clone)]
pub struct RunReport {
    pub pool_size: usize,
    pub batches_run: usize,
    pub batches_total: usize,
    pub stop_reason: StopReason,
    pub totals: BatchStats,
    pub countries: Vec<CountryResults>,
    pub unsatisfied: Vec<String>,
}

/// Drives expand → probe → classify → quota → store, one batch at a time.
pub struct BatchOrchestrator {
    config: ScanConfig,
    fetcher: Arc<dyn SourceFetcher>,
    prober: Arc<dyn Probe>,
    classifier: Arc<dyn Classifier>,
    sink: Option<Box<dyn ResultSink>>,
    cancel: CancellationToken,
    quota: QuotaTracker,
    store: ResultStore,
    phase: Phase,
    rng: StdRng,
}

impl BatchOrchestrator {
    pub fn new(
        config: ScanConfig,
        fetcher: Arc<dyn SourceFetcher>,
        prober: Arc<dyn Probe>,
        classifier: Arc<dyn Classifier>,
    ) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let quota = QuotaTracker::new(&config.targets);
        Self {
            config,
            fetcher,
            prober,
            classifier,
            sink: None,
            cancel: CancellationToken::new(),
            quota,
            store: ResultStore::new(),
            phase: Phase::Idle,
            rng,
        }
    }

    pub fn with_sink(mut self, sink: Box<dyn ResultSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Token checked at batch boundaries; in-flight batches always finish.
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Seed the run with earlier results. Non-target countries are dropped and
    /// each target is cut to its quota; the kept entries count as accepted.
    pub fn resume_from(&mut self, previous: &ResultStore) {
        self.store.merge_from(previous);
        self.store.truncate_to(&self.config.targets);
        for t in &self.config.targets {
            self.quota.set_current(&t.country, self.store.count(&t.country));
        }
        info!(
            endpoints = self.store.len(),
            unsatisfied = ?self.quota.unsatisfied(),
            "resumed from previous results"
        );
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn store(&self) -> &ResultStore {
        &self.store
    }

    pub fn quota(&self) -> &QuotaTracker {
        &self.quota
    }

    /// Run until the stop policy fires, the pool runs out, or cancellation is seen.
    pub async fn run(&mut self) -> Result<RunReport> {
        let mut totals = BatchStats::default();

        if self.config.stop_policy.should_stop(&self.quota) {
            info!("quotas already satisfied, nothing to probe");
            return Ok(self.finish(0, 0, 0, StopReason::QuotaMet, totals));
        }

        self.phase = Phase::Expanding;
        let sources = self.config.sources();
        let pool = expand_sources(
            self.fetcher.as_ref(),
            &sources,
            &self.config.ports,
            self.config.pool_ceiling(),
            &mut self.rng,
        )
        .await?;
        Ok(self.run_pool(pool, &mut totals).await)
    }

    /// Probe an already expanded pool.
    pub async fn run_with_pool(&mut self, pool: Vec<Candidate>) -> RunReport {
        let mut totals = BatchStats::default();
        self.run_pool(pool, &mut totals).await
    }

    async fn run_pool(&mut self, pool: Vec<Candidate>, totals: &mut BatchStats) -> RunReport {
        let batch_size = self.config.batch_size();
        let batches_total = pool.len().div_ceil(batch_size);
        info!(
            pool = pool.len(),
            batches = batches_total,
            batch_size,
            concurrency = self.config.concurrency,
            "starting probe batches"
        );

        let mut reason = StopReason::PoolExhausted;
        let mut batches_run = 0;
        for (batch_index, chunk) in pool.chunks(batch_size).enumerate() {
            if self.cancel.is_cancelled() {
                reason = StopReason::Cancelled;
                break;
            }

            self.phase = Phase::Probing(batch_index);
            let outcomes = probe_batch(self.prober.clone(), chunk, self.config.concurrency).await;
            let batch = BatchState {
                batch_index,
                candidates: chunk.to_vec(),
                outcomes,
            };

            self.phase = Phase::Evaluating(batch_index);
            let stats = self.evaluate(&batch);
            totals.add(&stats);
            batches_run += 1;
            info!(
                batch = batch_index + 1,
                of = batches_total,
                succeeded = stats.succeeded,
                accepted = stats.accepted,
                stored = self.store.len(),
                "batch evaluated"
            );
            for country in self.quota.countries() {
                debug!(
                    country = %country,
                    current = self.quota.current(country),
                    target = self.quota.target(country).unwrap_or(0),
                    "quota progress"
                );
            }
            self.persist();

            if self.config.stop_policy.should_stop(&self.quota) {
                info!(batch = batch_index + 1, "stop condition met");
                reason = StopReason::QuotaMet;
                break;
            }
        }

        self.finish(pool.len(), batches_run, batches_total, reason, *totals)
    }

    /// Fold one batch's outcomes into quota and store, in dispatch order.
    pub fn evaluate(&mut self, batch: &BatchState) -> BatchStats {
        let max_latency = self.config.max_latency_ms();
        let mut stats = BatchStats::default();

        for outcome in &batch.outcomes {
            stats.probed += 1;
            if !outcome.success {
                match outcome.failure_kind {
                    Some(FailureKind::Invalid) => stats.invalid += 1,
                    _ => stats.failed += 1,
                }
                continue;
            }
            stats.succeeded += 1;

            if outcome.latency_ms > max_latency {
                stats.too_slow += 1;
                continue;
            }

            let candidate = outcome.candidate;
            let result = ClassifiedResult {
                address: candidate.address,
                port: candidate.port,
                latency_ms: outcome.latency_ms,
                country: self.classifier.classify(&outcome.region_hint),
                source_type: SourceType::from_echo(candidate.address, outcome.echoed_address.as_deref()),
            };

            if let Some(existing) = self.store.get(&candidate.endpoint()) {
                // An endpoint stays in the country whose quota it was counted against.
                if existing.country == result.country && self.store.put(result) == PutOutcome::Improved {
                    stats.improved += 1;
                }
                continue;
            }

            if self.quota.target(&result.country).is_none() {
                stats.off_target += 1;
                continue;
            }
            if !self.quota.accept(&result.country) {
                stats.over_quota += 1;
                continue;
            }
            let country = result.country.clone();
            if self.store.put(result) == PutOutcome::Inserted {
                self.quota.record(&country);
                stats.accepted += 1;
            }
        }
        stats
    }

    fn persist(&self) {
        if let Some(sink) = &self.sink {
            if let Err(e) = sink.persist(&self.store, &self.quota) {
                warn!("failed to persist results: {e}");
            }
        }
    }

    fn finish(
        &mut self,
        pool_size: usize,
        batches_run: usize,
        batches_total: usize,
        stop_reason: StopReason,
        totals: BatchStats,
    ) -> RunReport {
        self.phase = Phase::Done;
        self.persist();
        let countries = self
            .quota
            .targets()
            .into_iter()
            .map(|t| CountryResults {
                results: self.store.top_n(&t.country, t.target_count),
                country: t.country,
                target: t.target_count,
            })
            .collect();
        let unsatisfied = self.quota.unsatisfied();
        if unsatisfied.is_empty() {
            info!(?stop_reason, "run finished, all targets satisfied");
        } else {
            warn!(?stop_reason, unsatisfied = ?unsatisfied, "run finished with unsatisfied targets");
        }
        RunReport {
            pool_size,
            batches_run,
            batches_total,
            stop_reason,
            totals,
            countries,
            unsatisfied,
        }
    }
}

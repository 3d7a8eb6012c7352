//! Predicate statistics store
//!
//! Selectivity and latency samples are gathered as a side effect of query
//! execution and summarized into per-predicate, per-direction aggregates that
//! feed the planner's cost estimates. Samples and aggregates persist in a
//! remote graph store reachable over the SPARQL protocol; an in-memory
//! backend serves tests and embedded use.
//!
//! Samples are best-effort telemetry: a failure while recording is logged and
//! dropped. An unreachable backend at load time is fatal instead, because
//! planning against silently wrong estimates degrades queries in ways that
//! are hard to diagnose later.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::error::{FederationError, Result};
use crate::vocab::{self, NO_STATS_AVAILABLE};

/// Direction of predicate resolution: forward maps subjects to objects,
/// reverse maps objects to subjects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    Forward,
    Reverse,
}

impl Direction {
    pub fn is_forward(self) -> bool {
        matches!(self, Direction::Forward)
    }

    pub fn opposite(self) -> Direction {
        match self {
            Direction::Forward => Direction::Reverse,
            Direction::Reverse => Direction::Forward,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Forward => write!(f, "forward"),
            Direction::Reverse => write!(f, "reverse"),
        }
    }
}

/// Key of a statistic: predicate URI plus direction.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StatsKey {
    pub predicate: String,
    pub direction: Direction,
}

impl StatsKey {
    pub fn new(predicate: impl Into<String>, direction: Direction) -> Self {
        StatsKey {
            predicate: predicate.into(),
            direction,
        }
    }
}

/// One observed data point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SamplePoint {
    pub value: u64,
    pub timestamp: DateTime<Utc>,
}

/// One recorded invocation observation: a selectivity point and a latency
/// point for a predicate/direction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sample {
    pub predicate: String,
    pub direction: Direction,
    pub selectivity: u64,
    pub time_ms: u64,
    pub timestamp: DateTime<Utc>,
}

/// Persisted aggregate row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateRecord {
    pub predicate: String,
    pub direction: Direction,
    pub avg_selectivity: i64,
    pub avg_time_ms: i64,
    pub timestamp: DateTime<Utc>,
}

/// Everything a backend holds: used to warm the store at open time.
#[derive(Debug, Clone, Default)]
pub struct StatsSnapshot {
    pub samples: Vec<Sample>,
    pub aggregates: Vec<AggregateRecord>,
}

/// Durable storage for samples and aggregates.
#[async_trait]
pub trait StatsBackend: Send + Sync + fmt::Debug {
    /// Load the persisted snapshot. Errors here are fatal to engine startup.
    async fn load(&self) -> Result<StatsSnapshot>;

    /// Append one sample. Callers treat errors as droppable telemetry.
    async fn append_sample(&self, sample: &Sample) -> Result<()>;

    /// Replace the persisted aggregates wholesale.
    async fn replace_aggregates(&self, aggregates: &[AggregateRecord]) -> Result<()>;
}

/// Configuration for the stats store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsConfig {
    /// Maximum number of samples held before the oldest are purged.
    pub max_samples: usize,
    /// How many of the oldest samples to purge when the cap is reached.
    pub purge_batch: usize,
}

impl Default for StatsConfig {
    fn default() -> Self {
        StatsConfig {
            max_samples: 10_000,
            purge_batch: 200,
        }
    }
}

/// The full statistic for one predicate/direction, as exposed to callers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PredicateStatistic {
    pub predicate: String,
    pub direction: Direction,
    pub selectivity_samples: Vec<SamplePoint>,
    pub time_samples: Vec<SamplePoint>,
    pub avg_selectivity: i64,
    pub avg_time_ms: i64,
    pub recomputed_at: Option<DateTime<Utc>>,
}

/// Aggregate estimate returned by [`PredicateStatsStore::get_stats`]. Both
/// fields are [`NO_STATS_AVAILABLE`] when nothing has been recomputed yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsEstimate {
    pub avg_selectivity: i64,
    pub avg_time_ms: i64,
}

impl StatsEstimate {
    pub const UNAVAILABLE: StatsEstimate = StatsEstimate {
        avg_selectivity: NO_STATS_AVAILABLE,
        avg_time_ms: NO_STATS_AVAILABLE,
    };

    pub fn is_available(&self) -> bool {
        self.avg_selectivity != NO_STATS_AVAILABLE
    }
}

#[derive(Debug, Clone, Default)]
struct SampleSet {
    selectivity: Vec<SamplePoint>,
    time: Vec<SamplePoint>,
}

#[derive(Debug, Clone, Copy)]
struct Aggregate {
    avg_selectivity: i64,
    avg_time_ms: i64,
    recomputed_at: DateTime<Utc>,
}

/// In-memory store of predicate statistics backed by a durable
/// [`StatsBackend`].
///
/// Samples and aggregates live behind separate locks so that recording a
/// sample never blocks a concurrent aggregate read.
#[derive(Debug)]
pub struct PredicateStatsStore {
    backend: Arc<dyn StatsBackend>,
    config: StatsConfig,
    samples: RwLock<HashMap<StatsKey, SampleSet>>,
    aggregates: RwLock<HashMap<StatsKey, Aggregate>>,
    /// Bumped on every recorded sample; recompute is a no-op when unchanged.
    sample_version: AtomicU64,
    recomputed_version: AtomicU64,
}

impl PredicateStatsStore {
    /// Open the store, loading the persisted snapshot.
    ///
    /// An unreachable backend is fatal here; see the module docs.
    pub async fn open(backend: Arc<dyn StatsBackend>, config: StatsConfig) -> Result<Self> {
        let mut config = config;
        if config.purge_batch > config.max_samples {
            config.purge_batch = (config.max_samples / 10).max(1);
            warn!(
                purge_batch = config.purge_batch,
                "purge batch exceeded the sample cap, clamped to 10% of the cap"
            );
        }

        let snapshot = backend.load().await?;

        let mut samples: HashMap<StatsKey, SampleSet> = HashMap::new();
        for sample in snapshot.samples {
            let key = StatsKey::new(sample.predicate.clone(), sample.direction);
            let set = samples.entry(key).or_default();
            set.selectivity.push(SamplePoint {
                value: sample.selectivity,
                timestamp: sample.timestamp,
            });
            set.time.push(SamplePoint {
                value: sample.time_ms,
                timestamp: sample.timestamp,
            });
        }

        let mut aggregates = HashMap::new();
        for record in snapshot.aggregates {
            aggregates.insert(
                StatsKey::new(record.predicate.clone(), record.direction),
                Aggregate {
                    avg_selectivity: record.avg_selectivity,
                    avg_time_ms: record.avg_time_ms,
                    recomputed_at: record.timestamp,
                },
            );
        }

        let total: usize = samples.values().map(|s| s.selectivity.len()).sum();
        debug!(samples = total, aggregates = aggregates.len(), "stats store loaded");

        Ok(PredicateStatsStore {
            backend,
            config,
            samples: RwLock::new(samples),
            aggregates: RwLock::new(aggregates),
            sample_version: AtomicU64::new(1),
            recomputed_version: AtomicU64::new(0),
        })
    }

    /// Record one observation for a predicate/direction.
    ///
    /// Appends a selectivity sample and a time sample; aggregates are
    /// untouched until the next [`recompute_stats`](Self::recompute_stats).
    /// Backend failures are logged and dropped.
    pub async fn record_sample(
        &self,
        predicate: &str,
        direction: Direction,
        selectivity: u64,
        time_ms: u64,
    ) {
        let timestamp = Utc::now();
        let key = StatsKey::new(predicate, direction);

        {
            let mut samples = self.samples.write().await;

            let total: usize = samples.values().map(|s| s.selectivity.len()).sum();
            if total >= self.config.max_samples {
                debug!(
                    cap = self.config.max_samples,
                    purging = self.config.purge_batch,
                    "sample cap reached, purging oldest samples"
                );
                purge_oldest(&mut samples, self.config.purge_batch);
            }

            let set = samples.entry(key).or_default();
            set.selectivity.push(SamplePoint {
                value: selectivity,
                timestamp,
            });
            set.time.push(SamplePoint {
                value: time_ms,
                timestamp,
            });
        }
        self.sample_version.fetch_add(1, Ordering::SeqCst);

        debug!(
            predicate,
            %direction,
            selectivity,
            time_ms,
            "recorded predicate sample"
        );

        let sample = Sample {
            predicate: predicate.to_string(),
            direction,
            selectivity,
            time_ms,
            timestamp,
        };
        if let Err(e) = self.backend.append_sample(&sample).await {
            warn!(predicate, error = %e, "failed to persist sample, dropping");
        }
    }

    /// Recompute all aggregates from the current samples.
    ///
    /// For every predicate/direction with at least one sample, the arithmetic
    /// mean of its selectivity and time samples replaces the stored aggregate
    /// together with a recompute timestamp, in a single swap readers observe
    /// all-or-nothing. Idempotent: with no new samples since the previous
    /// call, this is a no-op.
    pub async fn recompute_stats(&self) -> Result<()> {
        let version = self.sample_version.load(Ordering::SeqCst);
        if self.recomputed_version.load(Ordering::SeqCst) == version {
            debug!("no new samples since last recompute, skipping");
            return Ok(());
        }

        let now = Utc::now();
        let samples = self.samples.read().await.clone();

        let mut next: HashMap<StatsKey, Aggregate> = HashMap::new();
        for (key, set) in &samples {
            if set.selectivity.is_empty() {
                continue;
            }
            next.insert(
                key.clone(),
                Aggregate {
                    avg_selectivity: mean(&set.selectivity),
                    avg_time_ms: mean(&set.time),
                    recomputed_at: now,
                },
            );
        }

        debug!(aggregates = next.len(), "recomputed summary statistics");

        let records: Vec<AggregateRecord> = next
            .iter()
            .map(|(key, agg)| AggregateRecord {
                predicate: key.predicate.clone(),
                direction: key.direction,
                avg_selectivity: agg.avg_selectivity,
                avg_time_ms: agg.avg_time_ms,
                timestamp: agg.recomputed_at,
            })
            .collect();

        {
            let mut aggregates = self.aggregates.write().await;
            *aggregates = next;
        }
        self.recomputed_version.store(version, Ordering::SeqCst);

        self.backend.replace_aggregates(&records).await
    }

    /// The cached aggregate for a predicate/direction, or the sentinel.
    pub async fn get_stats(&self, predicate: &str, direction: Direction) -> StatsEstimate {
        let aggregates = self.aggregates.read().await;
        match aggregates.get(&StatsKey::new(predicate, direction)) {
            Some(agg) => StatsEstimate {
                avg_selectivity: agg.avg_selectivity,
                avg_time_ms: agg.avg_time_ms,
            },
            None => StatsEstimate::UNAVAILABLE,
        }
    }

    /// Estimated number of result bindings produced by resolving `num_inputs`
    /// values through the predicate, or the sentinel when unknown.
    pub async fn estimated_fanout(
        &self,
        predicate: &str,
        direction: Direction,
        num_inputs: usize,
    ) -> i64 {
        let estimate = self.get_stats(predicate, direction).await;
        if !estimate.is_available() {
            return NO_STATS_AVAILABLE;
        }
        estimate.avg_selectivity.saturating_mul(num_inputs as i64)
    }

    /// Full statistic for inspection (admin tooling, tests).
    pub async fn statistic(
        &self,
        predicate: &str,
        direction: Direction,
    ) -> Option<PredicateStatistic> {
        let key = StatsKey::new(predicate, direction);
        let samples = self.samples.read().await;
        let set = samples.get(&key)?;
        let aggregates = self.aggregates.read().await;
        let agg = aggregates.get(&key);
        Some(PredicateStatistic {
            predicate: predicate.to_string(),
            direction,
            selectivity_samples: set.selectivity.clone(),
            time_samples: set.time.clone(),
            avg_selectivity: agg.map_or(NO_STATS_AVAILABLE, |a| a.avg_selectivity),
            avg_time_ms: agg.map_or(NO_STATS_AVAILABLE, |a| a.avg_time_ms),
            recomputed_at: agg.map(|a| a.recomputed_at),
        })
    }

    /// Number of samples currently held (both kinds counted once).
    pub async fn sample_count(&self) -> usize {
        let samples = self.samples.read().await;
        samples.values().map(|s| s.selectivity.len()).sum()
    }
}

fn mean(points: &[SamplePoint]) -> i64 {
    if points.is_empty() {
        return NO_STATS_AVAILABLE;
    }
    let sum: u64 = points.iter().map(|p| p.value).sum();
    (sum / points.len() as u64) as i64
}

fn purge_oldest(samples: &mut HashMap<StatsKey, SampleSet>, count: usize) {
    let mut timestamps: Vec<DateTime<Utc>> = samples
        .values()
        .flat_map(|s| s.selectivity.iter().map(|p| p.timestamp))
        .collect();
    timestamps.sort();
    let Some(&cutoff) = timestamps.get(count.saturating_sub(1)) else {
        return;
    };

    for set in samples.values_mut() {
        set.selectivity.retain(|p| p.timestamp > cutoff);
        set.time.retain(|p| p.timestamp > cutoff);
    }
    samples.retain(|_, set| !set.selectivity.is_empty() || !set.time.is_empty());
}

/// In-memory backend for tests and embedded use.
#[derive(Debug, Default)]
pub struct MemoryStatsBackend {
    state: parking_lot::Mutex<StatsSnapshot>,
}

impl MemoryStatsBackend {
    pub fn new() -> Self {
        MemoryStatsBackend::default()
    }

    pub fn with_snapshot(snapshot: StatsSnapshot) -> Self {
        MemoryStatsBackend {
            state: parking_lot::Mutex::new(snapshot),
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        self.state.lock().clone()
    }
}

#[async_trait]
impl StatsBackend for MemoryStatsBackend {
    async fn load(&self) -> Result<StatsSnapshot> {
        Ok(self.state.lock().clone())
    }

    async fn append_sample(&self, sample: &Sample) -> Result<()> {
        self.state.lock().samples.push(sample.clone());
        Ok(())
    }

    async fn replace_aggregates(&self, aggregates: &[AggregateRecord]) -> Result<()> {
        self.state.lock().aggregates = aggregates.to_vec();
        Ok(())
    }
}

/// Backend persisting to a remote graph store over the SPARQL protocol.
///
/// Samples and aggregates are written with the predicate-statistics
/// vocabulary of [`crate::vocab`]; the store is any endpoint accepting
/// `application/sparql-query` and `application/sparql-update` POSTs.
#[derive(Debug)]
pub struct SparqlStatsBackend {
    endpoint: String,
    credentials: Option<(String, String)>,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct SparqlJsonResults {
    results: SparqlJsonRows,
}

#[derive(Debug, Deserialize)]
struct SparqlJsonRows {
    bindings: Vec<HashMap<String, SparqlJsonTerm>>,
}

#[derive(Debug, Deserialize)]
struct SparqlJsonTerm {
    value: String,
}

impl SparqlStatsBackend {
    pub fn new(endpoint: impl Into<String>, credentials: Option<(String, String)>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .user_agent(concat!("semfed/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| FederationError::Io(format!("failed to create HTTP client: {e}")))?;
        Ok(SparqlStatsBackend {
            endpoint: endpoint.into(),
            credentials,
            client,
        })
    }

    async fn select(&self, query: &str) -> Result<SparqlJsonResults> {
        let mut request = self
            .client
            .post(&self.endpoint)
            .header("Content-Type", "application/sparql-query")
            .header("Accept", "application/sparql-results+json")
            .body(query.to_string());
        if let Some((user, pass)) = &self.credentials {
            request = request.basic_auth(user, Some(pass));
        }

        let response = request
            .send()
            .await
            .map_err(|e| FederationError::Io(format!("stats store unreachable: {e}")))?;
        if !response.status().is_success() {
            return Err(FederationError::Io(format!(
                "stats store answered {}",
                response.status()
            )));
        }
        response
            .json::<SparqlJsonResults>()
            .await
            .map_err(|e| FederationError::Io(format!("malformed stats results: {e}")))
    }

    async fn update(&self, update: &str) -> Result<()> {
        let mut request = self
            .client
            .post(&self.endpoint)
            .header("Content-Type", "application/sparql-update")
            .body(update.to_string());
        if let Some((user, pass)) = &self.credentials {
            request = request.basic_auth(user, Some(pass));
        }

        let response = request
            .send()
            .await
            .map_err(|e| FederationError::Io(format!("stats store unreachable: {e}")))?;
        if !response.status().is_success() {
            return Err(FederationError::Io(format!(
                "stats store answered {}",
                response.status()
            )));
        }
        Ok(())
    }

    fn load_samples_query(kind_predicate: &str, value_predicate: &str) -> String {
        format!(
            "SELECT ?predicate ?forward ?value ?timestamp WHERE {{ \
             ?predicate <{kind}> ?sample . \
             ?sample <{dir}> ?forward ; <{val}> ?value ; <{ts}> ?timestamp . }}",
            kind = kind_predicate,
            dir = vocab::DIRECTION_IS_FORWARD,
            val = value_predicate,
            ts = vocab::TIMESTAMP,
        )
    }
}

fn parse_direction(raw: &str) -> Direction {
    if raw == "true" {
        Direction::Forward
    } else {
        Direction::Reverse
    }
}

fn parse_timestamp(raw: &str) -> DateTime<Utc> {
    raw.parse().unwrap_or_else(|_| Utc::now())
}

#[async_trait]
impl StatsBackend for SparqlStatsBackend {
    async fn load(&self) -> Result<StatsSnapshot> {
        // selectivity and time samples are stored as separate sample nodes;
        // rows are re-paired by (predicate, direction, timestamp)
        let selectivity = self
            .select(&Self::load_samples_query(
                vocab::SELECTIVITY_SAMPLE,
                vocab::SELECTIVITY,
            ))
            .await?;
        let time = self
            .select(&Self::load_samples_query(vocab::TIME_SAMPLE, vocab::TIME))
            .await?;

        let mut time_by_key: HashMap<(String, Direction, String), u64> = HashMap::new();
        for row in &time.results.bindings {
            let (Some(p), Some(d), Some(v), Some(ts)) = (
                row.get("predicate"),
                row.get("forward"),
                row.get("value"),
                row.get("timestamp"),
            ) else {
                continue;
            };
            time_by_key.insert(
                (p.value.clone(), parse_direction(&d.value), ts.value.clone()),
                v.value.parse().unwrap_or(0),
            );
        }

        let mut samples = Vec::new();
        for row in &selectivity.results.bindings {
            let (Some(p), Some(d), Some(v), Some(ts)) = (
                row.get("predicate"),
                row.get("forward"),
                row.get("value"),
                row.get("timestamp"),
            ) else {
                continue;
            };
            let direction = parse_direction(&d.value);
            let time_ms = time_by_key
                .get(&(p.value.clone(), direction, ts.value.clone()))
                .copied()
                .unwrap_or(0);
            samples.push(Sample {
                predicate: p.value.clone(),
                direction,
                selectivity: v.value.parse().unwrap_or(0),
                time_ms,
                timestamp: parse_timestamp(&ts.value),
            });
        }

        let aggregates_query = format!(
            "SELECT ?predicate ?fsel ?rsel ?ftime ?rtime WHERE {{ \
             OPTIONAL {{ ?predicate <{fs}> ?fsel }} \
             OPTIONAL {{ ?predicate <{rs}> ?rsel }} \
             OPTIONAL {{ ?predicate <{ft}> ?ftime }} \
             OPTIONAL {{ ?predicate <{rt}> ?rtime }} }}",
            fs = vocab::AVG_FORWARD_SELECTIVITY,
            rs = vocab::AVG_REVERSE_SELECTIVITY,
            ft = vocab::AVG_FORWARD_TIME,
            rt = vocab::AVG_REVERSE_TIME,
        );
        let rows = self.select(&aggregates_query).await?;

        let mut aggregates = Vec::new();
        for row in &rows.results.bindings {
            let Some(p) = row.get("predicate") else {
                continue;
            };
            let value = |name: &str| -> i64 {
                row.get(name)
                    .and_then(|t| t.value.parse().ok())
                    .unwrap_or(NO_STATS_AVAILABLE)
            };
            for (direction, sel, time) in [
                (Direction::Forward, value("fsel"), value("ftime")),
                (Direction::Reverse, value("rsel"), value("rtime")),
            ] {
                if sel != NO_STATS_AVAILABLE {
                    aggregates.push(AggregateRecord {
                        predicate: p.value.clone(),
                        direction,
                        avg_selectivity: sel,
                        avg_time_ms: time,
                        timestamp: Utc::now(),
                    });
                }
            }
        }

        Ok(StatsSnapshot {
            samples,
            aggregates,
        })
    }

    async fn append_sample(&self, sample: &Sample) -> Result<()> {
        let sample_id = uuid::Uuid::new_v4();
        let update = format!(
            "INSERT DATA {{ \
             <{p}> <{ksel}> <{ns}sample/{id}-s> . \
             <{ns}sample/{id}-s> <{dir}> \"{fwd}\" ; <{sel}> \"{sval}\" ; <{ts}> \"{stamp}\" . \
             <{p}> <{ktime}> <{ns}sample/{id}-t> . \
             <{ns}sample/{id}-t> <{dir}> \"{fwd}\" ; <{time}> \"{tval}\" ; <{ts}> \"{stamp}\" . }}",
            p = sample.predicate,
            ksel = vocab::SELECTIVITY_SAMPLE,
            ktime = vocab::TIME_SAMPLE,
            ns = vocab::PREDICATE_STATS_NS,
            id = sample_id,
            dir = vocab::DIRECTION_IS_FORWARD,
            fwd = sample.direction.is_forward(),
            sel = vocab::SELECTIVITY,
            sval = sample.selectivity,
            time = vocab::TIME,
            tval = sample.time_ms,
            ts = vocab::TIMESTAMP,
            stamp = sample.timestamp.to_rfc3339(),
        );
        self.update(&update).await
    }

    async fn replace_aggregates(&self, aggregates: &[AggregateRecord]) -> Result<()> {
        let mut update = String::new();
        for predicate in [
            vocab::AVG_FORWARD_SELECTIVITY,
            vocab::AVG_REVERSE_SELECTIVITY,
            vocab::AVG_FORWARD_TIME,
            vocab::AVG_REVERSE_TIME,
        ] {
            update.push_str(&format!(
                "DELETE WHERE {{ ?p <{predicate}> ?v }} ;\n"
            ));
        }

        update.push_str("INSERT DATA {\n");
        for record in aggregates {
            let (sel_predicate, time_predicate) = match record.direction {
                Direction::Forward => (vocab::AVG_FORWARD_SELECTIVITY, vocab::AVG_FORWARD_TIME),
                Direction::Reverse => (vocab::AVG_REVERSE_SELECTIVITY, vocab::AVG_REVERSE_TIME),
            };
            update.push_str(&format!(
                "<{p}> <{sp}> \"{sv}\" ; <{tp}> \"{tv}\" .\n",
                p = record.predicate,
                sp = sel_predicate,
                sv = record.avg_selectivity,
                tp = time_predicate,
                tv = record.avg_time_ms,
            ));
        }
        update.push('}');

        self.update(&update).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const P: &str = "http://example.org/pred/encodedBy";

    async fn store() -> PredicateStatsStore {
        PredicateStatsStore::open(Arc::new(MemoryStatsBackend::new()), StatsConfig::default())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn aggregates_are_arithmetic_means() {
        let store = store().await;
        store.record_sample(P, Direction::Forward, 5, 120).await;
        store.record_sample(P, Direction::Forward, 15, 80).await;

        store.recompute_stats().await.unwrap();

        let estimate = store.get_stats(P, Direction::Forward).await;
        assert_eq!(estimate.avg_selectivity, 10);
        assert_eq!(estimate.avg_time_ms, 100);
    }

    #[tokio::test]
    async fn recompute_is_idempotent_without_new_samples() {
        let store = store().await;
        store.record_sample(P, Direction::Forward, 5, 100).await;
        store.record_sample(P, Direction::Reverse, 7, 300).await;

        store.recompute_stats().await.unwrap();
        let first_fwd = store.statistic(P, Direction::Forward).await.unwrap();
        let first_rev = store.statistic(P, Direction::Reverse).await.unwrap();

        store.recompute_stats().await.unwrap();
        let second_fwd = store.statistic(P, Direction::Forward).await.unwrap();
        let second_rev = store.statistic(P, Direction::Reverse).await.unwrap();

        assert_eq!(first_fwd, second_fwd);
        assert_eq!(first_rev, second_rev);
    }

    #[tokio::test]
    async fn absent_stats_return_sentinel() {
        let store = store().await;
        let estimate = store.get_stats(P, Direction::Forward).await;
        assert_eq!(estimate.avg_selectivity, NO_STATS_AVAILABLE);
        assert_eq!(estimate.avg_time_ms, NO_STATS_AVAILABLE);
        assert!(!estimate.is_available());
    }

    #[tokio::test]
    async fn recording_does_not_touch_aggregates() {
        let store = store().await;
        store.record_sample(P, Direction::Forward, 5, 100).await;
        store.recompute_stats().await.unwrap();

        store.record_sample(P, Direction::Forward, 1000, 1).await;
        let estimate = store.get_stats(P, Direction::Forward).await;
        assert_eq!(estimate.avg_selectivity, 5);
    }

    #[tokio::test]
    async fn directions_are_independent() {
        let store = store().await;
        store.record_sample(P, Direction::Forward, 2, 10).await;
        store.record_sample(P, Direction::Reverse, 40, 900).await;
        store.recompute_stats().await.unwrap();

        assert_eq!(store.get_stats(P, Direction::Forward).await.avg_selectivity, 2);
        assert_eq!(store.get_stats(P, Direction::Reverse).await.avg_selectivity, 40);
    }

    #[tokio::test]
    async fn cap_purges_oldest_samples() {
        let config = StatsConfig {
            max_samples: 4,
            purge_batch: 2,
        };
        let store = PredicateStatsStore::open(Arc::new(MemoryStatsBackend::new()), config)
            .await
            .unwrap();

        for i in 0..4 {
            store.record_sample(P, Direction::Forward, i, i).await;
            // distinct timestamps so purge order is well defined
            tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        }
        assert_eq!(store.sample_count().await, 4);

        store.record_sample(P, Direction::Forward, 99, 99).await;
        assert!(store.sample_count().await <= 3);

        let stat = store.statistic(P, Direction::Forward).await.unwrap();
        assert!(stat.selectivity_samples.iter().any(|p| p.value == 99));
        assert!(!stat.selectivity_samples.iter().any(|p| p.value == 0));
    }

    #[tokio::test]
    async fn estimated_fanout_scales_with_inputs() {
        let store = store().await;
        store.record_sample(P, Direction::Forward, 3, 50).await;
        store.recompute_stats().await.unwrap();

        assert_eq!(store.estimated_fanout(P, Direction::Forward, 4).await, 12);
        assert_eq!(
            store.estimated_fanout(P, Direction::Reverse, 4).await,
            NO_STATS_AVAILABLE
        );
    }

    #[tokio::test]
    async fn samples_persist_through_backend() {
        let backend = Arc::new(MemoryStatsBackend::new());
        {
            let store =
                PredicateStatsStore::open(backend.clone(), StatsConfig::default())
                    .await
                    .unwrap();
            store.record_sample(P, Direction::Forward, 5, 100).await;
            store.record_sample(P, Direction::Forward, 15, 200).await;
        }

        let reopened = PredicateStatsStore::open(backend, StatsConfig::default())
            .await
            .unwrap();
        assert_eq!(reopened.sample_count().await, 2);
        reopened.recompute_stats().await.unwrap();
        assert_eq!(
            reopened.get_stats(P, Direction::Forward).await.avg_selectivity,
            10
        );
    }
}

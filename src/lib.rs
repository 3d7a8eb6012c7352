//! # SemFed
//!
//! Federated query engine over semantic web services and SPARQL endpoints.
//!
//! SemFed answers basic graph patterns against data that is not stored
//! centrally: some predicates live in queryable SPARQL endpoints, others can
//! only be produced by invoking a semantic web service on a concrete input.
//! Per query, the engine decides which predicates are resolvable and in what
//! order to evaluate them, drives the necessary remote invocations
//! concurrently, assembles a transient local graph from their outputs, and
//! evaluates the original query against it.
//!
//! ## Architecture
//!
//! - [`stats`]: durable per-predicate selectivity/latency statistics that
//!   feed cost estimates
//! - [`resolvability`]: memoizes, per property-equivalence-class, whether
//!   any service resolves a predicate
//! - [`planner`]: stats-driven greedy ordering of the query's patterns
//! - [`task`]: bounded-pool task engine with lifecycle tracking,
//!   cooperative cancellation and timeout races
//! - [`executor`]: drives the schedule, fans out invocations, merges the
//!   local graph, delegates final evaluation to the reasoner
//!
//! The RDF store/reasoner, service registry and transport are collaborators
//! behind the [`Reasoner`], [`ServiceRegistry`] and [`ServiceInvoker`]
//! traits.
//!
//! ## Example
//!
//! ```no_run
//! use semfed::{
//!     BasicGraphPattern, EngineConfig, FederationEngine, HttpServiceClient,
//!     InMemoryRegistry, MemoryStatsBackend, QueryNode, StaticReasoner, TriplePattern,
//! };
//! use std::sync::Arc;
//!
//! # async fn example() -> semfed::Result<()> {
//! let engine = FederationEngine::new(
//!     Arc::new(InMemoryRegistry::new()),
//!     Arc::new(StaticReasoner::new()),
//!     Arc::new(HttpServiceClient::new()?),
//!     Arc::new(MemoryStatsBackend::new()),
//!     EngineConfig::default(),
//! )
//! .await?;
//!
//! let query = BasicGraphPattern::new(vec![TriplePattern::new(
//!     QueryNode::iri("http://example.org/uniprot/P12345"),
//!     QueryNode::iri("http://example.org/pred/encodedBy"),
//!     QueryNode::variable("gene"),
//! )]);
//! let bindings = engine.query(&query).await?;
//! # Ok(())
//! # }
//! ```

use dashmap::DashMap;
use std::sync::Arc;
use tracing::debug;

pub mod client;
pub mod error;
pub mod executor;
pub mod model;
pub mod planner;
pub mod reasoner;
pub mod registry;
pub mod resolvability;
pub mod stats;
pub mod task;
pub mod vocab;

pub use client::{ClientConfig, HttpServiceClient, ServiceInvoker};
pub use error::{FederationError, Result};
pub use executor::{ExecutorConfig, FederatedExecutor};
pub use model::{
    BasicGraphPattern, Binding, Graph, Literal, NamedNode, QueryNode, Term, Triple, TriplePattern,
};
pub use planner::{AdjacencyEdge, PatternPlan, PatternPlanner, PlannedPattern};
pub use reasoner::{Reasoner, StaticReasoner};
pub use registry::{InMemoryRegistry, ServiceKind, ServiceRef, ServiceRegistry};
pub use resolvability::ResolvabilityCache;
pub use stats::{
    Direction, MemoryStatsBackend, PredicateStatsStore, SparqlStatsBackend, StatsBackend,
    StatsConfig,
};
pub use task::{
    CancellationToken, ErrorPolicy, QueryTask, Task, TaskContext, TaskHandle, TaskManager,
    TaskManagerConfig, TaskState,
};

/// Engine-wide configuration.
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    pub executor: ExecutorConfig,
    pub tasks: TaskManagerConfig,
    pub stats: StatsConfig,
}

/// Composition root for the federation engine.
///
/// Owns one explicit instance of every component, constructed once and
/// passed by handle; there are no process-wide singletons. Dropping the
/// engine stops its background sweeper.
#[derive(Debug)]
pub struct FederationEngine {
    stats: Arc<PredicateStatsStore>,
    resolvability: Arc<ResolvabilityCache>,
    tasks: Arc<TaskManager>,
    executor: FederatedExecutor,
    queries: DashMap<String, Arc<QueryTask>>,
    sweeper: tokio::task::JoinHandle<()>,
}

impl FederationEngine {
    /// Construct the engine from its collaborators.
    ///
    /// Loads the statistics snapshot eagerly: an unreachable stats backend
    /// fails construction rather than letting queries plan against silently
    /// wrong estimates.
    pub async fn new(
        registry: Arc<dyn ServiceRegistry>,
        reasoner: Arc<dyn Reasoner>,
        invoker: Arc<dyn ServiceInvoker>,
        stats_backend: Arc<dyn StatsBackend>,
        config: EngineConfig,
    ) -> Result<Self> {
        let stats = Arc::new(PredicateStatsStore::open(stats_backend, config.stats).await?);
        let resolvability = Arc::new(ResolvabilityCache::new(
            registry.clone(),
            reasoner.clone(),
        ));
        let tasks = Arc::new(TaskManager::new(config.tasks));
        let sweeper = tasks.start_sweeper();
        let executor = FederatedExecutor::new(
            invoker,
            registry,
            resolvability.clone(),
            stats.clone(),
            reasoner,
            tasks.clone(),
            config.executor,
        );

        debug!("federation engine constructed");
        Ok(FederationEngine {
            stats,
            resolvability,
            tasks,
            executor,
            queries: DashMap::new(),
            sweeper,
        })
    }

    /// Execute a federated query, blocking the caller until the bindings are
    /// available.
    pub async fn query(&self, query: &BasicGraphPattern) -> Result<Vec<Binding>> {
        self.executor.execute(query).await
    }

    /// Submit a query for background execution.
    ///
    /// Returns the task id; progress is observable through
    /// [`poll_query`](Self::poll_query) and results through
    /// [`query_results`](Self::query_results) once the task succeeds.
    pub fn submit_query(self: &Arc<Self>, query: BasicGraphPattern) -> String {
        let engine = self.clone();
        let query_text = query.to_string();
        let (tx, rx) = tokio::sync::oneshot::channel::<Arc<QueryTask>>();

        let handle = self.tasks.spawn(format!("query {query_text}"), move |ctx| async move {
            let query_task = rx
                .await
                .map_err(|_| FederationError::Task("query task registration lost".into()))?;
            ctx.set_status("planning");
            let bindings = engine.executor.execute(&query).await?;
            let solutions = bindings.len();
            query_task.append(bindings);
            ctx.set_status(format!("{solutions} solutions"));
            Ok(solutions)
        });

        let task = handle.task();
        let id = task.id().to_string();
        let query_task = Arc::new(QueryTask::new(task, query_text));
        self.queries.insert(id.clone(), query_task.clone());
        let _ = tx.send(query_task);

        // detach; the task table keeps the lifecycle observable
        tokio::spawn(async move {
            let _ = handle.join().await;
        });

        id
    }

    /// Latest status message of a submitted query.
    pub fn poll_query(&self, id: &str) -> Option<String> {
        self.tasks.poll(id)
    }

    /// The tracked query task for an id.
    pub fn query_task(&self, id: &str) -> Option<Arc<QueryTask>> {
        self.queries.get(id).map(|entry| entry.value().clone())
    }

    /// Result bindings gathered so far for a submitted query.
    pub fn query_results(&self, id: &str) -> Option<Vec<Binding>> {
        self.query_task(id).map(|qt| qt.results())
    }

    /// Drop a submitted query and its task.
    pub fn dispose_query(&self, id: &str) {
        self.queries.remove(id);
        self.tasks.dispose(id);
    }

    /// Recompute stats aggregates from the samples gathered so far.
    pub async fn recompute_stats(&self) -> Result<()> {
        self.stats.recompute_stats().await
    }

    pub fn stats(&self) -> &Arc<PredicateStatsStore> {
        &self.stats
    }

    pub fn resolvability(&self) -> &Arc<ResolvabilityCache> {
        &self.resolvability
    }

    pub fn tasks(&self) -> &Arc<TaskManager> {
        &self.tasks
    }
}

impl Drop for FederationEngine {
    fn drop(&mut self) {
        self.sweeper.abort();
    }
}

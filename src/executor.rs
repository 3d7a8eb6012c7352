//! Federated query executor
//!
//! Drives the planner's schedule: for each scheduled pattern the executor
//! fans out one task per bound input value against the services that resolve
//! the predicate, merges every returned graph into the shared per-query
//! graph, and joins the pattern's tasks before moving on. Patterns resolvable
//! only through an indexed SPARQL endpoint are fetched with a single batched,
//! result-limited SELECT; unresolvable patterns contribute nothing and
//! downstream patterns simply find no bindings.
//!
//! A failed invocation is logged and counts as zero triples; it never aborts
//! the query. Once every pattern has run (or the global cutoff is reached),
//! the original query is evaluated against the populated graph by the
//! reasoning collaborator.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tokio::time::timeout;
use tracing::{debug, info, instrument, trace, warn};

use crate::client::ServiceInvoker;
use crate::error::{FederationError, Result};
use crate::model::{BasicGraphPattern, Binding, Graph, NamedNode, QueryNode, Term, Triple};
use crate::planner::{PatternPlanner, PlannedPattern};
use crate::reasoner::Reasoner;
use crate::registry::{ServiceKind, ServiceRef, ServiceRegistry};
use crate::resolvability::ResolvabilityCache;
use crate::stats::{Direction, PredicateStatsStore};
use crate::task::TaskManager;
use crate::vocab::{OWL_THING, RDF_TYPE};

/// Configuration for the federated executor.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Barrier timeout for one pattern's invocation tasks.
    pub pattern_timeout: Duration,
    /// Total time budget for gathering; evaluation proceeds over whatever
    /// was collected when the cutoff hits.
    pub global_cutoff: Duration,
    /// LIMIT applied to batched endpoint SELECTs.
    pub endpoint_result_limit: usize,
    /// Whether to record (selectivity, latency) samples after productive
    /// patterns.
    pub record_stats: bool,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        ExecutorConfig {
            pattern_timeout: Duration::from_secs(60),
            global_cutoff: Duration::from_secs(300),
            endpoint_result_limit: 500,
            record_stats: true,
        }
    }
}

/// Values currently known for each query variable.
type VariableBindings = HashMap<String, HashSet<Term>>;

/// Executes planned basic graph patterns against federated sources.
#[derive(Debug)]
pub struct FederatedExecutor {
    planner: PatternPlanner,
    invoker: Arc<dyn ServiceInvoker>,
    registry: Arc<dyn ServiceRegistry>,
    stats: Arc<PredicateStatsStore>,
    reasoner: Arc<dyn Reasoner>,
    tasks: Arc<TaskManager>,
    config: ExecutorConfig,
}

impl FederatedExecutor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        invoker: Arc<dyn ServiceInvoker>,
        registry: Arc<dyn ServiceRegistry>,
        resolvability: Arc<ResolvabilityCache>,
        stats: Arc<PredicateStatsStore>,
        reasoner: Arc<dyn Reasoner>,
        tasks: Arc<TaskManager>,
        config: ExecutorConfig,
    ) -> Self {
        let planner = PatternPlanner::new(stats.clone(), resolvability, reasoner.clone());
        FederatedExecutor {
            planner,
            invoker,
            registry,
            stats,
            reasoner,
            tasks,
            config,
        }
    }

    /// Plan and execute a federated query, returning the final bindings.
    #[instrument(skip_all, fields(patterns = query.len()))]
    pub async fn execute(&self, query: &BasicGraphPattern) -> Result<Vec<Binding>> {
        let plan = self.planner.plan(query).await?;
        let graph = Arc::new(RwLock::new(Graph::new()));
        let mut var_bindings: VariableBindings = HashMap::new();
        let started = Instant::now();

        for step in &plan.steps {
            if started.elapsed() >= self.config.global_cutoff {
                warn!(
                    elapsed = ?started.elapsed(),
                    "global cutoff reached, evaluating over partial graph"
                );
                break;
            }
            self.process_pattern(step, &graph, &mut var_bindings).await;
        }

        let graph = graph.read().await;
        let bindings = self.reasoner.evaluate(query, &graph);
        info!(
            triples = graph.len(),
            solutions = bindings.len(),
            elapsed = ?started.elapsed(),
            "federated query complete"
        );
        Ok(bindings)
    }

    /// Resolve one scheduled pattern into the shared graph. Never fails:
    /// every error path degrades to "this pattern produced nothing".
    async fn process_pattern(
        &self,
        step: &PlannedPattern,
        graph: &Arc<RwLock<Graph>>,
        var_bindings: &mut VariableBindings,
    ) {
        trace!(pattern = %step.pattern, direction = %step.direction, "processing pattern");

        let Some(predicate) = pattern_predicate(step) else {
            return;
        };

        let (input_node, _) = match step.direction {
            Direction::Forward => (&step.pattern.subject, &step.pattern.object),
            Direction::Reverse => (&step.pattern.object, &step.pattern.subject),
        };
        let inputs = collect_values(input_node, var_bindings);
        if inputs.is_empty() {
            debug!(pattern = %step.pattern, "no bound input values, nothing to do");
            return;
        }

        let own_closure = self.reasoner.equivalent_properties(&predicate);
        let invocation_closure = match step.direction {
            Direction::Forward => own_closure.clone(),
            Direction::Reverse => match self.reasoner.inverse_property(&predicate) {
                Some(inverse) => self.reasoner.equivalent_properties(&inverse),
                None => Vec::new(),
            },
        };

        let web_services = self.services_for(&invocation_closure, ServiceKind::WebService).await;
        let endpoints = self.services_for(&own_closure, ServiceKind::SparqlEndpoint).await;

        let started = Instant::now();
        let before = graph.read().await.len();

        if step.resolvable && !web_services.is_empty() {
            self.fan_out(step, &web_services, &inputs, graph).await;
        } else if !endpoints.is_empty() {
            self.endpoint_batch(step, &endpoints, &predicate, &inputs, graph)
                .await;
        } else {
            debug!(pattern = %step.pattern, "no resolver for pattern, contributes no facts");
        }

        let produced = graph.read().await.len() > before;
        self.populate_bindings(step, &own_closure, graph, var_bindings)
            .await;

        if produced && self.config.record_stats {
            self.record_pattern_stats(
                step,
                &predicate,
                &own_closure,
                inputs.len(),
                started.elapsed(),
                graph,
                var_bindings,
            )
            .await;
        }
    }

    /// One concurrent invocation task per bound input value; a per-pattern
    /// barrier joins them before the caller schedules the next pattern.
    async fn fan_out(
        &self,
        step: &PlannedPattern,
        services: &[ServiceRef],
        inputs: &[Term],
        graph: &Arc<RwLock<Graph>>,
    ) {
        let mut handles = Vec::new();
        let mut tokens = Vec::new();

        for input in inputs {
            let Some(input_iri) = input.as_iri().cloned() else {
                trace!(value = %input, "skipping literal input for service invocation");
                continue;
            };
            let services = services.to_vec();
            let invoker = self.invoker.clone();
            let graph = graph.clone();
            let description = format!("resolve {} for {}", step.pattern, input_iri);

            let handle = self.tasks.spawn(description, move |ctx| async move {
                let mut merged = 0usize;
                for service in &services {
                    if ctx.is_cancelled() {
                        return Err(FederationError::Task("invocation cancelled".into()));
                    }
                    ctx.set_status(format!("invoking {}", service.uri));

                    let input_graph = minimal_input_graph(&graph, &input_iri).await;
                    match invoker.invoke(service, &input_graph).await {
                        Ok(output) => {
                            merged += output.len();
                            graph.write().await.merge(output);
                        }
                        Err(e) => {
                            // failure isolation: this call produced zero triples
                            warn!(
                                service = service.uri.as_str(),
                                error = %e,
                                "service invocation failed"
                            );
                            ctx.error(e.to_string());
                        }
                    }
                }
                Ok(merged)
            });
            tokens.push(handle.task().token());
            handles.push(handle);
        }

        if handles.is_empty() {
            return;
        }

        let barrier = futures::future::join_all(handles.into_iter().map(|h| h.join()));
        match timeout(self.config.pattern_timeout, barrier).await {
            Ok(results) => {
                let failed = results.iter().filter(|r| r.is_err()).count();
                if failed > 0 {
                    debug!(failed, "some invocation tasks failed; continuing");
                }
            }
            Err(_) => {
                for token in &tokens {
                    token.cancel();
                }
                warn!(
                    timeout = ?self.config.pattern_timeout,
                    "pattern barrier timed out, cancelled outstanding invocations"
                );
            }
        }
    }

    /// Batched, result-limited SELECT against indexed endpoints, as a single
    /// task.
    async fn endpoint_batch(
        &self,
        step: &PlannedPattern,
        endpoints: &[ServiceRef],
        predicate: &NamedNode,
        inputs: &[Term],
        graph: &Arc<RwLock<Graph>>,
    ) {
        let query_text = build_values_select(
            predicate,
            inputs,
            step.direction,
            self.config.endpoint_result_limit,
        );
        let endpoints = endpoints.to_vec();
        let invoker = self.invoker.clone();
        let task_graph = graph.clone();
        let task_predicate = predicate.clone();
        let description = format!("endpoint batch for {}", step.pattern);

        let handle = self.tasks.spawn(description, move |ctx| async move {
            let mut merged = 0usize;
            for endpoint in &endpoints {
                if ctx.is_cancelled() {
                    return Err(FederationError::Task("endpoint batch cancelled".into()));
                }
                ctx.set_status(format!("querying {}", endpoint.uri));
                match invoker.select(&endpoint.endpoint, &query_text).await {
                    Ok(bindings) => {
                        let mut graph = task_graph.write().await;
                        for row in bindings {
                            let (Some(Term::Iri(s)), Some(o)) = (row.get("s").cloned(), row.get("o").cloned())
                            else {
                                continue;
                            };
                            if graph.insert(Triple::new(s, task_predicate.clone(), o)) {
                                merged += 1;
                            }
                        }
                    }
                    Err(e) => {
                        warn!(
                            endpoint = endpoint.uri.as_str(),
                            error = %e,
                            "endpoint query failed"
                        );
                        ctx.error(e.to_string());
                    }
                }
            }
            Ok(merged)
        });

        let token = handle.task().token();
        match timeout(self.config.pattern_timeout, handle.join()).await {
            Ok(Ok(merged)) => debug!(merged, "endpoint batch complete"),
            Ok(Err(e)) => debug!(error = %e, "endpoint batch failed; continuing"),
            Err(_) => {
                token.cancel();
                warn!("endpoint batch timed out, cancellation requested");
            }
        }
    }

    /// Record variable values observable for the pattern in the gathered
    /// graph.
    async fn populate_bindings(
        &self,
        step: &PlannedPattern,
        own_closure: &[NamedNode],
        graph: &Arc<RwLock<Graph>>,
        var_bindings: &mut VariableBindings,
    ) {
        let Some(predicate) = pattern_predicate(step) else {
            return;
        };
        let inverse_closure = self
            .reasoner
            .inverse_property(&predicate)
            .map(|inv| self.reasoner.equivalent_properties(&inv))
            .unwrap_or_default();
        let matches = {
            let graph = graph.read().await;
            pattern_matches(&graph, &step.pattern, own_closure, &inverse_closure, var_bindings)
        };

        let mut added = 0usize;
        for (subject, object) in matches {
            if let Some(v) = step.pattern.subject.as_variable() {
                if var_bindings
                    .entry(v.to_string())
                    .or_default()
                    .insert(Term::Iri(subject))
                {
                    added += 1;
                }
            }
            if let Some(v) = step.pattern.object.as_variable() {
                if var_bindings.entry(v.to_string()).or_default().insert(object) {
                    added += 1;
                }
            }
        }
        trace!(added, pattern = %step.pattern, "updated variable bindings");
    }

    /// Record a (selectivity, latency) sample for the pattern's predicate,
    /// every equivalent property, and the inverse property in the opposite
    /// direction.
    #[allow(clippy::too_many_arguments)]
    async fn record_pattern_stats(
        &self,
        step: &PlannedPattern,
        predicate: &NamedNode,
        own_closure: &[NamedNode],
        num_inputs: usize,
        elapsed: Duration,
        graph: &Arc<RwLock<Graph>>,
        var_bindings: &VariableBindings,
    ) {
        let result_count = {
            let graph = graph.read().await;
            let inverse_closure = self
                .reasoner
                .inverse_property(predicate)
                .map(|inv| self.reasoner.equivalent_properties(&inv))
                .unwrap_or_default();
            pattern_matches(&graph, &step.pattern, own_closure, &inverse_closure, var_bindings).len()
        };
        if result_count == 0 {
            return;
        }

        let selectivity = (result_count / num_inputs.max(1)) as u64;
        let time_ms = elapsed.as_millis() as u64;

        for member in own_closure {
            self.stats
                .record_sample(member.as_str(), step.direction, selectivity, time_ms)
                .await;
        }
        if let Some(inverse) = self.reasoner.inverse_property(predicate) {
            for member in self.reasoner.equivalent_properties(&inverse) {
                self.stats
                    .record_sample(
                        member.as_str(),
                        step.direction.opposite(),
                        selectivity,
                        time_ms,
                    )
                    .await;
            }
        }
    }

    /// Services of one kind registered for any member of a closure,
    /// de-duplicated by URI. Registry failures degrade to "no services".
    async fn services_for(&self, closure: &[NamedNode], kind: ServiceKind) -> Vec<ServiceRef> {
        let mut seen = HashSet::new();
        let mut services = Vec::new();
        for member in closure {
            match self.registry.find_services_by_predicate(member.as_str()).await {
                Ok(found) => {
                    for service in found {
                        if service.kind == kind && seen.insert(service.uri.clone()) {
                            services.push(service);
                        }
                    }
                }
                Err(e) => {
                    warn!(predicate = member.as_str(), error = %e, "registry lookup failed");
                }
            }
        }
        services
    }
}

fn pattern_predicate(step: &PlannedPattern) -> Option<NamedNode> {
    step.pattern
        .predicate
        .as_term()
        .and_then(Term::as_iri)
        .cloned()
}

/// Concrete values currently known for a pattern position.
fn collect_values(node: &QueryNode, var_bindings: &VariableBindings) -> Vec<Term> {
    match node {
        QueryNode::Term(t) => vec![t.clone()],
        QueryNode::Variable(v) => var_bindings
            .get(v)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default(),
    }
}

/// The minimal input graph for invoking a service on one node: whatever the
/// local graph already knows about it, or a bare typed node.
async fn minimal_input_graph(graph: &Arc<RwLock<Graph>>, input: &NamedNode) -> Graph {
    let local = graph.read().await;
    let mut input_graph: Graph = local.about(input).into_iter().cloned().collect();
    if input_graph.is_empty() {
        input_graph.insert(Triple::new(
            input.clone(),
            RDF_TYPE,
            Term::iri(OWL_THING),
        ));
    }
    input_graph
}

/// All (subject, object) pairs in the graph that satisfy the pattern under
/// the current variable bindings, consulting both the predicate's own
/// closure and, with orientation swapped, its inverse closure.
fn pattern_matches(
    graph: &Graph,
    pattern: &crate::model::TriplePattern,
    own_closure: &[NamedNode],
    inverse_closure: &[NamedNode],
    var_bindings: &VariableBindings,
) -> Vec<(NamedNode, Term)> {
    let subject_filter: Option<HashSet<NamedNode>> = match &pattern.subject {
        QueryNode::Term(Term::Iri(n)) => Some(HashSet::from([n.clone()])),
        // a literal subject can never match
        QueryNode::Term(Term::Literal(_)) => return Vec::new(),
        QueryNode::Variable(v) => var_bindings
            .get(v)
            .filter(|set| !set.is_empty())
            .map(|set| set.iter().filter_map(Term::as_iri).cloned().collect()),
    };
    let object_filter: Option<HashSet<Term>> = match &pattern.object {
        QueryNode::Term(t) => Some(HashSet::from([t.clone()])),
        QueryNode::Variable(v) => var_bindings
            .get(v)
            .filter(|set| !set.is_empty())
            .cloned(),
    };

    let own: HashSet<&str> = own_closure.iter().map(|n| n.as_str()).collect();
    let inverse: HashSet<&str> = inverse_closure.iter().map(|n| n.as_str()).collect();

    let mut pairs = Vec::new();
    for triple in graph.iter() {
        if own.contains(triple.predicate.as_str()) {
            let subject_ok = subject_filter
                .as_ref()
                .map_or(true, |f| f.contains(&triple.subject));
            let object_ok = object_filter
                .as_ref()
                .map_or(true, |f| f.contains(&triple.object));
            if subject_ok && object_ok {
                pairs.push((triple.subject.clone(), triple.object.clone()));
            }
        }
        if inverse.contains(triple.predicate.as_str()) {
            // an inverse triple (o, inv, s) witnesses (s, p, o)
            let Some(subject) = triple.object.as_iri() else {
                continue;
            };
            let object = Term::Iri(triple.subject.clone());
            let subject_ok = subject_filter.as_ref().map_or(true, |f| f.contains(subject));
            let object_ok = object_filter.as_ref().map_or(true, |f| f.contains(&object));
            if subject_ok && object_ok {
                pairs.push((subject.clone(), object));
            }
        }
    }
    pairs
}

/// Render the batched SELECT used for endpoint-resolvable patterns.
fn build_values_select(
    predicate: &NamedNode,
    inputs: &[Term],
    direction: Direction,
    limit: usize,
) -> String {
    let values: String = match direction {
        // only IRIs can stand in the subject position
        Direction::Forward => inputs
            .iter()
            .filter_map(Term::as_iri)
            .map(|n| n.to_string())
            .collect::<Vec<_>>()
            .join(" "),
        Direction::Reverse => inputs
            .iter()
            .map(Term::to_string)
            .collect::<Vec<_>>()
            .join(" "),
    };
    let constrained = match direction {
        Direction::Forward => "s",
        Direction::Reverse => "o",
    };
    format!(
        "SELECT ?s ?o WHERE {{ VALUES ?{constrained} {{ {values} }} ?s {predicate} ?o . }} LIMIT {limit}"
    )
}

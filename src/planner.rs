//! Stats-driven pattern planner
//!
//! Orders the triple patterns of a basic graph pattern so that cheap,
//! low-fan-out patterns are resolved first and every pattern is only
//! evaluated once one of its join variables has been bound by an earlier
//! step. Each remote invocation is a network call bound to a concrete
//! subject or object, so scheduling low-selectivity predicates early keeps
//! the number of downstream invocations small.
//!
//! The algorithm is a greedy minimum-spanning-forest growth: seed with the
//! cheapest pattern, repeatedly append the cheapest pattern connected to the
//! scheduled set by a shared variable, and open a new component when the
//! current one is exhausted. The output is always a permutation of the
//! input.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, trace};

use crate::error::{FederationError, Result};
use crate::model::{BasicGraphPattern, NamedNode, QueryNode, Term, TriplePattern};
use crate::reasoner::Reasoner;
use crate::resolvability::ResolvabilityCache;
use crate::stats::{Direction, PredicateStatsStore};
use crate::vocab::NO_STATS_AVAILABLE;

/// Rank for a pattern whose cost cannot be estimated from stats but which is
/// still serviceable. `NO_STATS_AVAILABLE` (-1) sits between this scale's
/// positive costs and the ranks below.
pub const COST_EXPENSIVE: i64 = -2;

/// Rank for a pattern that no service can resolve in the required direction,
/// or whose join variables are still entirely unbound.
pub const COST_UNRESOLVABLE: i64 = -3;

/// One triple pattern of the query under planning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatternNode {
    pub index: usize,
    pub pattern: TriplePattern,
    pub variables: HashSet<String>,
}

/// A join opportunity between two patterns sharing at least one variable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdjacencyEdge {
    pub from: usize,
    pub to: usize,
    pub shared_variables: Vec<String>,
    /// Static cost estimate of crossing to the target pattern; lower is
    /// preferred earlier.
    pub weight: i64,
}

/// One scheduled step of the plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedPattern {
    pub pattern: TriplePattern,
    /// Position of the pattern in the original query.
    pub index: usize,
    /// The resolution direction the cost estimate assumed.
    pub direction: Direction,
    /// Signed cost rank at scheduling time (see [`compare_costs`]).
    pub cost: i64,
    /// False when no service resolves the predicate in the chosen direction;
    /// the executor defers such patterns to the endpoint fallback.
    pub resolvable: bool,
    /// True when this step opened a new connected component.
    pub seed: bool,
}

/// The planner's output: a total order over the input patterns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatternPlan {
    pub steps: Vec<PlannedPattern>,
    pub edges: Vec<AdjacencyEdge>,
}

/// Compare two signed cost ranks.
///
/// Positive costs order ascending and always precede negative ranks;
/// negative ranks order by ascending magnitude, so `NO_STATS_AVAILABLE` (-1)
/// precedes [`COST_EXPENSIVE`] (-2) precedes [`COST_UNRESOLVABLE`] (-3).
pub fn compare_costs(a: i64, b: i64) -> Ordering {
    if a == b {
        return Ordering::Equal;
    }
    match (a < 0, b < 0) {
        (false, true) => Ordering::Less,
        (true, false) => Ordering::Greater,
        _ => a.abs().cmp(&b.abs()),
    }
}

/// Orders triple patterns using predicate statistics and resolvability.
#[derive(Debug)]
pub struct PatternPlanner {
    stats: Arc<PredicateStatsStore>,
    resolvability: Arc<ResolvabilityCache>,
    reasoner: Arc<dyn Reasoner>,
}

impl PatternPlanner {
    pub fn new(
        stats: Arc<PredicateStatsStore>,
        resolvability: Arc<ResolvabilityCache>,
        reasoner: Arc<dyn Reasoner>,
    ) -> Self {
        PatternPlanner {
            stats,
            resolvability,
            reasoner,
        }
    }

    /// Produce an evaluation order for the basic graph pattern.
    pub async fn plan(&self, query: &BasicGraphPattern) -> Result<PatternPlan> {
        if query.is_empty() {
            return Err(FederationError::Plan("empty basic graph pattern".into()));
        }

        let nodes = build_nodes(query)?;
        let edges = self.build_edges(&nodes).await?;

        let mut adjacent: HashMap<usize, HashSet<usize>> = HashMap::new();
        for edge in &edges {
            adjacent.entry(edge.from).or_default().insert(edge.to);
            adjacent.entry(edge.to).or_default().insert(edge.from);
        }

        let mut steps: Vec<PlannedPattern> = Vec::with_capacity(nodes.len());
        let mut scheduled: HashSet<usize> = HashSet::new();
        let mut bound_vars: HashSet<String> = HashSet::new();

        while scheduled.len() < nodes.len() {
            // connected candidates first; an exhausted component opens a new
            // seed over every remaining pattern
            let mut candidates: Vec<&PatternNode> = nodes
                .iter()
                .filter(|n| !scheduled.contains(&n.index))
                .filter(|n| {
                    adjacent
                        .get(&n.index)
                        .map_or(false, |adj| adj.iter().any(|i| scheduled.contains(i)))
                })
                .collect();
            let seed = candidates.is_empty();
            if seed {
                candidates = nodes
                    .iter()
                    .filter(|n| !scheduled.contains(&n.index))
                    .collect();
            }

            let mut best: Option<(&PatternNode, Direction, i64)> = None;
            for node in candidates {
                let (direction, cost) = self.cost_for(&node.pattern, &bound_vars).await?;
                trace!(index = node.index, %direction, cost, "candidate pattern cost");
                let better = match &best {
                    None => true,
                    Some((current, _, best_cost)) => match compare_costs(cost, *best_cost) {
                        Ordering::Less => true,
                        Ordering::Greater => false,
                        // deterministic tie break on original position
                        Ordering::Equal => node.index < current.index,
                    },
                };
                if better {
                    best = Some((node, direction, cost));
                }
            }

            let (node, direction, cost) =
                best.expect("candidate set is never empty while patterns remain");
            scheduled.insert(node.index);
            bound_vars.extend(node.variables.iter().cloned());
            steps.push(PlannedPattern {
                pattern: node.pattern.clone(),
                index: node.index,
                direction,
                cost,
                resolvable: cost != COST_UNRESOLVABLE,
                seed,
            });
        }

        debug!(
            patterns = steps.len(),
            components = steps.iter().filter(|s| s.seed).count(),
            "planned evaluation order"
        );

        Ok(PatternPlan { steps, edges })
    }

    /// Cost rank of a pattern given the variables bound so far, together
    /// with the direction the estimate assumed.
    async fn cost_for(
        &self,
        pattern: &TriplePattern,
        bound_vars: &HashSet<String>,
    ) -> Result<(Direction, i64)> {
        let s_bound = position_bound(&pattern.subject, bound_vars);
        let o_bound = position_bound(&pattern.object, bound_vars);

        if !s_bound && !o_bound {
            return Ok((Direction::Forward, COST_UNRESOLVABLE));
        }

        let predicate = pattern_predicate(pattern)?;

        if s_bound && o_bound {
            let forward = self.direction_cost(&predicate, Direction::Forward).await?;
            let reverse = self.direction_cost(&predicate, Direction::Reverse).await?;
            if compare_costs(forward, reverse) != Ordering::Greater {
                Ok((Direction::Forward, forward))
            } else {
                Ok((Direction::Reverse, reverse))
            }
        } else if s_bound {
            let cost = self.direction_cost(&predicate, Direction::Forward).await?;
            Ok((Direction::Forward, cost))
        } else {
            let cost = self.direction_cost(&predicate, Direction::Reverse).await?;
            Ok((Direction::Reverse, cost))
        }
    }

    /// Cost of resolving a predicate in one direction: stats-derived
    /// selectivity, `NO_STATS_AVAILABLE` when serviceable but unmeasured,
    /// [`COST_UNRESOLVABLE`] when no service covers the direction.
    async fn direction_cost(&self, predicate: &NamedNode, direction: Direction) -> Result<i64> {
        let service_closure = match direction {
            Direction::Forward => self.reasoner.equivalent_properties(predicate),
            Direction::Reverse => match self.reasoner.inverse_property(predicate) {
                Some(inverse) => self.reasoner.equivalent_properties(&inverse),
                None => return Ok(COST_UNRESOLVABLE),
            },
        };

        if !self
            .resolvability
            .is_any_resolvable(service_closure.iter())
            .await?
        {
            return Ok(COST_UNRESOLVABLE);
        }

        Ok(self
            .first_available(predicate, direction, &service_closure)
            .await)
    }

    /// First usable selectivity aggregate among the predicate's own closure,
    /// falling back for reverse resolution to the inverse closure recorded
    /// forward (samples are written under both spellings).
    async fn first_available(
        &self,
        predicate: &NamedNode,
        direction: Direction,
        service_closure: &[NamedNode],
    ) -> i64 {
        let own_closure = self.reasoner.equivalent_properties(predicate);
        for member in &own_closure {
            let estimate = self.stats.get_stats(member.as_str(), direction).await;
            if estimate.is_available() {
                return estimate.avg_selectivity;
            }
        }
        if direction == Direction::Reverse {
            for member in service_closure {
                let estimate = self
                    .stats
                    .get_stats(member.as_str(), Direction::Forward)
                    .await;
                if estimate.is_available() {
                    return estimate.avg_selectivity;
                }
            }
        }
        NO_STATS_AVAILABLE
    }

    async fn build_edges(&self, nodes: &[PatternNode]) -> Result<Vec<AdjacencyEdge>> {
        let mut edges = Vec::new();
        for a in nodes {
            for b in nodes.iter().filter(|b| b.index > a.index) {
                let mut shared: Vec<String> =
                    a.variables.intersection(&b.variables).cloned().collect();
                if shared.is_empty() {
                    continue;
                }
                shared.sort();
                let weight = self.static_weight(&b.pattern).await?;
                edges.push(AdjacencyEdge {
                    from: a.index,
                    to: b.index,
                    shared_variables: shared,
                    weight,
                });
            }
        }
        Ok(edges)
    }

    /// Direction-agnostic cost estimate used as edge weight.
    async fn static_weight(&self, pattern: &TriplePattern) -> Result<i64> {
        let predicate = pattern_predicate(pattern)?;
        let forward = self.direction_cost(&predicate, Direction::Forward).await?;
        let reverse = self.direction_cost(&predicate, Direction::Reverse).await?;
        Ok(if compare_costs(forward, reverse) != Ordering::Greater {
            forward
        } else {
            reverse
        })
    }
}

fn build_nodes(query: &BasicGraphPattern) -> Result<Vec<PatternNode>> {
    query
        .patterns
        .iter()
        .enumerate()
        .map(|(index, pattern)| {
            // queries with variables in the predicate position cannot be
            // mapped to services
            pattern_predicate(pattern)?;
            Ok(PatternNode {
                index,
                pattern: pattern.clone(),
                variables: pattern.variables().iter().map(|v| v.to_string()).collect(),
            })
        })
        .collect()
}

fn pattern_predicate(pattern: &TriplePattern) -> Result<NamedNode> {
    match &pattern.predicate {
        QueryNode::Term(Term::Iri(n)) => Ok(n.clone()),
        QueryNode::Term(Term::Literal(_)) => Err(FederationError::Plan(
            "predicate position must be an IRI".into(),
        )),
        QueryNode::Variable(v) => Err(FederationError::Plan(format!(
            "variables are not supported in the predicate position (?{v})"
        ))),
    }
}

fn position_bound(node: &QueryNode, bound_vars: &HashSet<String>) -> bool {
    match node {
        QueryNode::Term(_) => true,
        QueryNode::Variable(v) => bound_vars.contains(v),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reasoner::StaticReasoner;
    use crate::registry::{InMemoryRegistry, ServiceRef};
    use crate::stats::{MemoryStatsBackend, StatsConfig};
    use crate::vocab::RDF_TYPE;

    const P: &str = "http://example.org/pred/p";
    const Q: &str = "http://example.org/pred/q";
    const R: &str = "http://example.org/pred/r";

    struct Fixture {
        registry: Arc<InMemoryRegistry>,
        stats: Arc<PredicateStatsStore>,
        reasoner: Arc<StaticReasoner>,
    }

    impl Fixture {
        async fn new(reasoner: StaticReasoner) -> Self {
            Fixture {
                registry: Arc::new(InMemoryRegistry::new()),
                stats: Arc::new(
                    PredicateStatsStore::open(
                        Arc::new(MemoryStatsBackend::new()),
                        StatsConfig::default(),
                    )
                    .await
                    .unwrap(),
                ),
                reasoner: Arc::new(reasoner),
            }
        }

        async fn resolvable(&self, predicate: &str) {
            self.registry
                .register(
                    predicate,
                    ServiceRef::web_service(
                        format!("{predicate}#service"),
                        "svc",
                        format!("{predicate}#endpoint"),
                    ),
                )
                .await;
        }

        fn planner(&self) -> PatternPlanner {
            let cache = Arc::new(ResolvabilityCache::new(
                self.registry.clone(),
                self.reasoner.clone(),
            ));
            PatternPlanner::new(self.stats.clone(), cache, self.reasoner.clone())
        }
    }

    fn var(name: &str) -> QueryNode {
        QueryNode::variable(name)
    }

    fn iri(value: &str) -> QueryNode {
        QueryNode::iri(value)
    }

    #[test]
    fn cost_ranking_follows_signed_order() {
        assert_eq!(compare_costs(5, 10), Ordering::Less);
        assert_eq!(compare_costs(10, 5), Ordering::Greater);
        assert_eq!(compare_costs(5, NO_STATS_AVAILABLE), Ordering::Less);
        assert_eq!(
            compare_costs(NO_STATS_AVAILABLE, COST_EXPENSIVE),
            Ordering::Less
        );
        assert_eq!(
            compare_costs(COST_EXPENSIVE, COST_UNRESOLVABLE),
            Ordering::Less
        );
        assert_eq!(
            compare_costs(COST_UNRESOLVABLE, COST_UNRESOLVABLE),
            Ordering::Equal
        );
        assert_eq!(compare_costs(0, COST_UNRESOLVABLE), Ordering::Less);
    }

    #[tokio::test]
    async fn output_is_a_permutation_with_connectivity() {
        let fixture = Fixture::new(StaticReasoner::new()).await;
        for p in [P, Q, R] {
            fixture.resolvable(p).await;
        }

        // chain rooted at a concrete subject, plus a disjoint component on ?a
        let query = BasicGraphPattern::new(vec![
            TriplePattern::new(var("x"), iri(P), var("y")),
            TriplePattern::new(var("y"), iri(Q), var("z")),
            TriplePattern::new(iri("http://ex.org/root"), iri(P), var("x")),
            TriplePattern::new(iri("http://ex.org/other"), iri(R), var("a")),
        ]);

        let plan = fixture.planner().plan(&query).await.unwrap();

        let mut indices: Vec<usize> = plan.steps.iter().map(|s| s.index).collect();
        indices.sort();
        assert_eq!(indices, vec![0, 1, 2, 3]);

        // every non-seed step shares a variable with an earlier step
        let mut seen: HashSet<String> = HashSet::new();
        for step in &plan.steps {
            let vars: HashSet<String> = step
                .pattern
                .variables()
                .iter()
                .map(|v| v.to_string())
                .collect();
            if !step.seed {
                assert!(
                    !vars.is_disjoint(&seen),
                    "step {} is disconnected from its component",
                    step.index
                );
            }
            seen.extend(vars);
        }

        // the disjoint component required a second seed
        assert_eq!(plan.steps.iter().filter(|s| s.seed).count(), 2);
    }

    #[tokio::test]
    async fn schedules_typed_seed_then_cheap_then_unknown() {
        let fixture = Fixture::new(StaticReasoner::new()).await;
        fixture.resolvable(P).await;
        fixture.resolvable(Q).await;
        fixture
            .stats
            .record_sample(P, Direction::Forward, 5, 100)
            .await;
        fixture.stats.recompute_stats().await.unwrap();

        let query = BasicGraphPattern::new(vec![
            TriplePattern::new(var("x"), iri(RDF_TYPE), iri("http://example.org/class/Foo")),
            TriplePattern::new(var("x"), iri(P), var("y")),
            TriplePattern::new(var("y"), iri(Q), var("z")),
        ]);

        let plan = fixture.planner().plan(&query).await.unwrap();
        let order: Vec<usize> = plan.steps.iter().map(|s| s.index).collect();
        assert_eq!(order, vec![0, 1, 2]);

        assert!(plan.steps[0].seed);
        assert_eq!(plan.steps[1].cost, 5);
        assert_eq!(plan.steps[1].direction, Direction::Forward);
        assert_eq!(plan.steps[2].cost, NO_STATS_AVAILABLE);
    }

    #[tokio::test]
    async fn stats_found_under_equivalent_property() {
        let mut reasoner = StaticReasoner::new();
        reasoner.declare_equivalent(P, Q);
        let fixture = Fixture::new(reasoner).await;
        fixture.resolvable(Q).await;
        fixture
            .stats
            .record_sample(Q, Direction::Forward, 7, 100)
            .await;
        fixture.stats.recompute_stats().await.unwrap();

        let query = BasicGraphPattern::new(vec![TriplePattern::new(
            iri("http://ex.org/s"),
            iri(P),
            var("y"),
        )]);

        let plan = fixture.planner().plan(&query).await.unwrap();
        assert_eq!(plan.steps[0].cost, 7);
        assert!(plan.steps[0].resolvable);
    }

    #[tokio::test]
    async fn unresolvable_patterns_rank_last() {
        let fixture = Fixture::new(StaticReasoner::new()).await;
        fixture.resolvable(P).await;

        let query = BasicGraphPattern::new(vec![
            TriplePattern::new(iri("http://ex.org/s"), iri(Q), var("y")),
            TriplePattern::new(iri("http://ex.org/s"), iri(P), var("y")),
        ]);

        let plan = fixture.planner().plan(&query).await.unwrap();
        let order: Vec<usize> = plan.steps.iter().map(|s| s.index).collect();
        assert_eq!(order, vec![1, 0]);
        assert!(plan.steps[0].resolvable);
        assert!(!plan.steps[1].resolvable);
    }

    #[tokio::test]
    async fn ties_break_on_query_position() {
        let fixture = Fixture::new(StaticReasoner::new()).await;
        fixture.resolvable(P).await;
        fixture.resolvable(Q).await;

        let query = BasicGraphPattern::new(vec![
            TriplePattern::new(iri("http://ex.org/s"), iri(Q), var("y")),
            TriplePattern::new(iri("http://ex.org/s"), iri(P), var("z")),
        ]);

        let plan = fixture.planner().plan(&query).await.unwrap();
        let order: Vec<usize> = plan.steps.iter().map(|s| s.index).collect();
        assert_eq!(order, vec![0, 1]);
    }

    #[tokio::test]
    async fn variable_predicates_are_rejected() {
        let fixture = Fixture::new(StaticReasoner::new()).await;
        let query = BasicGraphPattern::new(vec![TriplePattern::new(
            iri("http://ex.org/s"),
            var("p"),
            var("y"),
        )]);
        let err = fixture.planner().plan(&query).await.unwrap_err();
        assert!(matches!(err, FederationError::Plan(_)));
    }

    #[tokio::test]
    async fn empty_pattern_set_is_rejected() {
        let fixture = Fixture::new(StaticReasoner::new()).await;
        let err = fixture
            .planner()
            .plan(&BasicGraphPattern::default())
            .await
            .unwrap_err();
        assert!(matches!(err, FederationError::Plan(_)));
    }
}

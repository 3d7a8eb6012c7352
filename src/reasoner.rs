//! Reasoning collaborator
//!
//! The engine delegates ontology reasoning to an external collaborator: it
//! needs property-equivalence closures and inverse properties while planning
//! and caching, and final basic-graph-pattern matching over the merged local
//! graph once gathering finishes. [`StaticReasoner`] implements the contract
//! from explicitly declared equivalences and inverses, with a naive
//! binding-join evaluator; production deployments plug in a full OWL
//! reasoner behind the same trait.

use std::collections::{HashMap, HashSet};
use std::fmt;

use crate::model::{BasicGraphPattern, Binding, Graph, NamedNode, QueryNode, Term, TriplePattern};

/// Contract consumed from the reasoning engine.
pub trait Reasoner: Send + Sync + fmt::Debug {
    /// The `owl:equivalentProperty` closure of a property, including the
    /// property itself.
    fn equivalent_properties(&self, property: &NamedNode) -> Vec<NamedNode>;

    /// The declared inverse of a property, if any.
    fn inverse_property(&self, property: &NamedNode) -> Option<NamedNode>;

    /// Match a basic graph pattern against a graph, producing all solutions.
    fn evaluate(&self, query: &BasicGraphPattern, graph: &Graph) -> Vec<Binding>;
}

/// Reasoner over explicitly declared equivalences and inverses.
#[derive(Debug, Default)]
pub struct StaticReasoner {
    /// property URI -> group id; groups are maintained as closures.
    group_of: HashMap<String, usize>,
    groups: Vec<HashSet<String>>,
    inverses: HashMap<String, String>,
}

impl StaticReasoner {
    pub fn new() -> Self {
        StaticReasoner::default()
    }

    /// Declare two properties equivalent, merging their closures.
    pub fn declare_equivalent(&mut self, a: impl Into<String>, b: impl Into<String>) {
        let a = a.into();
        let b = b.into();
        let ga = self.group_for(&a);
        let gb = self.group_for(&b);
        if ga == gb {
            return;
        }
        // merge the smaller group into the larger
        let (keep, drop) = if self.groups[ga].len() >= self.groups[gb].len() {
            (ga, gb)
        } else {
            (gb, ga)
        };
        let moved: Vec<String> = self.groups[drop].drain().collect();
        for uri in moved {
            self.group_of.insert(uri.clone(), keep);
            self.groups[keep].insert(uri);
        }
    }

    /// Declare `a` and `b` inverse properties of each other.
    pub fn declare_inverse(&mut self, a: impl Into<String>, b: impl Into<String>) {
        let a = a.into();
        let b = b.into();
        self.inverses.insert(a.clone(), b.clone());
        self.inverses.insert(b, a);
    }

    fn group_for(&mut self, uri: &str) -> usize {
        if let Some(&g) = self.group_of.get(uri) {
            return g;
        }
        let g = self.groups.len();
        self.groups.push(HashSet::from([uri.to_string()]));
        self.group_of.insert(uri.to_string(), g);
        g
    }
}

impl Reasoner for StaticReasoner {
    fn equivalent_properties(&self, property: &NamedNode) -> Vec<NamedNode> {
        match self.group_of.get(property.as_str()) {
            Some(&g) => {
                let mut members: Vec<NamedNode> =
                    self.groups[g].iter().map(NamedNode::new).collect();
                members.sort_by(|a, b| a.as_str().cmp(b.as_str()));
                members
            }
            None => vec![property.clone()],
        }
    }

    fn inverse_property(&self, property: &NamedNode) -> Option<NamedNode> {
        self.inverses.get(property.as_str()).map(NamedNode::new)
    }

    fn evaluate(&self, query: &BasicGraphPattern, graph: &Graph) -> Vec<Binding> {
        let mut solutions: Vec<Binding> = vec![Binding::new()];
        for pattern in &query.patterns {
            let mut next = Vec::new();
            for binding in &solutions {
                self.extend_binding(binding, pattern, graph, &mut next);
            }
            solutions = next;
            if solutions.is_empty() {
                break;
            }
        }
        solutions
    }
}

impl StaticReasoner {
    /// Extend one partial solution with every triple matching the pattern,
    /// honouring declared equivalences and inverses: a pattern over `p` is
    /// witnessed by triples stored under any equivalent spelling, and with
    /// orientation swapped under the inverse's spellings.
    fn extend_binding(
        &self,
        binding: &Binding,
        pattern: &TriplePattern,
        graph: &Graph,
        out: &mut Vec<Binding>,
    ) {
        // a position bound to a literal can never match the subject or
        // predicate of a triple
        if bound_to_literal(&pattern.subject, binding)
            || bound_to_literal(&pattern.predicate, binding)
        {
            return;
        }

        let subject = resolve_iri(&pattern.subject, binding);
        let object = resolve_term(&pattern.object, binding);

        let Some(predicate) = resolve_iri(&pattern.predicate, binding) else {
            // unbound predicate variable: match raw triples, no inference
            for triple in graph.matching(subject.as_ref(), None, object.as_ref()) {
                extend_with(
                    binding,
                    pattern,
                    Term::Iri(triple.subject.clone()),
                    Term::Iri(triple.predicate.clone()),
                    triple.object.clone(),
                    out,
                );
            }
            return;
        };

        for member in self.equivalent_properties(&predicate) {
            for triple in graph.matching(subject.as_ref(), Some(&member), object.as_ref()) {
                extend_with(
                    binding,
                    pattern,
                    Term::Iri(triple.subject.clone()),
                    Term::Iri(predicate.clone()),
                    triple.object.clone(),
                    out,
                );
            }
        }

        if let Some(inverse) = self.inverse_property(&predicate) {
            for member in self.equivalent_properties(&inverse) {
                // a triple (o, inverse, s) witnesses (s, p, o)
                for triple in graph.matching(None, Some(&member), None) {
                    let Some(witnessed_subject) = triple.object.as_iri() else {
                        continue;
                    };
                    let witnessed_object = Term::Iri(triple.subject.clone());
                    if subject.as_ref().map_or(false, |s| s != witnessed_subject) {
                        continue;
                    }
                    if object.as_ref().map_or(false, |o| o != &witnessed_object) {
                        continue;
                    }
                    extend_with(
                        binding,
                        pattern,
                        Term::Iri(witnessed_subject.clone()),
                        Term::Iri(predicate.clone()),
                        witnessed_object,
                        out,
                    );
                }
            }
        }
    }
}

/// Push the solution extending `binding` with the witnessed triple, if
/// consistent and not already present.
fn extend_with(
    binding: &Binding,
    pattern: &TriplePattern,
    subject: Term,
    predicate: Term,
    object: Term,
    out: &mut Vec<Binding>,
) {
    let mut extended = binding.clone();
    let mut consistent = true;
    if let Some(v) = pattern.subject.as_variable() {
        consistent &= bind(&mut extended, v, subject);
    }
    if let Some(v) = pattern.predicate.as_variable() {
        consistent &= bind(&mut extended, v, predicate);
    }
    if let Some(v) = pattern.object.as_variable() {
        consistent &= bind(&mut extended, v, object);
    }
    if consistent && !out.contains(&extended) {
        out.push(extended);
    }
}

fn bind(binding: &mut Binding, variable: &str, term: Term) -> bool {
    match binding.get(variable) {
        Some(existing) => existing == &term,
        None => {
            binding.insert(variable.to_string(), term);
            true
        }
    }
}

fn resolve_iri(node: &QueryNode, binding: &Binding) -> Option<NamedNode> {
    match node {
        QueryNode::Term(Term::Iri(n)) => Some(n.clone()),
        QueryNode::Term(Term::Literal(_)) => None,
        QueryNode::Variable(v) => binding.get(v).and_then(|t| t.as_iri()).cloned(),
    }
}

fn resolve_term(node: &QueryNode, binding: &Binding) -> Option<Term> {
    match node {
        QueryNode::Term(t) => Some(t.clone()),
        QueryNode::Variable(v) => binding.get(v).cloned(),
    }
}

fn bound_to_literal(node: &QueryNode, binding: &Binding) -> bool {
    match node {
        QueryNode::Variable(v) => matches!(binding.get(v), Some(Term::Literal(_))),
        QueryNode::Term(Term::Literal(_)) => true,
        QueryNode::Term(Term::Iri(_)) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Triple;

    const P: &str = "http://example.org/pred/p";
    const Q: &str = "http://example.org/pred/q";
    const R: &str = "http://example.org/pred/r";

    #[test]
    fn equivalence_closure_is_transitive() {
        let mut reasoner = StaticReasoner::new();
        reasoner.declare_equivalent(P, Q);
        reasoner.declare_equivalent(Q, R);

        let closure = reasoner.equivalent_properties(&NamedNode::new(P));
        let uris: Vec<&str> = closure.iter().map(|n| n.as_str()).collect();
        assert_eq!(uris.len(), 3);
        assert!(uris.contains(&P) && uris.contains(&Q) && uris.contains(&R));

        // every member sees the same closure
        assert_eq!(closure, reasoner.equivalent_properties(&NamedNode::new(R)));
    }

    #[test]
    fn undeclared_property_is_its_own_closure() {
        let reasoner = StaticReasoner::new();
        let closure = reasoner.equivalent_properties(&NamedNode::new(P));
        assert_eq!(closure, vec![NamedNode::new(P)]);
    }

    #[test]
    fn inverses_are_symmetric() {
        let mut reasoner = StaticReasoner::new();
        reasoner.declare_inverse(P, Q);
        assert_eq!(
            reasoner.inverse_property(&NamedNode::new(P)),
            Some(NamedNode::new(Q))
        );
        assert_eq!(
            reasoner.inverse_property(&NamedNode::new(Q)),
            Some(NamedNode::new(P))
        );
        assert_eq!(reasoner.inverse_property(&NamedNode::new(R)), None);
    }

    #[test]
    fn evaluate_joins_on_shared_variables() {
        let mut graph = Graph::new();
        graph.insert(Triple::new("http://ex.org/a", P, Term::iri("http://ex.org/b")));
        graph.insert(Triple::new("http://ex.org/b", Q, Term::literal("42")));
        graph.insert(Triple::new("http://ex.org/c", Q, Term::literal("7")));

        let query = BasicGraphPattern::new(vec![
            TriplePattern::new(
                QueryNode::variable("x"),
                QueryNode::iri(P),
                QueryNode::variable("y"),
            ),
            TriplePattern::new(
                QueryNode::variable("y"),
                QueryNode::iri(Q),
                QueryNode::variable("z"),
            ),
        ]);

        let reasoner = StaticReasoner::new();
        let solutions = reasoner.evaluate(&query, &graph);
        assert_eq!(solutions.len(), 1);
        let solution = &solutions[0];
        assert_eq!(solution["x"], Term::iri("http://ex.org/a"));
        assert_eq!(solution["y"], Term::iri("http://ex.org/b"));
        assert_eq!(solution["z"], Term::literal("42"));
    }

    #[test]
    fn evaluate_honours_equivalence_and_inverse() {
        let mut reasoner = StaticReasoner::new();
        reasoner.declare_equivalent(P, Q);
        reasoner.declare_inverse(P, R);

        let mut graph = Graph::new();
        // stored under the equivalent spelling
        graph.insert(Triple::new("http://ex.org/a", Q, Term::iri("http://ex.org/b")));
        // stored under the inverse spelling: witnesses (a, P, c)
        graph.insert(Triple::new("http://ex.org/c", R, Term::iri("http://ex.org/a")));

        let query = BasicGraphPattern::new(vec![TriplePattern::new(
            QueryNode::iri("http://ex.org/a"),
            QueryNode::iri(P),
            QueryNode::variable("o"),
        )]);
        let solutions = reasoner.evaluate(&query, &graph);
        assert_eq!(solutions.len(), 2);

        let objects: HashSet<Term> = solutions.iter().map(|b| b["o"].clone()).collect();
        assert!(objects.contains(&Term::iri("http://ex.org/b")));
        assert!(objects.contains(&Term::iri("http://ex.org/c")));
    }

    #[test]
    fn evaluate_with_no_matches_is_empty() {
        let graph = Graph::new();
        let query = BasicGraphPattern::new(vec![TriplePattern::new(
            QueryNode::variable("x"),
            QueryNode::iri(P),
            QueryNode::variable("y"),
        )]);
        assert!(StaticReasoner::new().evaluate(&query, &graph).is_empty());
    }
}

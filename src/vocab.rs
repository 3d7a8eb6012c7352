//! Vocabulary constants
//!
//! Terms of the predicate-statistics ontology used by the remote stats store,
//! plus the handful of core RDF/OWL terms the engine needs.

/// Namespace of the predicate-statistics vocabulary.
pub const PREDICATE_STATS_NS: &str = "http://biordf.net/cardioSHARE/predicatestats.owl#";

/// Links a predicate to one of its selectivity samples.
pub const SELECTIVITY_SAMPLE: &str =
    "http://biordf.net/cardioSHARE/predicatestats.owl#selectivitySample";

/// Links a predicate to one of its response-time samples.
pub const TIME_SAMPLE: &str = "http://biordf.net/cardioSHARE/predicatestats.owl#timeSample";

/// Flag on a sample node: true for forward resolution, false for reverse.
pub const DIRECTION_IS_FORWARD: &str =
    "http://biordf.net/cardioSHARE/predicatestats.owl#directionIsForward";

/// The selectivity value of a selectivity sample.
pub const SELECTIVITY: &str = "http://biordf.net/cardioSHARE/predicatestats.owl#selectivity";

/// The response-time value (milliseconds) of a time sample.
pub const TIME: &str = "http://biordf.net/cardioSHARE/predicatestats.owl#time";

/// Aggregate: average selectivity of a predicate in the forward direction.
pub const AVG_FORWARD_SELECTIVITY: &str =
    "http://biordf.net/cardioSHARE/predicatestats.owl#avgForwardSelectivity";

/// Aggregate: average selectivity of a predicate in the reverse direction.
pub const AVG_REVERSE_SELECTIVITY: &str =
    "http://biordf.net/cardioSHARE/predicatestats.owl#avgReverseSelectivity";

/// Aggregate: average response time of a predicate in the forward direction.
pub const AVG_FORWARD_TIME: &str =
    "http://biordf.net/cardioSHARE/predicatestats.owl#avgForwardTime";

/// Aggregate: average response time of a predicate in the reverse direction.
pub const AVG_REVERSE_TIME: &str =
    "http://biordf.net/cardioSHARE/predicatestats.owl#avgReverseTime";

/// Timestamp of a sample or of the last aggregate recompute.
pub const TIMESTAMP: &str = "http://biordf.net/cardioSHARE/predicatestats.owl#timestamp";

/// Sentinel meaning "no sample / unconstrained". Planners must treat this as
/// worst-case fan-out, never as zero cost.
pub const NO_STATS_AVAILABLE: i64 = -1;

/// rdf:type.
pub const RDF_TYPE: &str = "http://www.w3.org/1999/02/22-rdf-syntax-ns#type";

/// owl:Thing, used as the fallback type for otherwise untyped service inputs.
pub const OWL_THING: &str = "http://www.w3.org/2002/07/owl#Thing";

//! Property resolvability cache
//!
//! Deciding whether any registered service can resolve a predicate requires a
//! registry round trip, and equivalent properties always resolve to the same
//! services, so the answer is memoized for an entire
//! `owl:equivalentProperty` closure at once: once any member of a closure has
//! been looked up, every member carries the same cached value.
//!
//! Entries never expire. A registry that gains services for an
//! already-cached predicate will not be observed until [`clear`] is called;
//! deployments that reindex their registry do so explicitly.
//! The cache is also not safe against concurrent structural mutation of
//! equivalence-class membership; closures are expected to be stable for the
//! lifetime of the cache.
//!
//! [`clear`]: ResolvabilityCache::clear

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, trace};

use crate::error::Result;
use crate::model::NamedNode;
use crate::reasoner::Reasoner;
use crate::registry::ServiceRegistry;

/// Memoizes, per property-equivalence-class, whether any service resolves
/// that predicate.
#[derive(Debug)]
pub struct ResolvabilityCache {
    registry: Arc<dyn ServiceRegistry>,
    reasoner: Arc<dyn Reasoner>,
    /// property URI -> resolvable; all members of a closure agree.
    entries: Mutex<HashMap<String, bool>>,
}

impl ResolvabilityCache {
    pub fn new(registry: Arc<dyn ServiceRegistry>, reasoner: Arc<dyn Reasoner>) -> Self {
        ResolvabilityCache {
            registry,
            reasoner,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// True if any registered service can resolve the property.
    ///
    /// On a miss the registry is consulted and the result is written for the
    /// whole equivalence closure in one step, so members of a closure can
    /// never disagree.
    pub async fn is_resolvable(&self, property: &NamedNode) -> Result<bool> {
        let closure = self.reasoner.equivalent_properties(property);

        // the whole read-check-query-write is serialized per call so a
        // concurrent miss on an equivalent property cannot split the class
        let mut entries = self.entries.lock().await;

        for member in &closure {
            if let Some(&resolvable) = entries.get(member.as_str()) {
                trace!(property = property.as_str(), resolvable, "resolvability cache hit");
                return Ok(resolvable);
            }
        }

        let mut resolvable = false;
        for member in &closure {
            if !self
                .registry
                .find_services_by_predicate(member.as_str())
                .await?
                .is_empty()
            {
                resolvable = true;
                break;
            }
        }

        debug!(
            property = property.as_str(),
            members = closure.len(),
            resolvable,
            "caching resolvability for equivalence closure"
        );
        for member in &closure {
            entries.insert(member.as_str().to_string(), resolvable);
        }

        Ok(resolvable)
    }

    /// True if any of the given properties resolves; short-circuits on the
    /// first success.
    pub async fn is_any_resolvable<'a, I>(&self, properties: I) -> Result<bool>
    where
        I: IntoIterator<Item = &'a NamedNode>,
    {
        for property in properties {
            if self.is_resolvable(property).await? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Drop every cached entry.
    pub async fn clear(&self) {
        self.entries.lock().await.clear();
    }

    /// Number of cached property entries (not closures).
    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use crate::registry::ServiceRef;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const P: &str = "http://example.org/pred/p";
    const Q: &str = "http://example.org/pred/q";
    const R: &str = "http://example.org/pred/r";

    /// Registry that counts lookups.
    #[derive(Debug, Default)]
    struct CountingRegistry {
        resolvable: Vec<String>,
        lookups: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl ServiceRegistry for CountingRegistry {
        async fn find_services_by_predicate(&self, predicate: &str) -> Result<Vec<ServiceRef>> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            if self.resolvable.iter().any(|p| p == predicate) {
                Ok(vec![ServiceRef::web_service(
                    "http://example.org/services/s1",
                    "s1",
                    "http://example.org/services/s1/invoke",
                )])
            } else {
                Ok(vec![])
            }
        }

        async fn all_services(&self) -> Result<Vec<ServiceRef>> {
            Ok(vec![])
        }
    }

    fn cache_with(
        resolvable: &[&str],
        equivalences: &[(&str, &str)],
    ) -> (ResolvabilityCache, Arc<CountingRegistry>) {
        let registry = Arc::new(CountingRegistry {
            resolvable: resolvable.iter().map(|s| s.to_string()).collect(),
            lookups: AtomicUsize::new(0),
        });
        let mut reasoner = crate::reasoner::StaticReasoner::new();
        for (a, b) in equivalences {
            reasoner.declare_equivalent(*a, *b);
        }
        let cache = ResolvabilityCache::new(registry.clone(), Arc::new(reasoner));
        (cache, registry)
    }

    #[tokio::test]
    async fn closure_members_always_agree() {
        let (cache, _) = cache_with(&[Q], &[(P, Q)]);

        assert!(cache.is_resolvable(&NamedNode::new(P)).await.unwrap());
        assert!(cache.is_resolvable(&NamedNode::new(Q)).await.unwrap());
        assert_eq!(cache.len().await, 2);
    }

    #[tokio::test]
    async fn second_member_lookup_hits_the_cache() {
        let (cache, registry) = cache_with(&[P], &[(P, Q)]);

        assert!(cache.is_resolvable(&NamedNode::new(Q)).await.unwrap());
        let after_first = registry.lookups.load(Ordering::SeqCst);
        assert!(after_first >= 1);

        // both members now answered from the cache
        assert!(cache.is_resolvable(&NamedNode::new(P)).await.unwrap());
        assert!(cache.is_resolvable(&NamedNode::new(Q)).await.unwrap());
        assert_eq!(registry.lookups.load(Ordering::SeqCst), after_first);
    }

    #[tokio::test]
    async fn unresolvable_closure_is_cached_too() {
        let (cache, registry) = cache_with(&[], &[(P, Q)]);

        assert!(!cache.is_resolvable(&NamedNode::new(P)).await.unwrap());
        let after_first = registry.lookups.load(Ordering::SeqCst);
        assert!(!cache.is_resolvable(&NamedNode::new(Q)).await.unwrap());
        assert_eq!(registry.lookups.load(Ordering::SeqCst), after_first);
    }

    #[tokio::test]
    async fn any_resolvable_short_circuits() {
        let (cache, registry) = cache_with(&[P], &[]);

        let p = NamedNode::new(P);
        let r = NamedNode::new(R);
        assert!(cache.is_any_resolvable([&p, &r]).await.unwrap());
        // R was never looked up: P answered first
        assert_eq!(registry.lookups.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn clear_drops_entries() {
        let (cache, _) = cache_with(&[P], &[]);
        let p = NamedNode::new(P);
        assert!(cache.is_resolvable(&p).await.unwrap());
        assert!(!cache.is_empty().await);

        cache.clear().await;
        assert!(cache.is_empty().await);
    }
}

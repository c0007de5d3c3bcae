//! Key conventions and named invalidation recipes.
//!
//! Callers build keys through [`CacheKeys`] and, after committing a mutation,
//! run the matching recipe on [`Invalidator`]. Which mutation triggers which
//! recipe is the caller's business.
//!
//! ```text
//! test:7                       entity
//! test:7:questions             anything scoped under the entity
//! organization:3:test:list     list of tests in organization 3
//! stats:test:7                 aggregates for test 7
//! ```

use std::fmt::Display;

use crate::hybrid::HybridCache;
use crate::store::escape_glob;

/// An entity kind and id, e.g. `test` / `7`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityRef {
    pub kind: String,
    pub id: String,
}

impl EntityRef {
    pub fn new(kind: impl Into<String>, id: impl Display) -> Self {
        Self {
            kind: kind.into(),
            id: id.to_string(),
        }
    }

    pub fn organization(id: impl Display) -> Self {
        Self::new("organization", id)
    }

    pub fn test(id: impl Display) -> Self {
        Self::new("test", id)
    }
}

/// Cache key builders.
pub struct CacheKeys;

impl CacheKeys {
    /// `{kind}:{id}`
    pub fn entity(entity: &EntityRef) -> String {
        format!("{}:{}", entity.kind, entity.id)
    }

    /// `{kind}:{id}:{suffix}`
    pub fn scoped(entity: &EntityRef, suffix: &str) -> String {
        format!("{}:{}:{}", entity.kind, entity.id, suffix)
    }

    /// `{parent kind}:{parent id}:{kind}:list`
    pub fn list(parent: &EntityRef, kind: &str) -> String {
        format!("{}:{}:{}:list", parent.kind, parent.id, kind)
    }

    /// `stats:{kind}:{id}`
    pub fn stats(entity: &EntityRef) -> String {
        format!("stats:{}:{}", entity.kind, entity.id)
    }
}

/// Runs invalidation recipes against a [`HybridCache`]. Holds no state of its own.
#[derive(Clone)]
pub struct Invalidator {
    cache: HybridCache,
}

impl Invalidator {
    pub fn new(cache: HybridCache) -> Self {
        Self { cache }
    }

    /// Remove the entity's own entries (the entity key and everything scoped
    /// under it) and the list caches of its parent scope.
    ///
    /// Returns the number of keys removed.
    pub async fn invalidate_entity(&self, entity: &EntityRef, parent: Option<&EntityRef>) -> u64 {
        let mut removed = self.invalidate_tree(&CacheKeys::entity(entity)).await;
        if let Some(parent) = parent {
            let lists = format!("{}*", escape_glob(&CacheKeys::list(parent, &entity.kind)));
            removed += self.cache.del_pattern(&lists).await;
        }
        tracing::debug!(kind = %entity.kind, id = %entity.id, removed, "invalidated entity");
        removed
    }

    /// Remove aggregate entries keyed by the entity or by its parent scope.
    pub async fn invalidate_derived_stats(
        &self,
        entity: &EntityRef,
        parent: Option<&EntityRef>,
    ) -> u64 {
        let mut removed = self.invalidate_tree(&CacheKeys::stats(entity)).await;
        if let Some(parent) = parent {
            removed += self.invalidate_tree(&CacheKeys::stats(parent)).await;
        }
        tracing::debug!(kind = %entity.kind, id = %entity.id, removed, "invalidated derived stats");
        removed
    }

    /// Everything derived from a test: the test, its scoped entries (questions,
    /// attempts), the organization's test lists and both sets of statistics.
    pub async fn invalidate_test(&self, test_id: impl Display, org_id: impl Display) -> u64 {
        let test = EntityRef::test(test_id);
        let org = EntityRef::organization(org_id);
        self.invalidate_entity(&test, Some(&org)).await
            + self.invalidate_derived_stats(&test, Some(&org)).await
    }

    /// `base` itself plus every `base:*` key. `base*` would also catch
    /// `test:70` when invalidating `test:7`.
    async fn invalidate_tree(&self, base: &str) -> u64 {
        let base = escape_glob(base);
        self.cache.del_pattern(&base).await + self.cache.del_pattern(&format!("{base}:*")).await
    }
}

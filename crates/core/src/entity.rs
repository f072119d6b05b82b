//! Entity trait: identity plus the local cache key derived from it.

/// An entity the client reads from the server and keeps a local copy of.
pub trait Entity {
    /// Strongly-typed entity identifier.
    type Id: Clone + Eq + core::hash::Hash + core::fmt::Debug + core::fmt::Display;

    /// Namespace used for cache keys (`"item"`, `"session"`, ...).
    const KIND: &'static str;

    /// Returns the entity identifier.
    fn id(&self) -> &Self::Id;

    /// Cache key for an entity of this kind with the given id.
    fn key_for(id: &Self::Id) -> String {
        format!("{}:{}", Self::KIND, id)
    }

    /// Cache key for this entity.
    fn cache_key(&self) -> String {
        Self::key_for(self.id())
    }
}

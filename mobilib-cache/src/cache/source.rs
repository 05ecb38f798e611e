//! Caller-supplied collaborators of a cache master.
//!
//! The cache never owns object payloads beyond its memory tier. The caller's
//! local database is the durable copy and the server is the source of truth;
//! both are reached through [`CacheSource`].

use async_trait::async_trait;
use mobilib_core::SourceError;

/// Identity extraction plus access to the caller's database and server.
///
/// Ids passed to and returned from these methods are always origin ids;
/// namespacing is internal to the cache.
///
/// # Contract
///
/// - `object_id` must be stable and unique within the cached type.
/// - Fetches may return a subset of the requested ids (unknown ids are
///   silently dropped) and may return them in any order.
/// - No timeout is imposed by the cache. A fetch that never resolves holds
///   the cache master's serializer until it does.
#[async_trait]
pub trait CacheSource<T>: Send + Sync + 'static {
    fn object_id(&self, object: &T) -> String;

    /// Read locally stored copies.
    async fn fetch_from_database(&self, ids: &[String]) -> Result<Vec<T>, SourceError>;

    /// Persist objects freshly fetched from the server. Best effort.
    async fn store_to_database(&self, objects: &[T]) -> Result<(), SourceError>;

    async fn fetch_from_server(&self, ids: &[String]) -> Result<Vec<T>, SourceError>;
}

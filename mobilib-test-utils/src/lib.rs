//! Mobilib Test Utilities
//!
//! Shared test infrastructure for the Mobilib workspace:
//! - A scriptable [`MockSource`] standing in for the caller's database and server
//! - Proptest generators for ids and fixture objects
//! - Test fixtures for common scenarios
//! - Custom assertions for cache results

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use mobilib_cache::CacheSource;
use mobilib_core::SourceError;
use tokio::sync::Semaphore;

// Re-export core types for convenience
pub use mobilib_core::{CacheConfig, CacheError, CacheResult, ManualClock};

// ============================================================================
// FIXTURE OBJECT
// ============================================================================

/// The cached object used throughout the test suites.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct User {
    pub id: String,
    pub name: String,
    pub version: u32,
}

impl User {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            version: 1,
        }
    }

    /// Same id, bumped version. Handy for telling stale copies from fresh ones.
    pub fn revised(&self) -> Self {
        Self {
            version: self.version + 1,
            ..self.clone()
        }
    }
}

// ============================================================================
// MOCK SOURCE
// ============================================================================

/// One recorded collaborator call, with the ids it carried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceCall {
    FetchDatabase(Vec<String>),
    StoreDatabase(Vec<String>),
    FetchServer(Vec<String>),
}

#[derive(Debug, Default)]
struct MockState {
    database: BTreeMap<String, User>,
    server: BTreeMap<String, User>,
    fail_database: bool,
    fail_store: bool,
    fail_server: bool,
    calls: Vec<SourceCall>,
    server_gate: Option<Arc<Semaphore>>,
}

/// In-memory caller database and server with call recording.
///
/// Fetches return the known subset of the requested ids. Failures can be
/// injected per collaborator, and server fetches can be held open with
/// [`MockSource::hold_server`] to keep a cache master busy.
#[derive(Debug, Default)]
pub struct MockSource {
    state: Mutex<MockState>,
}

impl MockSource {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn with_database(self, users: impl IntoIterator<Item = User>) -> Self {
        for user in users {
            self.insert_database(user);
        }
        self
    }

    pub fn with_server(self, users: impl IntoIterator<Item = User>) -> Self {
        for user in users {
            self.insert_server(user);
        }
        self
    }

    pub fn insert_database(&self, user: User) {
        self.lock().database.insert(user.id.clone(), user);
    }

    pub fn insert_server(&self, user: User) {
        self.lock().server.insert(user.id.clone(), user);
    }

    pub fn database_get(&self, id: &str) -> Option<User> {
        self.lock().database.get(id).cloned()
    }

    pub fn database_len(&self) -> usize {
        self.lock().database.len()
    }

    pub fn set_database_failure(&self, fail: bool) {
        self.lock().fail_database = fail;
    }

    pub fn set_store_failure(&self, fail: bool) {
        self.lock().fail_store = fail;
    }

    pub fn set_server_failure(&self, fail: bool) {
        self.lock().fail_server = fail;
    }

    /// Make server fetches wait until a permit is added to the returned gate
    /// or [`MockSource::release_server`] is called.
    pub fn hold_server(&self) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        self.lock().server_gate = Some(Arc::clone(&gate));
        gate
    }

    /// Let every held and future server fetch through.
    pub fn release_server(&self) {
        if let Some(gate) = self.lock().server_gate.take() {
            gate.close();
        }
    }

    pub fn calls(&self) -> Vec<SourceCall> {
        self.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    pub fn database_fetches(&self) -> Vec<Vec<String>> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                SourceCall::FetchDatabase(ids) => Some(ids),
                _ => None,
            })
            .collect()
    }

    pub fn server_fetches(&self) -> Vec<Vec<String>> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                SourceCall::FetchServer(ids) => Some(ids),
                _ => None,
            })
            .collect()
    }

    pub fn stores(&self) -> Vec<Vec<String>> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                SourceCall::StoreDatabase(ids) => Some(ids),
                _ => None,
            })
            .collect()
    }
}

fn known(table: &BTreeMap<String, User>, ids: &[String]) -> Vec<User> {
    ids.iter().filter_map(|id| table.get(id).cloned()).collect()
}

#[async_trait]
impl CacheSource<User> for MockSource {
    fn object_id(&self, object: &User) -> String {
        object.id.clone()
    }

    async fn fetch_from_database(&self, ids: &[String]) -> Result<Vec<User>, SourceError> {
        let mut state = self.lock();
        state.calls.push(SourceCall::FetchDatabase(ids.to_vec()));
        if state.fail_database {
            return Err(SourceError::database("injected database failure"));
        }
        Ok(known(&state.database, ids))
    }

    async fn store_to_database(&self, objects: &[User]) -> Result<(), SourceError> {
        let mut state = self.lock();
        state.calls.push(SourceCall::StoreDatabase(
            objects.iter().map(|u| u.id.clone()).collect(),
        ));
        if state.fail_store {
            return Err(SourceError::database("injected store failure"));
        }
        for user in objects {
            state.database.insert(user.id.clone(), user.clone());
        }
        Ok(())
    }

    async fn fetch_from_server(&self, ids: &[String]) -> Result<Vec<User>, SourceError> {
        let gate = {
            let mut state = self.lock();
            state.calls.push(SourceCall::FetchServer(ids.to_vec()));
            state.server_gate.clone()
        };
        if let Some(gate) = gate {
            // Closed means released.
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        }

        let state = self.lock();
        if state.fail_server {
            return Err(SourceError::server("injected server failure"));
        }
        Ok(known(&state.server, ids))
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for ids and users.

    use super::*;
    use proptest::collection::btree_set;
    use proptest::prelude::*;

    /// Bare object ids: never contain the namespace separator.
    pub fn id_strategy() -> impl Strategy<Value = String> {
        "[A-Za-z0-9_-]{1,32}"
    }

    pub fn arb_user() -> impl Strategy<Value = User> {
        (id_strategy(), "[a-z]{1,12}", 1u32..100).prop_map(|(id, name, version)| User {
            id,
            name,
            version,
        })
    }

    /// Users with pairwise distinct ids.
    pub fn arb_users(max: usize) -> impl Strategy<Value = Vec<User>> {
        btree_set(id_strategy(), 0..=max).prop_map(|ids| {
            ids.into_iter()
                .map(|id| User::new(id.clone(), format!("user-{id}")))
                .collect()
        })
    }
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

pub mod fixtures {
    //! Pre-built fixtures for common cache scenarios.

    use super::*;
    use mobilib_cache::{CacheMaster, InMemoryExistenceIndex};
    use std::time::Duration;

    /// Epoch millis every fixture clock starts at.
    pub const START_MILLIS: i64 = 1_700_000_000_000;

    /// One-minute window, fallback off, explicit namespace.
    pub fn test_config() -> CacheConfig {
        CacheConfig::new()
            .with_duration(Duration::from_secs(60))
            .with_namespace("user")
            .with_batch_interval(Duration::from_millis(100))
    }

    pub fn users(ids: &[&str]) -> Vec<User> {
        ids.iter().map(|id| User::new(*id, format!("user-{id}"))).collect()
    }

    pub fn manual_clock() -> Arc<ManualClock> {
        Arc::new(ManualClock::at_millis(START_MILLIS))
    }

    /// Master over an in-memory index with a manual clock. Requires a runtime.
    pub fn master_with(
        source: MockSource,
        config: CacheConfig,
        clock: Arc<ManualClock>,
    ) -> CacheMaster<User, MockSource> {
        let index = Arc::new(InMemoryExistenceIndex::new());
        match CacheMaster::builder(source, index)
            .config(config)
            .clock(clock)
            .build()
        {
            Ok(master) => master,
            Err(e) => panic!("fixture master failed to build: {e}"),
        }
    }
}

// ============================================================================
// CUSTOM ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertions for cache results.

    use super::*;

    /// Assert the result holds exactly these ids, in this order.
    #[track_caller]
    pub fn assert_ids(result: &CacheResult<Vec<User>>, expected: &[&str]) {
        match result {
            Ok(users) => {
                let ids: Vec<&str> = users.iter().map(|u| u.id.as_str()).collect();
                assert_eq!(ids, expected, "Wrong ids in result");
            }
            Err(e) => panic!("Expected Ok with ids {:?}, got Err: {:?}", expected, e),
        }
    }

    /// Assert the result is an `Incomplete` error naming exactly these ids.
    #[track_caller]
    pub fn assert_incomplete<T: std::fmt::Debug>(result: &CacheResult<T>, expected: &[&str]) {
        match result {
            Err(CacheError::Incomplete { missing }) => {
                assert_eq!(missing, expected, "Wrong missing ids");
            }
            other => panic!("Expected Incomplete error, got: {:?}", other),
        }
    }

    #[track_caller]
    pub fn assert_source_error<T: std::fmt::Debug>(result: &CacheResult<T>) {
        match result {
            Err(CacheError::Source(_)) => {}
            other => panic!("Expected Source error, got: {:?}", other),
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

//! Live query registry: one [`Entry`] per registered query, mutated by diff and
//! value callbacks and read by the tick through point-in-time snapshots.

/// Per-node value cells.
pub mod live_value;

use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Weak},
};

use blackboard_client::{
    BlackboardClient, DataValue, DiffCallback, NodeIdentifier, QueryDiff, QueryRow, ValueCallback,
};
use chrono::{DateTime, Duration, Utc};
use indexmap::{IndexMap, IndexSet};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};
use uuid::Uuid;

pub use live_value::{LiveValue, LiveValueStore};

use crate::error::ComposerResult;

/// Key under which a function binding finds its query entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TrackingKey(Uuid);

impl TrackingKey {
    /// Fresh random key.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TrackingKey {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TrackingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// Live state of one registered query.
#[derive(Debug, Clone)]
pub struct Entry {
    /// Identifier assigned by the blackboard.
    pub query_id: String,
    /// Query text.
    pub query: String,
    /// Tracking key handed to the binding that registered the query.
    pub key: TrackingKey,
    /// Accumulated rows, without duplicates.
    pub rows: IndexSet<QueryRow>,
    /// One value cell per distinct first-column node.
    pub live_values: LiveValueStore,
}

impl Entry {
    fn new(query_id: String, query: &str, key: TrackingKey) -> Self {
        Self {
            query_id,
            query: query.to_owned(),
            key,
            rows: IndexSet::new(),
            live_values: LiveValueStore::default(),
        }
    }

    /// Applies a diff. Rows already present (or absent) are no-ops. Returns the number of changed rows.
    pub fn apply_diff(&mut self, diff: &QueryDiff) -> usize {
        let removed = diff
            .removed
            .iter()
            .filter(|row| self.rows.shift_remove(*row))
            .count();
        let added = diff
            .added
            .iter()
            .filter(|row| self.rows.insert((*row).clone()))
            .count();
        removed + added
    }

    /// Distinct addressable first-column nodes, in row order.
    #[must_use]
    pub fn first_column_nodes(&self) -> IndexSet<NodeIdentifier> {
        self.rows
            .iter()
            .filter_map(|row| row.get(0))
            .filter(|node| node.is_addressable())
            .cloned()
            .collect()
    }

    fn unbound_nodes(&self) -> Vec<NodeIdentifier> {
        self.first_column_nodes()
            .into_iter()
            .filter(|node| !self.live_values.contains(node))
            .collect()
    }

    /// First fresh value among nodes the query still matches.
    #[must_use]
    pub fn first_value(&self, now: DateTime<Utc>, window: Duration) -> Option<&DataValue> {
        self.live_values
            .first_fresh(&self.first_column_nodes(), now, window)
    }

    /// Most recent value among nodes the query still matches, regardless of age.
    #[must_use]
    pub fn latest_value(&self) -> Option<&DataValue> {
        self.live_values.latest(&self.first_column_nodes())
    }
}

/// Point-in-time copy of the registry.
#[derive(Debug, Clone, Default)]
pub struct RegistrySnapshot {
    entries: IndexMap<String, Entry>,
    keys: HashMap<TrackingKey, String>,
}

impl RegistrySnapshot {
    /// Entry registered under a tracking key.
    #[must_use]
    pub fn entry(&self, key: TrackingKey) -> Option<&Entry> {
        self.keys.get(&key).and_then(|id| self.entries.get(id))
    }

    /// All entries in registration order.
    pub fn entries(&self) -> impl Iterator<Item = &Entry> {
        self.entries.values()
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Default)]
struct RegistryState {
    entries: IndexMap<String, Entry>,
    keys: HashMap<TrackingKey, String>,
    /// Registrations waiting on `register_query`.
    registering: usize,
    /// Diffs delivered before their entry existed.
    early_diffs: HashMap<String, Vec<QueryDiff>>,
}

struct RegistryInner {
    client: Arc<dyn BlackboardClient>,
    state: Mutex<RegistryState>,
}

/// Thread-safe query registry shared between the tick and blackboard callbacks.
///
/// Every mutation, including single value pushes, goes through the same lock.
/// Blackboard calls are made with the lock released.
#[derive(Clone)]
pub struct QueryRegistry {
    inner: Arc<RegistryInner>,
}

impl fmt::Debug for QueryRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryRegistry")
            .field("entries", &self.inner.state.lock().entries.len())
            .finish()
    }
}

impl QueryRegistry {
    /// Creates an empty registry over a blackboard client.
    #[must_use]
    pub fn new(client: Arc<dyn BlackboardClient>) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                client,
                state: Mutex::new(RegistryState::default()),
            }),
        }
    }

    /// Blackboard client used by the registry.
    #[must_use]
    pub fn client(&self) -> Arc<dyn BlackboardClient> {
        Arc::clone(&self.inner.client)
    }

    fn downgrade(&self) -> Weak<RegistryInner> {
        Arc::downgrade(&self.inner)
    }

    fn upgrade(weak: &Weak<RegistryInner>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }

    /// Registers a live query and returns the tracking key of its entry.
    ///
    /// Diffs the blackboard delivers before `register_query` returns are held
    /// and replayed after the initial result.
    pub fn register(&self, query: &str) -> ComposerResult<TrackingKey> {
        let key = TrackingKey::new();
        let weak = self.downgrade();
        let on_diff: DiffCallback = Arc::new(move |query_id: &str, diff: &QueryDiff| {
            if let Some(registry) = Self::upgrade(&weak) {
                registry.apply_diff(query_id, diff);
            }
        });
        self.inner.state.lock().registering += 1;
        let registered = self.inner.client.register_query(query, on_diff);
        let (query_id, initial, early) = {
            let mut state = self.inner.state.lock();
            state.registering = state.registering.saturating_sub(1);
            let taken = registered.map(|(query_id, initial)| {
                let early = state.early_diffs.remove(&query_id).unwrap_or_default();
                (query_id, initial, early)
            });
            if state.registering == 0 {
                state.early_diffs.clear();
            }
            let (query_id, initial, early) = taken?;
            state
                .entries
                .insert(query_id.clone(), Entry::new(query_id.clone(), query, key));
            state.keys.insert(key, query_id.clone());
            (query_id, initial, early)
        };
        debug!(%key, query_id = %query_id, replayed = early.len(), "query registered");
        self.apply_diff(&query_id, &initial);
        for diff in &early {
            self.apply_diff(&query_id, diff);
        }
        Ok(key)
    }

    /// Applies a diff to a registered entry and subscribes newly referenced
    /// nodes. While a registration is in flight, diffs for unknown queries are
    /// held for it; otherwise they are ignored.
    #[instrument(skip(self, diff), fields(added = diff.added.len(), removed = diff.removed.len()))]
    pub fn apply_diff(&self, query_id: &str, diff: &QueryDiff) -> bool {
        let changed = {
            let mut state = self.inner.state.lock();
            if !state.entries.contains_key(query_id) {
                if state.registering == 0 {
                    warn!(query_id, "diff for unknown query ignored");
                    return false;
                }
                debug!(query_id, "diff held until registration completes");
                state
                    .early_diffs
                    .entry(query_id.to_owned())
                    .or_default()
                    .push(diff.clone());
                return true;
            }
            let Some(entry) = state.entries.get_mut(query_id) else {
                return false;
            };
            entry.apply_diff(diff)
        };
        if changed > 0 {
            debug!(query_id, changed, "diff applied");
        }
        self.ensure_subscriptions(query_id);
        true
    }

    /// Subscribes every first-column node of the entry that has no cell yet.
    /// A failed subscription unbinds its cell so the node is retried on the
    /// next diff. Returns the number of new subscriptions.
    pub fn ensure_subscriptions(&self, query_id: &str) -> usize {
        let pending = {
            let mut state = self.inner.state.lock();
            let Some(entry) = state.entries.get_mut(query_id) else {
                return 0;
            };
            let nodes = entry.unbound_nodes();
            for node in &nodes {
                entry.live_values.bind(node.clone());
            }
            nodes
        };
        let mut subscribed = 0;
        for node in pending {
            match self
                .inner
                .client
                .subscribe(query_id, &node, self.value_callback(query_id))
            {
                Ok(()) => subscribed += 1,
                Err(err) => {
                    warn!(query_id, node = %node, error = %err, "subscription failed");
                    if let Some(entry) = self.inner.state.lock().entries.get_mut(query_id) {
                        entry.live_values.unbind(&node);
                    }
                }
            }
        }
        subscribed
    }

    fn value_callback(&self, query_id: &str) -> ValueCallback {
        let weak = self.downgrade();
        let query_id = query_id.to_owned();
        Arc::new(
            move |node: &NodeIdentifier, value: &DataValue, at: DateTime<Utc>| {
                if let Some(registry) = Self::upgrade(&weak) {
                    registry.record_value(&query_id, node, value.clone(), at);
                }
            },
        )
    }

    /// Stores a pushed value in the cell of `node`.
    pub fn record_value(
        &self,
        query_id: &str,
        node: &NodeIdentifier,
        value: DataValue,
        at: DateTime<Utc>,
    ) -> bool {
        let mut state = self.inner.state.lock();
        state
            .entries
            .get_mut(query_id)
            .is_some_and(|entry| entry.live_values.record(node, value, at))
    }

    /// Copy of the entry registered under `key`.
    #[must_use]
    pub fn entry(&self, key: TrackingKey) -> Option<Entry> {
        let state = self.inner.state.lock();
        state
            .keys
            .get(&key)
            .and_then(|id| state.entries.get(id))
            .cloned()
    }

    /// Point-in-time copy of every entry.
    #[must_use]
    pub fn snapshot(&self) -> RegistrySnapshot {
        let state = self.inner.state.lock();
        RegistrySnapshot {
            entries: state.entries.clone(),
            keys: state.keys.clone(),
        }
    }

    /// Number of registered queries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.state.lock().entries.len()
    }

    /// True when nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use blackboard_client::MemoryBlackboard;
    use proptest::prelude::*;

    fn node(id: &str) -> NodeIdentifier {
        NodeIdentifier::new("ns", id)
    }

    fn row(ids: &[&str]) -> QueryRow {
        QueryRow::new(ids.iter().map(|id| node(id)).collect())
    }

    fn setup() -> (MemoryBlackboard, QueryRegistry) {
        let board = MemoryBlackboard::new(16);
        let registry = QueryRegistry::new(Arc::new(board.clone()));
        (board, registry)
    }

    #[test]
    fn registration_subscribes_first_column_once() {
        let (board, registry) = setup();
        board.push_rows("q", vec![row(&["a", "adv1", "F"])], Vec::new());
        let key = registry.register("q").unwrap();
        board.push_rows(
            "q",
            vec![row(&["a", "adv2", "F"]), row(&["b", "adv1", "F"])],
            Vec::new(),
        );
        let entry = registry.entry(key).unwrap();
        assert_eq!(entry.rows.len(), 3);
        assert_eq!(entry.live_values.len(), 2);
        assert_eq!(board.subscription_count(&node("a")), 1);
        assert_eq!(board.subscription_count(&node("b")), 1);
    }

    #[test]
    fn pushed_values_land_in_their_own_cell() {
        let (board, registry) = setup();
        board.push_rows("q", vec![row(&["a"]), row(&["b"])], Vec::new());
        let key = registry.register("q").unwrap();
        let now = Utc::now();
        board.set_value(&node("b"), DataValue::Number(7.0), now);
        let entry = registry.entry(key).unwrap();
        assert!(entry.live_values.get(&node("a")).unwrap().value.is_none());
        assert_eq!(
            entry.live_values.fresh(&node("b"), now, Duration::seconds(1)),
            Some(&DataValue::Number(7.0))
        );
    }

    #[test]
    fn failed_subscription_is_retried_on_next_diff() {
        let (board, registry) = setup();
        board.fail_subscriptions(&node("a"), true);
        board.push_rows("q", vec![row(&["a"]), row(&["b"])], Vec::new());
        let key = registry.register("q").unwrap();
        let entry = registry.entry(key).unwrap();
        assert!(!entry.live_values.contains(&node("a")));
        assert!(entry.live_values.contains(&node("b")));

        board.fail_subscriptions(&node("a"), false);
        board.push_rows("q", vec![row(&["a"])], Vec::new());
        let entry = registry.entry(key).unwrap();
        assert!(entry.live_values.contains(&node("a")));
        assert_eq!(board.subscription_count(&node("a")), 1);
    }

    #[test]
    fn unknown_query_diff_is_ignored() {
        let (_, registry) = setup();
        assert!(!registry.apply_diff("missing", &QueryDiff::added(vec![row(&["a"])])));
        assert!(registry.is_empty());
    }

    #[test]
    fn snapshot_is_isolated_from_later_diffs() {
        let (board, registry) = setup();
        let key = registry.register("q").unwrap();
        let snapshot = registry.snapshot();
        board.push_rows("q", vec![row(&["a"])], Vec::new());
        assert!(snapshot.entry(key).unwrap().rows.is_empty());
        assert_eq!(registry.entry(key).unwrap().rows.len(), 1);
    }

    /// Client whose registration delivers a diff before returning, as a
    /// transport pushing from another thread may.
    struct EagerClient {
        board: MemoryBlackboard,
        early: QueryDiff,
    }

    impl BlackboardClient for EagerClient {
        fn register_query(
            &self,
            query: &str,
            on_diff: DiffCallback,
        ) -> Result<(String, QueryDiff), blackboard_client::BlackboardError> {
            let (query_id, initial) = self.board.register_query(query, Arc::clone(&on_diff))?;
            on_diff(&query_id, &self.early);
            Ok((query_id, initial))
        }

        fn query_result(
            &self,
            query: &str,
        ) -> Result<Option<blackboard_client::QueryResult>, blackboard_client::BlackboardError> {
            self.board.query_result(query)
        }

        fn inject(
            &self,
            manifest: &blackboard_client::Manifest,
        ) -> Result<blackboard_client::InjectionResult, blackboard_client::BlackboardError> {
            self.board.inject(manifest)
        }

        fn subscribe(
            &self,
            query_id: &str,
            node: &NodeIdentifier,
            on_change: ValueCallback,
        ) -> Result<(), blackboard_client::BlackboardError> {
            self.board.subscribe(query_id, node, on_change)
        }

        fn update_values(
            &self,
            updates: &[blackboard_client::ValueUpdate],
        ) -> Result<bool, blackboard_client::BlackboardError> {
            self.board.update_values(updates)
        }
    }

    #[test]
    fn diff_delivered_during_registration_is_kept() {
        let board = MemoryBlackboard::new(16);
        let client = EagerClient {
            board: board.clone(),
            early: QueryDiff::added(vec![row(&["a", "adv1", "F"])]),
        };
        let registry = QueryRegistry::new(Arc::new(client));
        let key = registry.register("q").unwrap();
        let entry = registry.entry(key).unwrap();
        assert_eq!(entry.rows.len(), 1);
        assert!(entry.live_values.contains(&node("a")));
        assert_eq!(board.subscription_count(&node("a")), 1);

        assert!(!registry.apply_diff("elsewhere", &QueryDiff::added(vec![row(&["b"])])));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn removed_rows_stop_feeding_entry_values() {
        let (board, registry) = setup();
        board.push_rows("q", vec![row(&["x"])], Vec::new());
        let key = registry.register("q").unwrap();
        let now = Utc::now();
        board.set_value(&node("x"), DataValue::Number(99.0), now);
        board.push_rows("q", vec![row(&["y"])], vec![row(&["x"])]);

        let entry = registry.entry(key).unwrap();
        assert_eq!(entry.rows.len(), 1);
        assert_eq!(entry.first_value(now, Duration::seconds(5)), None);
        assert_eq!(entry.latest_value(), None);

        board.set_value(&node("y"), DataValue::Number(3.0), now);
        let entry = registry.entry(key).unwrap();
        assert_eq!(
            entry.first_value(now, Duration::seconds(5)),
            Some(&DataValue::Number(3.0))
        );
        assert_eq!(entry.latest_value(), Some(&DataValue::Number(3.0)));
    }

    proptest! {
        #[test]
        fn reapplying_a_diff_is_idempotent(ids in proptest::collection::vec(0u8..6, 0..12)) {
            let (_, registry) = setup();
            let key = registry.register("q").unwrap();
            let query_id = registry.entry(key).unwrap().query_id;
            let rows: Vec<QueryRow> = ids
                .iter()
                .map(|id| {
                    let name = format!("n{id}");
                    row(&[name.as_str(), "adv", "F"])
                })
                .collect();
            let diff = QueryDiff::added(rows);
            registry.apply_diff(&query_id, &diff);
            let once = registry.entry(key).unwrap();
            registry.apply_diff(&query_id, &diff);
            let twice = registry.entry(key).unwrap();
            prop_assert_eq!(once.rows.len(), twice.rows.len());
            prop_assert_eq!(once.live_values.len(), twice.live_values.len());
            let distinct: IndexSet<u8> = ids.into_iter().collect();
            prop_assert_eq!(twice.live_values.len(), distinct.len());
        }
    }
}

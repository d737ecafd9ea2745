use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::Arc,
};

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use parking_lot::Mutex;
use tokio::sync::broadcast;

use crate::{
    BlackboardClient, BlackboardError, DataValue, DiffCallback, InjectionResult, Manifest,
    NodeIdentifier, ProvidedVariable, QueryDiff, QueryResult, QueryRow, ValueCallback,
    ValueUpdate,
};

const PROVISION_NAMESPACE: &str = "composer";

/// In-memory blackboard: rows are pushed per query text, values per node, and
/// every write is fanned out through a broadcast channel with a bounded backlog.
#[derive(Clone)]
pub struct MemoryBlackboard {
    state: Arc<Mutex<MemoryState>>,
    sender: broadcast::Sender<ValueUpdate>,
    backlog: Arc<Mutex<VecDeque<ValueUpdate>>>,
    capacity: usize,
}

#[derive(Default)]
struct MemoryState {
    next_query: u64,
    rows: HashMap<String, Vec<QueryRow>>,
    listeners: IndexMap<String, Listener>,
    results: HashMap<String, QueryResult>,
    values: HashMap<NodeIdentifier, (DataValue, DateTime<Utc>)>,
    subscribers: HashMap<NodeIdentifier, Vec<ValueCallback>>,
    failing_nodes: HashSet<NodeIdentifier>,
    reject_injection: bool,
    reject_writes: bool,
}

struct Listener {
    query: String,
    callback: DiffCallback,
}

impl std::fmt::Debug for MemoryBlackboard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("MemoryBlackboard")
            .field("queries", &state.listeners.len())
            .field("values", &state.values.len())
            .field("capacity", &self.capacity)
            .finish()
    }
}

impl MemoryBlackboard {
    /// Creates a blackboard retaining up to `capacity` recent writes.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (sender, _) = broadcast::channel(capacity);
        Self {
            state: Arc::new(Mutex::new(MemoryState::default())),
            sender,
            backlog: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            capacity,
        }
    }

    /// Adds and removes rows for a query text and notifies every registration of it.
    pub fn push_rows(&self, query: &str, added: Vec<QueryRow>, removed: Vec<QueryRow>) {
        let diff = QueryDiff { added, removed };
        let callbacks: Vec<(String, DiffCallback)> = {
            let mut state = self.state.lock();
            let rows = state.rows.entry(query.to_owned()).or_default();
            rows.retain(|row| !diff.removed.contains(row));
            for row in &diff.added {
                if !rows.contains(row) {
                    rows.push(row.clone());
                }
            }
            state
                .listeners
                .iter()
                .filter(|(_, listener)| listener.query == query)
                .map(|(id, listener)| (id.clone(), Arc::clone(&listener.callback)))
                .collect()
        };
        for (id, callback) in callbacks {
            callback(&id, &diff);
        }
    }

    /// Sets the one-shot result returned for a query text.
    pub fn set_result(&self, query: &str, result: QueryResult) {
        self.state.lock().results.insert(query.to_owned(), result);
    }

    /// Stores a value and pushes it to the node's subscribers.
    pub fn set_value(&self, node: &NodeIdentifier, value: DataValue, at: DateTime<Utc>) {
        let callbacks = {
            let mut state = self.state.lock();
            state.values.insert(node.clone(), (value.clone(), at));
            state.subscribers.get(node).cloned().unwrap_or_default()
        };
        for callback in callbacks {
            callback(node, &value, at);
        }
    }

    /// Last value stored for a node, written or pushed.
    #[must_use]
    pub fn value(&self, node: &NodeIdentifier) -> Option<DataValue> {
        self.state.lock().values.get(node).map(|(value, _)| value.clone())
    }

    /// Makes subscriptions to `node` fail (`true`) or succeed again (`false`).
    pub fn fail_subscriptions(&self, node: &NodeIdentifier, failing: bool) {
        let mut state = self.state.lock();
        if failing {
            state.failing_nodes.insert(node.clone());
        } else {
            state.failing_nodes.remove(node);
        }
    }

    /// Makes manifest injection fail.
    pub fn reject_injection(&self, reject: bool) {
        self.state.lock().reject_injection = reject;
    }

    /// Makes value writes return `false`.
    pub fn reject_writes(&self, reject: bool) {
        self.state.lock().reject_writes = reject;
    }

    /// Number of subscriptions held for a node.
    #[must_use]
    pub fn subscription_count(&self, node: &NodeIdentifier) -> usize {
        self.state.lock().subscribers.get(node).map_or(0, Vec::len)
    }

    /// Recent writes, oldest first.
    #[must_use]
    pub fn written(&self) -> Vec<ValueUpdate> {
        self.backlog.lock().iter().cloned().collect()
    }

    /// Stream of subsequent writes.
    #[must_use]
    pub fn watch_writes(&self) -> broadcast::Receiver<ValueUpdate> {
        self.sender.subscribe()
    }
}

impl BlackboardClient for MemoryBlackboard {
    fn register_query(
        &self,
        query: &str,
        on_diff: DiffCallback,
    ) -> Result<(String, QueryDiff), BlackboardError> {
        if query.trim().is_empty() {
            return Err(BlackboardError::QueryRejected("empty query".into()));
        }
        let mut state = self.state.lock();
        state.next_query += 1;
        let id = format!("q{}", state.next_query);
        state.listeners.insert(
            id.clone(),
            Listener {
                query: query.to_owned(),
                callback: on_diff,
            },
        );
        let initial = state.rows.get(query).cloned().unwrap_or_default();
        Ok((id, QueryDiff::added(initial)))
    }

    fn query_result(&self, query: &str) -> Result<Option<QueryResult>, BlackboardError> {
        Ok(self
            .state
            .lock()
            .results
            .get(query)
            .filter(|result| !result.is_empty())
            .cloned())
    }

    fn inject(&self, manifest: &Manifest) -> Result<InjectionResult, BlackboardError> {
        if self.state.lock().reject_injection {
            return Err(BlackboardError::InjectionFailed(manifest.name.clone()));
        }
        let provided = manifest
            .variables
            .iter()
            .map(|variable| ProvidedVariable {
                variable: variable.clone(),
                node: NodeIdentifier::new(
                    PROVISION_NAMESPACE,
                    format!("{}.{}", manifest.name, variable.trim_start_matches('?')),
                ),
            })
            .collect();
        Ok(InjectionResult {
            success: true,
            provided,
        })
    }

    fn subscribe(
        &self,
        _query_id: &str,
        node: &NodeIdentifier,
        on_change: ValueCallback,
    ) -> Result<(), BlackboardError> {
        let current = {
            let mut state = self.state.lock();
            if state.failing_nodes.contains(node) {
                return Err(BlackboardError::SubscriptionFailed(node.to_string()));
            }
            state
                .subscribers
                .entry(node.clone())
                .or_default()
                .push(Arc::clone(&on_change));
            state.values.get(node).cloned()
        };
        if let Some((value, at)) = current {
            on_change(node, &value, at);
        }
        Ok(())
    }

    fn update_values(&self, updates: &[ValueUpdate]) -> Result<bool, BlackboardError> {
        {
            let mut state = self.state.lock();
            if state.reject_writes {
                return Ok(false);
            }
            for update in updates {
                state
                    .values
                    .insert(update.node.clone(), (update.value.clone(), update.timestamp));
            }
        }
        for update in updates {
            {
                let mut backlog = self.backlog.lock();
                backlog.push_back(update.clone());
                if backlog.len() > self.capacity {
                    backlog.pop_front();
                }
            }
            let _ = self.sender.send(update.clone());
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: &str) -> NodeIdentifier {
        NodeIdentifier::new("ns", id)
    }

    #[test]
    fn registration_replays_existing_rows_and_forwards_diffs() {
        let board = MemoryBlackboard::new(8);
        board.push_rows("q", vec![QueryRow::new(vec![node("a")])], Vec::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let (id, initial) = board
            .register_query(
                "q",
                Arc::new(move |_: &str, diff: &QueryDiff| sink.lock().push(diff.clone())),
            )
            .unwrap();
        assert_eq!(id, "q1");
        assert_eq!(initial.added.len(), 1);

        board.push_rows(
            "q",
            vec![QueryRow::new(vec![node("b")])],
            vec![QueryRow::new(vec![node("a")])],
        );
        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].removed, vec![QueryRow::new(vec![node("a")])]);
    }

    #[test]
    fn subscribe_delivers_current_value() {
        let board = MemoryBlackboard::new(8);
        board.set_value(&node("a"), DataValue::Number(4.0), Utc::now());
        let seen = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&seen);
        board
            .subscribe(
                "q1",
                &node("a"),
                Arc::new(move |_: &NodeIdentifier, value: &DataValue, _: DateTime<Utc>| {
                    *sink.lock() = value.as_f64();
                }),
            )
            .unwrap();
        assert_eq!(*seen.lock(), Some(4.0));

        board.fail_subscriptions(&node("b"), true);
        let ignore: ValueCallback = Arc::new(|_: &NodeIdentifier, _: &DataValue, _| {});
        assert!(board.subscribe("q1", &node("b"), ignore).is_err());
    }

    #[tokio::test]
    async fn writes_reach_backlog_and_watchers() {
        let board = MemoryBlackboard::new(2);
        let mut rx = board.watch_writes();
        let first = ValueUpdate {
            node: node("out"),
            value: DataValue::Number(-1.0),
            timestamp: Utc::now(),
        };
        assert!(board.update_values(&[first]).unwrap());
        assert_eq!(rx.recv().await.unwrap().value, DataValue::Number(-1.0));

        let updates: Vec<ValueUpdate> = (0..3)
            .map(|i| ValueUpdate {
                node: node("out"),
                value: DataValue::Number(f64::from(i)),
                timestamp: Utc::now(),
            })
            .collect();
        assert!(board.update_values(&updates).unwrap());
        let written = board.written();
        assert_eq!(written.len(), 2);
        assert_eq!(board.value(&node("out")), Some(DataValue::Number(2.0)));

        board.reject_writes(true);
        assert!(!board.update_values(&updates).unwrap());
    }

    #[test]
    fn injection_provisions_namespaced_nodes() {
        let board = MemoryBlackboard::new(4);
        let result = board
            .inject(&Manifest {
                name: "flowrate".into(),
                provider: "composer".into(),
                variables: vec!["?sp".into()],
            })
            .unwrap();
        assert_eq!(
            result.placeholder().unwrap().first_node(),
            Some(&NodeIdentifier::new("composer", "flowrate.sp"))
        );
        board.reject_injection(true);
        assert!(board.inject(&Manifest::default()).is_err());
    }
}

use blackboard_client::{DataValue, NodeIdentifier};
use chrono::{DateTime, Duration, Utc};
use indexmap::{IndexMap, IndexSet};

/// Last value pushed for one subscribed node.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LiveValue {
    /// Pushed value, `None` until the first push.
    pub value: Option<DataValue>,
    /// Source timestamp of the pushed value.
    pub updated_at: Option<DateTime<Utc>>,
}

impl LiveValue {
    /// Value if it was pushed no longer than `window` before `now`.
    #[must_use]
    pub fn fresh(&self, now: DateTime<Utc>, window: Duration) -> Option<&DataValue> {
        let at = self.updated_at?;
        if now - at > window {
            return None;
        }
        self.value.as_ref()
    }
}

/// Value cells keyed by node, one cell per distinct node.
#[derive(Debug, Clone, Default)]
pub struct LiveValueStore {
    cells: IndexMap<NodeIdentifier, LiveValue>,
}

impl LiveValueStore {
    /// Binds an empty cell. Returns `false` when the node already had one.
    pub fn bind(&mut self, node: NodeIdentifier) -> bool {
        if self.cells.contains_key(&node) {
            return false;
        }
        self.cells.insert(node, LiveValue::default());
        true
    }

    /// Drops the cell of a node.
    pub fn unbind(&mut self, node: &NodeIdentifier) -> bool {
        self.cells.shift_remove(node).is_some()
    }

    /// Whether the node has a cell.
    #[must_use]
    pub fn contains(&self, node: &NodeIdentifier) -> bool {
        self.cells.contains_key(node)
    }

    /// Stores a pushed value in the node's own cell. Pushes for unbound nodes
    /// and pushes older than the stored one are ignored.
    pub fn record(&mut self, node: &NodeIdentifier, value: DataValue, at: DateTime<Utc>) -> bool {
        let Some(cell) = self.cells.get_mut(node) else {
            return false;
        };
        if cell.updated_at.is_some_and(|current| at < current) {
            return false;
        }
        cell.value = Some(value);
        cell.updated_at = Some(at);
        true
    }

    /// Cell of a node.
    #[must_use]
    pub fn get(&self, node: &NodeIdentifier) -> Option<&LiveValue> {
        self.cells.get(node)
    }

    /// Fresh value of a node.
    #[must_use]
    pub fn fresh(
        &self,
        node: &NodeIdentifier,
        now: DateTime<Utc>,
        window: Duration,
    ) -> Option<&DataValue> {
        self.cells.get(node)?.fresh(now, window)
    }

    /// First fresh value among `nodes`, in their order.
    #[must_use]
    pub fn first_fresh(
        &self,
        nodes: &IndexSet<NodeIdentifier>,
        now: DateTime<Utc>,
        window: Duration,
    ) -> Option<&DataValue> {
        nodes.iter().find_map(|node| self.fresh(node, now, window))
    }

    /// Most recently pushed value among `nodes`, regardless of age.
    #[must_use]
    pub fn latest(&self, nodes: &IndexSet<NodeIdentifier>) -> Option<&DataValue> {
        nodes
            .iter()
            .filter_map(|node| self.cells.get(node))
            .filter(|cell| cell.value.is_some())
            .max_by_key(|cell| cell.updated_at)
            .and_then(|cell| cell.value.as_ref())
    }

    /// Cells in binding order.
    pub fn iter(&self) -> impl Iterator<Item = (&NodeIdentifier, &LiveValue)> {
        self.cells.iter()
    }

    /// Number of cells.
    #[must_use]
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    /// True when no cell is bound.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }
}

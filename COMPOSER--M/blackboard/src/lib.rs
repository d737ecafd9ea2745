#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    missing_docs,
    rust_2018_idioms
)]

//! Blackboard client abstractions: semantic query registration, live value
//! subscriptions, manifest injection and value write-back.

/// In-memory blackboard used for local runs and tests.
pub mod memory;

use std::{fmt, sync::Arc};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use memory::MemoryBlackboard;

/// Errors raised by a blackboard transport.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BlackboardError {
    /// The transport is not connected.
    #[error("blackboard disconnected")]
    Disconnected,
    /// The query was refused by the query engine.
    #[error("query rejected: {0}")]
    QueryRejected(String),
    /// A live value subscription could not be established.
    #[error("subscription failed: {0}")]
    SubscriptionFailed(String),
    /// A manifest could not be injected.
    #[error("manifest injection failed: {0}")]
    InjectionFailed(String),
    /// A value write was refused.
    #[error("write rejected: {0}")]
    WriteRejected(String),
}

/// Address of one data point on the blackboard.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeIdentifier {
    /// Namespace of the data point.
    pub namespace: String,
    /// Identifier inside the namespace.
    pub id: String,
}

impl NodeIdentifier {
    /// Builds an identifier.
    #[must_use]
    pub fn new(namespace: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            id: id.into(),
        }
    }

    /// True when both parts are non-empty.
    #[must_use]
    pub fn is_addressable(&self) -> bool {
        !self.namespace.is_empty() && !self.id.is_empty()
    }
}

impl fmt::Display for NodeIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.namespace, self.id)
    }
}

/// Value carried by a data point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DataValue {
    /// Numeric scalar.
    Number(f64),
    /// Boolean flag.
    Flag(bool),
    /// Text, typically a JSON-encoded object.
    Text(String),
}

impl DataValue {
    /// Numeric view of the value.
    #[must_use]
    pub const fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Number(value) => Some(*value),
            _ => None,
        }
    }

    /// Text view of the value.
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            _ => None,
        }
    }
}

impl fmt::Display for DataValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(value) => write!(f, "{value}"),
            Self::Flag(flag) => write!(f, "{flag}"),
            Self::Text(text) => f.write_str(text),
        }
    }
}

/// One result row: an ordered tuple of node references.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueryRow(pub Vec<NodeIdentifier>);

impl QueryRow {
    /// Builds a row from its columns.
    #[must_use]
    pub fn new(items: Vec<NodeIdentifier>) -> Self {
        Self(items)
    }

    /// Column accessor.
    #[must_use]
    pub fn get(&self, column: usize) -> Option<&NodeIdentifier> {
        self.0.get(column)
    }

    /// Number of columns.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True when the row has no column.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Resolved result of a semantic query.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryResult {
    /// Projected variable names.
    #[serde(default)]
    pub variables: Vec<String>,
    /// Matching rows.
    #[serde(default)]
    pub rows: Vec<QueryRow>,
}

impl QueryResult {
    /// First column of the first row, the conventional write target.
    #[must_use]
    pub fn first_node(&self) -> Option<&NodeIdentifier> {
        self.rows.first().and_then(|row| row.get(0))
    }

    /// True when no row matched.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Incremental change to the result set of a registered query.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryDiff {
    /// Rows that started matching.
    #[serde(default)]
    pub added: Vec<QueryRow>,
    /// Rows that stopped matching.
    #[serde(default)]
    pub removed: Vec<QueryRow>,
}

impl QueryDiff {
    /// Diff made only of additions.
    #[must_use]
    pub fn added(rows: Vec<QueryRow>) -> Self {
        Self {
            added: rows,
            removed: Vec::new(),
        }
    }

    /// True when the diff carries no change.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Description of data points to provision when a query has no match yet.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    /// Manifest name, used to derive provisioned identifiers.
    pub name: String,
    /// Provider recorded on the provisioned points.
    #[serde(default)]
    pub provider: String,
    /// Variables to provision, in the order of the query projection.
    #[serde(default)]
    pub variables: Vec<String>,
}

/// Variable provisioned by an injection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvidedVariable {
    /// Variable name from the manifest.
    pub variable: String,
    /// Node created for it.
    pub node: NodeIdentifier,
}

/// Outcome of a manifest injection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InjectionResult {
    /// Whether the blackboard accepted the manifest.
    pub success: bool,
    /// Variables that were provisioned.
    #[serde(default)]
    pub provided: Vec<ProvidedVariable>,
}

impl InjectionResult {
    /// Single-row placeholder built from the provisioned variables.
    #[must_use]
    pub fn placeholder(&self) -> Option<QueryResult> {
        if !self.success || self.provided.is_empty() {
            return None;
        }
        Some(QueryResult {
            variables: self.provided.iter().map(|p| p.variable.clone()).collect(),
            rows: vec![QueryRow::new(
                self.provided.iter().map(|p| p.node.clone()).collect(),
            )],
        })
    }
}

/// Value write addressed to one data point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValueUpdate {
    /// Target node.
    pub node: NodeIdentifier,
    /// Value to write.
    pub value: DataValue,
    /// Source timestamp.
    pub timestamp: DateTime<Utc>,
}

/// Callback receiving `(query_id, diff)` whenever a registered query's result changes.
pub type DiffCallback = Arc<dyn Fn(&str, &QueryDiff) + Send + Sync>;

/// Callback receiving `(node, value, source_timestamp)` whenever a subscribed point changes.
pub type ValueCallback = Arc<dyn Fn(&NodeIdentifier, &DataValue, DateTime<Utc>) + Send + Sync>;

/// Blackboard transport consumed by the composer.
///
/// Implementations may invoke callbacks from any thread, including
/// synchronously from inside `subscribe`, so callers must not hold locks the
/// callbacks need while calling into the client.
pub trait BlackboardClient: Send + Sync {
    /// Registers a live query. Returns its identifier and the initial diff.
    fn register_query(
        &self,
        query: &str,
        on_diff: DiffCallback,
    ) -> Result<(String, QueryDiff), BlackboardError>;

    /// Resolves a query once. `None` when nothing matches.
    fn query_result(&self, query: &str) -> Result<Option<QueryResult>, BlackboardError>;

    /// Provisions the data points described by a manifest.
    fn inject(&self, manifest: &Manifest) -> Result<InjectionResult, BlackboardError>;

    /// Subscribes one node of a registered query for live value pushes.
    fn subscribe(
        &self,
        query_id: &str,
        node: &NodeIdentifier,
        on_change: ValueCallback,
    ) -> Result<(), BlackboardError>;

    /// Writes values. Returns whether the blackboard accepted the batch.
    fn update_values(&self, updates: &[ValueUpdate]) -> Result<bool, BlackboardError>;
}

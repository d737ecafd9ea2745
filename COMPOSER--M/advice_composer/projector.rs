//! Candidate projection: materializes per-advisor candidate data from the
//! rows and live values accumulated for one function instance.

use blackboard_client::{DataValue, QueryRow};
use chrono::{DateTime, Duration, Utc};
use indexmap::{IndexMap, IndexSet};
use serde::Serialize;
use tracing::trace;

use crate::{
    descriptor::{
        context::{FeatureCatalog, FeatureTag},
        FunctionDescriptor,
    },
    discovery::{Destination, FunctionInstance, SourceBinding, ValueBinding},
    registry::{RegistrySnapshot, TrackingKey},
};

/// Resolved parameter payload and its destination.
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterSlot {
    /// Payload as pushed by the advisor.
    pub value: DataValue,
    /// Write-back target.
    pub destination: Destination,
}

/// Resolved set-point of a controlled-variable controller.
#[derive(Debug, Clone, PartialEq)]
pub struct SetPointSlot {
    /// Recommended set-point.
    pub value: f64,
    /// Current measured value of the controlled variable.
    pub measured_value: f64,
    /// Maximum rate of change, per second.
    pub max_rate_of_change: f64,
    /// Write-back target.
    pub destination: Destination,
}

/// Limit slot. The value, rate and destination fill in together.
#[derive(Debug, Clone, PartialEq)]
pub struct LimitSlot {
    /// Floor or ceiling.
    pub is_min: bool,
    /// Recommended limit.
    pub value: Option<f64>,
    /// Maximum rate of change, per second.
    pub max_rate_of_change: Option<f64>,
    /// Measured value of the limited variable, informational.
    pub measured_value: Option<f64>,
    /// Write-back target.
    pub destination: Option<Destination>,
}

/// Per-controller slots.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ControllerSlot {
    /// Controller parameters.
    pub parameters: Option<ParameterSlot>,
    /// Set-point.
    pub set_point: Option<SetPointSlot>,
    /// Limits, in declared order.
    pub limits: Vec<LimitSlot>,
}

/// Everything one advisor currently proposes for a function instance.
#[derive(Debug, Clone, PartialEq)]
pub struct CandidateData {
    /// Advisor name.
    pub advisor: String,
    /// Declared features.
    pub features: IndexSet<FeatureTag>,
    /// Function-level parameters.
    pub parameters: Option<ParameterSlot>,
    /// Controllers, shaped like the descriptor.
    pub controllers: Vec<ControllerSlot>,
}

impl CandidateData {
    /// Empty candidate shaped like `descriptor`.
    #[must_use]
    pub fn empty(advisor: impl Into<String>, descriptor: &FunctionDescriptor) -> Self {
        Self {
            advisor: advisor.into(),
            features: IndexSet::new(),
            parameters: None,
            controllers: descriptor
                .controllers()
                .iter()
                .map(|controller| ControllerSlot {
                    parameters: None,
                    set_point: None,
                    limits: controller
                        .limits()
                        .iter()
                        .map(|limit| LimitSlot {
                            is_min: limit.is_min,
                            value: None,
                            max_rate_of_change: None,
                            measured_value: None,
                            destination: None,
                        })
                        .collect(),
                })
                .collect(),
        }
    }

    /// Number of resolved set-points.
    #[must_use]
    pub fn set_point_count(&self) -> usize {
        self.controllers
            .iter()
            .filter(|controller| controller.set_point.is_some())
            .count()
    }
}

/// Why a row did not contribute to any candidate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum RowRejection {
    /// Fewer than the three expected columns.
    TooShort {
        /// Columns present.
        columns: usize,
    },
    /// A required column has an empty identifier.
    EmptyColumn {
        /// Offending column.
        column: usize,
    },
    /// The feature column is not in the catalog.
    UnknownFeature(String),
}

/// A row that was not applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedRow {
    /// Entry the row belongs to.
    pub key: TrackingKey,
    /// The row.
    pub row: QueryRow,
    /// Reason.
    pub reason: RowRejection,
}

/// Row accounting for one projection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProjectionReport {
    /// Rows that attached a feature to a candidate.
    pub rows_applied: usize,
    /// Rows that were rejected.
    pub rejected: Vec<RejectedRow>,
    /// Bindings skipped because a destination or companion value is missing.
    pub skipped_bindings: usize,
}

impl ProjectionReport {
    /// Rows seen, applied or rejected.
    #[must_use]
    pub fn rows_seen(&self) -> usize {
        self.rows_applied + self.rejected.len()
    }
}

/// Candidates of one function instance, by advisor.
#[derive(Debug, Clone, Default)]
pub struct Projection {
    /// Candidates in first-seen order.
    pub candidates: IndexMap<String, CandidateData>,
    /// Row accounting.
    pub report: ProjectionReport,
}

/// Slot a source binding fills.
#[derive(Debug, Clone, Copy)]
enum Slot {
    Parameters,
    ControllerParameters(usize),
    SetPoint(usize, f64, f64),
    Limit(usize, usize, f64, Option<f64>),
}

/// Projects registry state into candidates, treating values older than
/// `window` as not ready.
#[derive(Debug)]
pub struct CandidateProjector<'a> {
    snapshot: &'a RegistrySnapshot,
    catalog: &'a FeatureCatalog,
    now: DateTime<Utc>,
    window: Duration,
}

impl<'a> CandidateProjector<'a> {
    /// Creates a projector over a snapshot.
    #[must_use]
    pub const fn new(
        snapshot: &'a RegistrySnapshot,
        catalog: &'a FeatureCatalog,
        now: DateTime<Utc>,
        window: Duration,
    ) -> Self {
        Self {
            snapshot,
            catalog,
            now,
            window,
        }
    }

    /// Builds every candidate of `instance`.
    #[must_use]
    pub fn project(&self, instance: &FunctionInstance) -> Projection {
        let mut projection = Projection::default();
        let descriptor = &instance.descriptor;
        let bindings = &instance.bindings;

        if let Some(parameters) = &bindings.parameters {
            self.scan(&mut projection, descriptor, parameters, Slot::Parameters);
        }
        for (i, controller) in bindings.controllers.iter().enumerate() {
            if let Some(parameters) = &controller.parameters {
                self.scan(
                    &mut projection,
                    descriptor,
                    parameters,
                    Slot::ControllerParameters(i),
                );
            }
            if let Some(set_point) = &controller.set_point {
                let measured = self.number(&set_point.measured_value);
                let rate = self.number(&set_point.max_rate_of_change);
                match (measured, rate) {
                    (Some(measured), Some(rate)) => self.scan(
                        &mut projection,
                        descriptor,
                        &set_point.value,
                        Slot::SetPoint(i, measured, rate),
                    ),
                    _ => projection.report.skipped_bindings += 1,
                }
            }
            for (j, limit) in controller.limits.iter().enumerate() {
                let measured = limit.measured_value.as_ref().and_then(|b| self.number(b));
                match self.number(&limit.max_rate_of_change) {
                    Some(rate) => self.scan(
                        &mut projection,
                        descriptor,
                        &limit.value,
                        Slot::Limit(i, j, rate, measured),
                    ),
                    None => projection.report.skipped_bindings += 1,
                }
            }
        }
        projection
    }

    /// Fresh numeric value of a single-value binding.
    fn number(&self, binding: &ValueBinding) -> Option<f64> {
        let entry = self.snapshot.entry(binding.key?)?;
        entry.first_value(self.now, self.window)?.as_f64()
    }

    fn scan(
        &self,
        projection: &mut Projection,
        descriptor: &FunctionDescriptor,
        binding: &SourceBinding,
        slot: Slot,
    ) {
        let (Some(key), Some(destination)) = (binding.source, binding.destination.as_ref()) else {
            projection.report.skipped_bindings += 1;
            return;
        };
        let Some(entry) = self.snapshot.entry(key) else {
            projection.report.skipped_bindings += 1;
            return;
        };
        for row in &entry.rows {
            let (node, advisor, feature) = match self.classify(row) {
                Ok(parts) => parts,
                Err(reason) => {
                    trace!(?reason, "row rejected");
                    projection.report.rejected.push(RejectedRow {
                        key,
                        row: row.clone(),
                        reason,
                    });
                    continue;
                }
            };
            projection.report.rows_applied += 1;
            let candidate = projection
                .candidates
                .entry(advisor.to_owned())
                .or_insert_with(|| CandidateData::empty(advisor, descriptor));
            candidate.features.insert(feature);
            if let Some(value) = entry.live_values.fresh(node, self.now, self.window) {
                assign(candidate, slot, value, destination);
            }
        }
    }

    fn classify<'r>(
        &self,
        row: &'r QueryRow,
    ) -> Result<(&'r blackboard_client::NodeIdentifier, &'r str, FeatureTag), RowRejection> {
        if row.len() < 3 {
            return Err(RowRejection::TooShort { columns: row.len() });
        }
        let columns: Vec<_> = row.0.iter().take(3).collect();
        if let Some(column) = columns.iter().position(|node| node.id.is_empty()) {
            return Err(RowRejection::EmptyColumn { column });
        }
        let feature = self
            .catalog
            .parse(&columns[2].id)
            .map_err(|err| RowRejection::UnknownFeature(err.0))?;
        Ok((columns[0], columns[1].id.as_str(), feature))
    }
}

fn assign(candidate: &mut CandidateData, slot: Slot, value: &DataValue, destination: &Destination) {
    match slot {
        Slot::Parameters => {
            candidate.parameters = Some(ParameterSlot {
                value: value.clone(),
                destination: destination.clone(),
            });
        }
        Slot::ControllerParameters(i) => {
            if let Some(controller) = candidate.controllers.get_mut(i) {
                controller.parameters = Some(ParameterSlot {
                    value: value.clone(),
                    destination: destination.clone(),
                });
            }
        }
        Slot::SetPoint(i, measured_value, max_rate_of_change) => {
            let (Some(controller), Some(set_point)) = (candidate.controllers.get_mut(i), value.as_f64())
            else {
                return;
            };
            controller.set_point = Some(SetPointSlot {
                value: set_point,
                measured_value,
                max_rate_of_change,
                destination: destination.clone(),
            });
        }
        Slot::Limit(i, j, max_rate_of_change, measured_value) => {
            let Some(limit) = candidate
                .controllers
                .get_mut(i)
                .and_then(|controller| controller.limits.get_mut(j))
            else {
                return;
            };
            if let Some(number) = value.as_f64() {
                limit.value = Some(number);
                limit.max_rate_of_change = Some(max_rate_of_change);
                limit.measured_value = measured_value;
                limit.destination = Some(destination.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{discovery::CapabilityDiscovery, registry::QueryRegistry};
    use blackboard_client::{MemoryBlackboard, NodeIdentifier, QueryResult};
    use serde_json::json;
    use std::sync::Arc;

    fn node(id: &str) -> NodeIdentifier {
        NodeIdentifier::new("ns", id)
    }

    fn row(ids: &[&str]) -> QueryRow {
        QueryRow::new(ids.iter().map(|id| node(id)).collect())
    }

    fn binding(name: &str) -> serde_json::Value {
        json!({
            "query": format!("{name}-dst"), "variables": ["?d"],
            "alternate_query": format!("{name}-src"), "alternate_variables": ["?s", "?a", "?f"],
        })
    }

    fn controller_descriptor() -> FunctionDescriptor {
        let payload = json!({
            "family": "Controller",
            "name": "ROP",
            "controllers": [{
                "kind": "controlled_variable",
                "set_point": binding("sp"),
                "measured_value": { "query": "mv", "variables": ["?m"] },
                "max_rate_of_change": { "query": "roc", "variables": ["?r"] },
                "limits": [{
                    "is_min": false,
                    "value": binding("lim"),
                    "max_rate_of_change": { "query": "lroc", "variables": ["?r"] }
                }]
            }]
        });
        FunctionDescriptor::decode(&payload.to_string()).unwrap()
    }

    struct Rig {
        board: MemoryBlackboard,
        registry: QueryRegistry,
        discovery: CapabilityDiscovery,
    }

    fn rig() -> Rig {
        let board = MemoryBlackboard::new(32);
        for name in ["sp-dst", "lim-dst"] {
            board.set_result(
                name,
                QueryResult {
                    variables: vec!["?d".into()],
                    rows: vec![row(&[name])],
                },
            );
        }
        let registry = QueryRegistry::new(Arc::new(board.clone()));
        let discovery = CapabilityDiscovery::new(registry.clone(), "caps");
        Rig {
            board,
            registry,
            discovery,
        }
    }

    #[test]
    fn projects_set_points_and_limits_per_advisor() {
        let mut rig = rig();
        let now = Utc::now();
        let descriptor = controller_descriptor();
        rig.discovery.install(descriptor, now);
        rig.board.push_rows(
            "sp-src",
            vec![
                row(&["a.sp", "AdvisorA", "CuttingsTransportFeature"]),
                row(&["b.sp", "AdvisorB", "http://x#RigActionPlanFeature"]),
                row(&["c.sp", "AdvisorC", "NotAFeature"]),
                row(&["short", "AdvisorD"]),
            ],
            Vec::new(),
        );
        rig.board.push_rows(
            "lim-src",
            vec![row(&["b.lim", "AdvisorB", "RigActionPlanFeature"])],
            Vec::new(),
        );
        rig.board.push_rows("mv", vec![row(&["mv"])], Vec::new());
        rig.board.push_rows("roc", vec![row(&["roc"])], Vec::new());
        rig.board.push_rows("lroc", vec![row(&["lroc"])], Vec::new());
        for (id, value) in [("a.sp", 120.0), ("mv", 100.0), ("roc", 5.0), ("lroc", 1.0), ("b.lim", 40.0)] {
            rig.board.set_value(&node(id), DataValue::Number(value), now);
        }

        let snapshot = rig.registry.snapshot();
        let catalog = FeatureCatalog::default();
        let projector = CandidateProjector::new(&snapshot, &catalog, now, Duration::seconds(5));
        let instance = rig.discovery.instances().next().unwrap();
        let projection = projector.project(instance);

        assert_eq!(projection.candidates.len(), 2);
        let a = &projection.candidates["AdvisorA"];
        let set_point = a.controllers[0].set_point.as_ref().unwrap();
        assert_eq!(set_point.value, 120.0);
        assert_eq!(set_point.measured_value, 100.0);
        assert_eq!(set_point.max_rate_of_change, 5.0);
        assert_eq!(set_point.destination.first_node(), Some(&node("sp-dst")));

        let b = &projection.candidates["AdvisorB"];
        assert_eq!(b.set_point_count(), 0);
        assert_eq!(b.controllers[0].limits[0].value, Some(40.0));
        assert_eq!(b.features.len(), 1);

        assert_eq!(projection.report.rows_seen(), 5);
        assert_eq!(projection.report.rows_applied, 3);
        let reasons: Vec<&RowRejection> =
            projection.report.rejected.iter().map(|r| &r.reason).collect();
        assert!(reasons.contains(&&RowRejection::UnknownFeature("NotAFeature".into())));
        assert!(reasons.contains(&&RowRejection::TooShort { columns: 2 }));
    }

    #[test]
    fn stale_values_leave_slots_empty() {
        let mut rig = rig();
        let then = Utc::now();
        rig.discovery.install(controller_descriptor(), then);
        rig.board.push_rows(
            "sp-src",
            vec![row(&["a.sp", "AdvisorA", "CuttingsTransportFeature"])],
            Vec::new(),
        );
        rig.board.push_rows("mv", vec![row(&["mv"])], Vec::new());
        rig.board.push_rows("roc", vec![row(&["roc"])], Vec::new());
        for (id, value) in [("a.sp", 120.0), ("mv", 100.0), ("roc", 5.0)] {
            rig.board.set_value(&node(id), DataValue::Number(value), then);
        }
        let snapshot = rig.registry.snapshot();
        let catalog = FeatureCatalog::default();
        let later = then + Duration::seconds(10);
        let projector = CandidateProjector::new(&snapshot, &catalog, later, Duration::seconds(5));
        let projection = projector.project(rig.discovery.instances().next().unwrap());
        assert!(projection.candidates.is_empty());
        assert!(projection.report.skipped_bindings >= 1);
    }
}

//! Composer runtime: wires the registry, discovery, arbitration, slewing and
//! dispatch together and drives them on a periodic tick.

use std::sync::Arc;

use anyhow::{Context as _, Result};
use blackboard_client::{BlackboardClient, DataValue, MemoryBlackboard, NodeIdentifier, QueryRow};
use chrono::{DateTime, Utc};
use composer_logging::LogLevel;
use serde::Serialize;
use serde_json::json;
use tokio::{
    sync::watch,
    time::{interval, MissedTickBehavior},
};
use tracing::{info, instrument, warn};

use crate::{
    arbitration::{
        self,
        envelope::{combine_candidates, EnvelopeOutcome},
        SelectionMode,
    },
    config::ComposerConfig,
    descriptor::{
        context::{Context, FeatureCatalog},
        FunctionFamily,
    },
    discovery::{CapabilityDiscovery, DiscoveryReport, FunctionInstance, InstanceId},
    dispatch::{DispatchTally, Dispatcher},
    projector::CandidateProjector,
    registry::{QueryRegistry, RegistrySnapshot},
    slew::SlewLimiter,
    telemetry::ComposerTelemetry,
};

/// What happened to one function instance during a tick.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum InstanceOutcome {
    /// No candidate has any usable row yet.
    NotReady,
    /// The context binding has not published a decodable context.
    NoContext,
    /// Candidates exist but none qualifies.
    NoWinner,
    /// A winner was selected and dispatched.
    Published {
        /// Winning advisor.
        advisor: String,
    },
    /// Envelopes were combined and dispatched.
    EnvelopePublished {
        /// Top-priority surviving advisor.
        advisor: String,
        /// Number of envelopes in the combination.
        combined: usize,
    },
    /// No subset of the envelopes intersects.
    EnvelopeExhausted,
}

/// Per-instance line of a tick report.
#[derive(Debug, Clone, Serialize)]
pub struct InstanceReport {
    /// Instance id.
    pub instance: InstanceId,
    /// Function name.
    pub name: String,
    /// Function family.
    pub family: FunctionFamily,
    /// Outcome.
    #[serde(flatten)]
    pub outcome: InstanceOutcome,
    /// Write accounting.
    pub writes: DispatchTally,
}

/// Summary of one tick.
#[derive(Debug, Clone, Serialize)]
pub struct TickReport {
    /// Tick number, starting at 1.
    pub tick: u64,
    /// Tick time.
    pub at: DateTime<Utc>,
    /// Discovery pass results.
    pub discovery: DiscoveryReport,
    /// One line per installed instance.
    pub instances: Vec<InstanceReport>,
}

impl TickReport {
    /// Total writes of the tick.
    #[must_use]
    pub fn writes(&self) -> DispatchTally {
        let mut tally = DispatchTally::default();
        for instance in &self.instances {
            tally.absorb(instance.writes);
        }
        tally
    }

    /// Outcome of the instance named `name`.
    #[must_use]
    pub fn outcome(&self, name: &str) -> Option<&InstanceOutcome> {
        self.instances
            .iter()
            .find(|instance| instance.name == name)
            .map(|instance| &instance.outcome)
    }
}

/// Composer service state.
#[derive(Debug)]
pub struct ComposerRuntime {
    config: ComposerConfig,
    registry: QueryRegistry,
    discovery: CapabilityDiscovery,
    slew: SlewLimiter,
    dispatcher: Dispatcher,
    catalog: FeatureCatalog,
    telemetry: ComposerTelemetry,
    tick: u64,
}

impl ComposerRuntime {
    /// Validates the configuration, opens telemetry and registers the capability feed.
    pub fn bootstrap(config: ComposerConfig, client: Arc<dyn BlackboardClient>) -> Result<Self> {
        config.validate()?;
        let telemetry = match &config.log_path {
            Some(path) => ComposerTelemetry::builder("advice-composer")
                .log_path(path)
                .build()
                .context("initializing composer telemetry")?,
            None => ComposerTelemetry::disabled(),
        };
        let registry = QueryRegistry::new(Arc::clone(&client));
        let mut discovery = CapabilityDiscovery::new(registry.clone(), config.capability_query.clone())
            .with_telemetry(telemetry.clone());
        discovery
            .start()
            .context("registering the capability feed")?;
        info!(
            blackboard = %config.blackboard_url,
            interval_ms = config.loop_interval_ms,
            "composer bootstrapped"
        );
        Ok(Self {
            catalog: config.feature_catalog(),
            dispatcher: Dispatcher::new(client, telemetry.clone()),
            config,
            registry,
            discovery,
            slew: SlewLimiter::new(),
            telemetry,
            tick: 0,
        })
    }

    /// Active configuration.
    #[must_use]
    pub const fn config(&self) -> &ComposerConfig {
        &self.config
    }

    /// Shared registry.
    #[must_use]
    pub const fn registry(&self) -> &QueryRegistry {
        &self.registry
    }

    /// Installed functions.
    #[must_use]
    pub const fn discovery(&self) -> &CapabilityDiscovery {
        &self.discovery
    }

    /// Ticks run so far.
    #[must_use]
    pub const fn ticks(&self) -> u64 {
        self.tick
    }

    /// Runs one tick: discovery, then projection, arbitration, slewing and
    /// dispatch for every installed function.
    #[instrument(skip(self), fields(tick = self.tick + 1))]
    pub fn tick(&mut self, now: DateTime<Utc>) -> TickReport {
        self.tick += 1;
        let discovery = self.discovery.poll(&self.registry.snapshot(), now);
        let snapshot = self.registry.snapshot();

        let mut worker = TickWorker {
            config: &self.config,
            catalog: &self.catalog,
            slew: &mut self.slew,
            dispatcher: &self.dispatcher,
            telemetry: &self.telemetry,
            snapshot: &snapshot,
            tick: self.tick,
            now,
        };
        let instances: Vec<InstanceReport> = self
            .discovery
            .instances()
            .map(|instance| worker.process(instance))
            .collect();

        let report = TickReport {
            tick: self.tick,
            at: now,
            discovery,
            instances,
        };
        let writes = report.writes();
        info!(
            instances = report.instances.len(),
            written = writes.written,
            failed = writes.failed,
            "tick completed"
        );
        let _ = self.telemetry.log_tick(
            self.tick,
            LogLevel::Info,
            "composer.tick.completed",
            json!({
                "instances": report.instances.len(),
                "discovered": report.discovery.discovered,
                "written": writes.written,
                "failed": writes.failed,
            }),
        );
        report
    }

    /// Ticks on the configured interval until `shutdown` turns true, its
    /// sender goes away, or `max_ticks` have run. The current tick always
    /// completes. Returns the number of ticks run.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>, max_ticks: Option<u64>) -> Result<u64> {
        let mut ticker = interval(self.config.loop_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    self.tick(Utc::now());
                    if max_ticks.is_some_and(|max| self.tick >= max) {
                        break;
                    }
                }
            }
        }
        info!(ticks = self.tick, "composer stopped");
        Ok(self.tick)
    }
}

struct TickWorker<'a> {
    config: &'a ComposerConfig,
    catalog: &'a FeatureCatalog,
    slew: &'a mut SlewLimiter,
    dispatcher: &'a Dispatcher,
    telemetry: &'a ComposerTelemetry,
    snapshot: &'a RegistrySnapshot,
    tick: u64,
    now: DateTime<Utc>,
}

impl TickWorker<'_> {
    fn process(&mut self, instance: &FunctionInstance) -> InstanceReport {
        let mut writes = DispatchTally::default();
        let outcome = self.outcome(instance, &mut writes);
        InstanceReport {
            instance: instance.id,
            name: instance.name().to_owned(),
            family: instance.family(),
            outcome,
            writes,
        }
    }

    /// Context of an instance. No context binding means no preference;
    /// a binding that never published means not ready.
    fn context(&self, instance: &FunctionInstance) -> Option<Context> {
        let Some(binding) = &instance.bindings.context else {
            return Some(Context::default());
        };
        let entry = self.snapshot.entry(binding.key?)?;
        let payload = entry.latest_value()?.as_text()?;
        match Context::decode(payload, self.catalog) {
            Ok(context) => Some(context),
            Err(err) => {
                warn!(instance = instance.name(), error = %err, "context rejected");
                None
            }
        }
    }

    fn outcome(&mut self, instance: &FunctionInstance, writes: &mut DispatchTally) -> InstanceOutcome {
        let Some(context) = self.context(instance) else {
            return InstanceOutcome::NoContext;
        };
        let family = instance.family();
        let projector =
            CandidateProjector::new(self.snapshot, self.catalog, self.now, self.config.window(family));
        let projection = projector.project(instance);
        if projection.candidates.is_empty() {
            return InstanceOutcome::NotReady;
        }

        let Some(mode) = SelectionMode::for_family(family) else {
            return self.publish_envelope(instance, &context, &projection.candidates, writes);
        };
        let Some(mut selection) = arbitration::select(mode, &context, &projection.candidates) else {
            return InstanceOutcome::NoWinner;
        };
        if mode == SelectionMode::Controller {
            self.slew.apply(instance.id, &mut selection.winner, self.now);
        }
        *writes = self.dispatcher.publish(&selection.winner, self.now);
        let advisor = selection.winner.advisor;
        info!(
            instance = instance.name(),
            %advisor,
            contributors = selection.contributors.len(),
            "winner published"
        );
        let _ = self.telemetry.log_tick(
            self.tick,
            LogLevel::Info,
            "composer.winner.selected",
            json!({
                "instance": instance.name(),
                "family": family.to_string(),
                "advisor": advisor,
                "intersection": selection.intersection,
                "contributors": selection.contributors,
                "written": writes.written,
            }),
        );
        InstanceOutcome::Published { advisor }
    }

    fn publish_envelope(
        &self,
        instance: &FunctionInstance,
        context: &Context,
        candidates: &indexmap::IndexMap<String, crate::projector::CandidateData>,
        writes: &mut DispatchTally,
    ) -> InstanceOutcome {
        match combine_candidates(context, candidates) {
            EnvelopeOutcome::NoCandidates => InstanceOutcome::NoWinner,
            EnvelopeOutcome::Exhausted => InstanceOutcome::EnvelopeExhausted,
            EnvelopeOutcome::Combined {
                envelope,
                advisors,
                destination,
            } => {
                let ok = self.dispatcher.send_object(&destination, &envelope, self.now);
                *writes = DispatchTally {
                    written: usize::from(ok),
                    failed: usize::from(!ok),
                };
                let _ = self.telemetry.log_tick(
                    self.tick,
                    LogLevel::Info,
                    "composer.envelope.combined",
                    json!({
                        "instance": instance.name(),
                        "advisors": advisors,
                        "written": ok,
                    }),
                );
                InstanceOutcome::EnvelopePublished {
                    combined: advisors.len(),
                    advisor: advisors.into_iter().next().unwrap_or_default(),
                }
            }
        }
    }
}

const DEMO_NAMESPACE: &str = "demo";

fn demo_node(id: &str) -> NodeIdentifier {
    NodeIdentifier::new(DEMO_NAMESPACE, id)
}

fn demo_binding(name: &str) -> serde_json::Value {
    json!({
        "query": format!("{name}.dst"),
        "variables": ["?d"],
        "alternate_query": format!("{name}.src"),
        "alternate_variables": ["?node", "?advisor", "?feature"],
        "manifest": { "name": name, "provider": "advice-composer", "variables": ["?d"] },
    })
}

fn demo_value(query: &str) -> serde_json::Value {
    json!({ "query": query, "variables": ["?v"] })
}

/// Capability descriptors of the demo rig: a two-loop drilling controller
/// and a safe operating envelope.
#[must_use]
pub fn demo_descriptors() -> Vec<serde_json::Value> {
    let context = demo_value("drilling.context");
    vec![
        json!({
            "family": "Controller",
            "name": "DrillingControl",
            "context": context,
            "controllers": [
                {
                    "kind": "controlled_variable",
                    "set_point": demo_binding("rop.sp"),
                    "measured_value": demo_value("rop.measured"),
                    "max_rate_of_change": demo_value("rop.roc"),
                    "limits": [{
                        "is_min": false,
                        "value": demo_binding("wob.max"),
                        "max_rate_of_change": demo_value("wob.roc"),
                    }],
                },
                {
                    "kind": "controlled_variable",
                    "set_point": demo_binding("rpm.sp"),
                    "measured_value": demo_value("rpm.measured"),
                    "max_rate_of_change": demo_value("rpm.roc"),
                },
            ],
        }),
        json!({
            "family": "SafeEnvelope",
            "name": "DrillingEnvelope",
            "context": context,
            "parameters": demo_binding("soe"),
        }),
    ]
}

/// Advisor-tagged rows of the demo: `(source query, point, advisor, feature, value)`.
pub const DEMO_SOURCES: [(&str, &str, &str, &str, f64); 5] = [
    ("rop.sp.src", "a.rop", "AdvisorA", "CuttingsTransportFeature", 32.0),
    ("rpm.sp.src", "a.rpm", "AdvisorA", "RigActionPlanFeature", 140.0),
    ("rop.sp.src", "b.rop", "AdvisorB", "CuttingsTransportFeature", 28.0),
    ("wob.max.src", "c.wob", "AdvisorC", "CuttingsTransportFeature", 12.0),
    ("wob.max.src", "d.wob", "AdvisorD", "DrillStemVibrationFeature", 9.0),
];

/// Single-value points of the demo: `(query, point, value)`.
pub const DEMO_MEASUREMENTS: [(&str, &str, f64); 5] = [
    ("rop.measured", "rop.pv", 25.0),
    ("rop.roc", "rop.rate", 2.0),
    ("rpm.measured", "rpm.pv", 120.0),
    ("rpm.roc", "rpm.rate", 10.0),
    ("wob.roc", "wob.rate", 1.0),
];

/// Publishes a complete demo rig on an in-memory blackboard: descriptors on
/// the capability feed, a context preferring cuttings transport, advisor
/// proposals and measurements.
pub fn seed_demo(board: &MemoryBlackboard, capability_query: &str, now: DateTime<Utc>) {
    let descriptors = demo_descriptors();
    let points: Vec<NodeIdentifier> = (0..descriptors.len())
        .map(|i| demo_node(&format!("descriptor.{i}")))
        .collect();
    board.push_rows(
        capability_query,
        points.iter().map(|p| QueryRow::new(vec![p.clone()])).collect(),
        Vec::new(),
    );
    for (point, descriptor) in points.iter().zip(&descriptors) {
        board.set_value(point, DataValue::Text(descriptor.to_string()), now);
    }

    board.push_rows(
        "drilling.context",
        vec![QueryRow::new(vec![demo_node("context")])],
        Vec::new(),
    );
    board.set_value(
        &demo_node("context"),
        DataValue::Text(json!({ "capability_preferences": ["CuttingsTransportFeature"] }).to_string()),
        now,
    );

    for (query, point, advisor, feature, value) in DEMO_SOURCES {
        board.push_rows(
            query,
            vec![QueryRow::new(vec![
                demo_node(point),
                demo_node(advisor),
                demo_node(feature),
            ])],
            Vec::new(),
        );
        board.set_value(&demo_node(point), DataValue::Number(value), now);
    }
    for (query, point, value) in DEMO_MEASUREMENTS {
        board.push_rows(query, vec![QueryRow::new(vec![demo_node(point)])], Vec::new());
        board.set_value(&demo_node(point), DataValue::Number(value), now);
    }

    for (point, advisor, max_flowrate) in [("a.soe", "AdvisorA", 3.0), ("c.soe", "AdvisorC", 2.5)] {
        board.push_rows(
            "soe.src",
            vec![QueryRow::new(vec![
                demo_node(point),
                demo_node(advisor),
                demo_node("CuttingsTransportFeature"),
            ])],
            Vec::new(),
        );
        let envelope = json!({
            "max_flowrate": { "axis": [0.0, 1000.0, 2000.0], "values": [max_flowrate, max_flowrate, max_flowrate - 0.5] },
        });
        board.set_value(&demo_node(point), DataValue::Text(envelope.to_string()), now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::{envelope::SafeOperatingEnvelope, table::Table1D};
    use chrono::Duration;
    use composer_logging::read_records;
    use tempfile::tempdir;

    const CAPS: &str = "capabilities";

    fn config() -> ComposerConfig {
        ComposerConfig {
            capability_query: CAPS.into(),
            ..ComposerConfig::default()
        }
    }

    fn provisioned(board: &MemoryBlackboard, id: &str) -> Option<f64> {
        board
            .value(&NodeIdentifier::new("composer", id))
            .and_then(|value| value.as_f64())
    }

    #[test]
    fn demo_rig_publishes_controller_and_envelope() {
        let board = MemoryBlackboard::new(64);
        let now = Utc::now();
        seed_demo(&board, CAPS, now);
        let mut runtime = ComposerRuntime::bootstrap(config(), Arc::new(board.clone())).unwrap();

        let report = runtime.tick(now);
        assert_eq!(report.tick, 1);
        assert_eq!(report.discovery.discovered.len(), 2);
        assert_eq!(
            report.outcome("DrillingControl"),
            Some(&InstanceOutcome::Published {
                advisor: "AdvisorA".into()
            })
        );
        assert_eq!(provisioned(&board, "rop.sp.d"), Some(32.0));
        assert_eq!(provisioned(&board, "rpm.sp.d"), Some(140.0));
        assert_eq!(provisioned(&board, "wob.max.d"), Some(12.0));

        assert_eq!(
            report.outcome("DrillingEnvelope"),
            Some(&InstanceOutcome::EnvelopePublished {
                advisor: "AdvisorA".into(),
                combined: 2,
            })
        );
        let written = board
            .value(&NodeIdentifier::new("composer", "soe.d"))
            .unwrap();
        let envelope = SafeOperatingEnvelope::decode(written.as_text().unwrap()).unwrap();
        assert_eq!(
            envelope.max_flowrate,
            Some(Table1D::new(vec![0.0, 1000.0, 2000.0], vec![Some(2.5), Some(2.5), Some(2.0)]).unwrap())
        );
        assert_eq!(report.writes().failed, 0);
    }

    #[test]
    fn winner_is_independent_of_row_arrival_order() {
        let board = MemoryBlackboard::new(64);
        let now = Utc::now();
        let reversed = |query: &str| {
            let mut rows: Vec<QueryRow> = DEMO_SOURCES
                .iter()
                .filter(|(q, ..)| *q == query)
                .map(|(_, point, advisor, feature, _)| {
                    QueryRow::new(vec![demo_node(point), demo_node(advisor), demo_node(feature)])
                })
                .collect();
            rows.reverse();
            rows
        };
        board.push_rows("rop.sp.src", reversed("rop.sp.src"), Vec::new());
        seed_demo(&board, CAPS, now);
        let mut runtime = ComposerRuntime::bootstrap(config(), Arc::new(board.clone())).unwrap();
        let report = runtime.tick(now);
        assert_eq!(
            report.outcome("DrillingControl"),
            Some(&InstanceOutcome::Published {
                advisor: "AdvisorA".into()
            })
        );
    }

    #[test]
    fn set_point_changes_are_slewed_between_ticks() {
        let board = MemoryBlackboard::new(64);
        let now = Utc::now();
        seed_demo(&board, CAPS, now);
        let mut runtime = ComposerRuntime::bootstrap(config(), Arc::new(board.clone())).unwrap();
        runtime.tick(now);

        let later = now + Duration::seconds(1);
        board.set_value(&demo_node("a.rop"), DataValue::Number(40.0), later);
        board.set_value(&demo_node("c.wob"), DataValue::Number(8.0), later);
        runtime.tick(later);
        assert_eq!(provisioned(&board, "rop.sp.d"), Some(34.0));
        assert_eq!(provisioned(&board, "wob.max.d"), Some(11.0));
    }

    #[test]
    fn stale_proposals_and_missing_context_publish_nothing() {
        let board = MemoryBlackboard::new(64);
        let now = Utc::now();
        seed_demo(&board, CAPS, now);
        let mut runtime = ComposerRuntime::bootstrap(config(), Arc::new(board.clone())).unwrap();
        let report = runtime.tick(now + Duration::seconds(30));
        assert_eq!(
            report.outcome("DrillingControl"),
            Some(&InstanceOutcome::NotReady)
        );

        let board = MemoryBlackboard::new(64);
        let descriptor = demo_descriptors().remove(0);
        board.push_rows(CAPS, vec![QueryRow::new(vec![demo_node("d")])], Vec::new());
        board.set_value(&demo_node("d"), DataValue::Text(descriptor.to_string()), now);
        let mut runtime = ComposerRuntime::bootstrap(config(), Arc::new(board)).unwrap();
        let report = runtime.tick(now);
        assert_eq!(
            report.outcome("DrillingControl"),
            Some(&InstanceOutcome::NoContext)
        );
    }

    #[test]
    fn context_of_unknown_features_publishes_nothing() {
        let board = MemoryBlackboard::new(64);
        let now = Utc::now();
        seed_demo(&board, CAPS, now);
        board.set_value(
            &demo_node("context"),
            DataValue::Text(json!({ "capability_preferences": ["HoleCleaningFeature"] }).to_string()),
            now,
        );
        let mut runtime = ComposerRuntime::bootstrap(config(), Arc::new(board.clone())).unwrap();
        let report = runtime.tick(now);
        assert_eq!(
            report.outcome("DrillingControl"),
            Some(&InstanceOutcome::NoContext)
        );
        assert_eq!(provisioned(&board, "rop.sp.d"), None);
        assert_eq!(provisioned(&board, "wob.max.d"), None);
    }

    #[test]
    fn telemetry_records_ticks_and_winners() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("composer.jsonl");
        let board = MemoryBlackboard::new(64);
        let now = Utc::now();
        seed_demo(&board, CAPS, now);
        let config = ComposerConfig {
            log_path: Some(path.clone()),
            ..config()
        };
        let mut runtime = ComposerRuntime::bootstrap(config, Arc::new(board)).unwrap();
        runtime.tick(now);
        let messages: Vec<String> = read_records(&path)
            .unwrap()
            .into_iter()
            .map(|record| record.message)
            .collect();
        for expected in [
            "composer.function.discovered",
            "composer.winner.selected",
            "composer.envelope.combined",
            "composer.tick.completed",
        ] {
            assert!(messages.iter().any(|m| m == expected), "missing {expected}");
        }
    }

    #[tokio::test]
    async fn run_stops_after_max_ticks_or_shutdown() {
        let board = MemoryBlackboard::new(64);
        seed_demo(&board, CAPS, Utc::now());
        let config = ComposerConfig {
            loop_interval_ms: 10,
            ..config()
        };
        let (_tx, rx) = watch::channel(false);
        let runtime = ComposerRuntime::bootstrap(config.clone(), Arc::new(board.clone())).unwrap();
        assert_eq!(runtime.run(rx, Some(3)).await.unwrap(), 3);

        let (tx, rx) = watch::channel(false);
        let runtime = ComposerRuntime::bootstrap(config, Arc::new(board)).unwrap();
        tx.send(true).unwrap();
        assert_eq!(runtime.run(rx, None).await.unwrap(), 0);
    }
}

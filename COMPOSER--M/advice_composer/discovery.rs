//! Capability discovery: decodes descriptors from the capability feed and
//! wires each new function to registry queries and write-back destinations.

use std::{
    collections::{hash_map::DefaultHasher, HashMap},
    fmt,
    hash::{Hash, Hasher},
};

use blackboard_client::{NodeIdentifier, QueryResult};
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};
use uuid::Uuid;

use composer_logging::LogLevel;

use crate::{
    descriptor::{
        Controller, ControllerLimit, FunctionDescriptor, FunctionFamily, SemanticBinding,
    },
    error::{ComposerError, ComposerResult},
    registry::{Entry, QueryRegistry, RegistrySnapshot, TrackingKey},
    telemetry::ComposerTelemetry,
};

/// Write-back target: a resolved or provisioned query result, addressed at row 0, column 0.
pub type Destination = QueryResult;

/// Identifier of a discovered function instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstanceId(Uuid);

impl InstanceId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// Query registered for a single live value (context, measured value, rate of change).
#[derive(Debug, Clone)]
pub struct ValueBinding {
    /// Declared binding.
    pub binding: SemanticBinding,
    /// Registry entry, once registered.
    pub key: Option<TrackingKey>,
}

/// Advisor-tagged source rows paired with a write-back destination.
#[derive(Debug, Clone)]
pub struct SourceBinding {
    /// Declared binding.
    pub binding: SemanticBinding,
    /// Registry entry of the alternate query, once registered.
    pub source: Option<TrackingKey>,
    /// Destination resolved from the primary query.
    pub destination: Option<Destination>,
}

/// Bindings of one controller limit.
#[derive(Debug, Clone)]
pub struct LimitBindings {
    /// Floor or ceiling.
    pub is_min: bool,
    /// Limit value.
    pub value: SourceBinding,
    /// Measured value of the limited variable.
    pub measured_value: Option<ValueBinding>,
    /// Maximum rate of change.
    pub max_rate_of_change: ValueBinding,
}

/// Bindings of a controlled-variable set-point.
#[derive(Debug, Clone)]
pub struct SetPointBindings {
    /// Set-point value.
    pub value: SourceBinding,
    /// Measured value.
    pub measured_value: ValueBinding,
    /// Maximum rate of change.
    pub max_rate_of_change: ValueBinding,
}

/// Bindings of one controller.
#[derive(Debug, Clone)]
pub struct ControllerBindings {
    /// Controller parameters.
    pub parameters: Option<SourceBinding>,
    /// Set-point, for controlled-variable controllers.
    pub set_point: Option<SetPointBindings>,
    /// Limits, in declared order.
    pub limits: Vec<LimitBindings>,
}

/// Every binding of a function instance.
#[derive(Debug, Clone, Default)]
pub struct FunctionBindings {
    /// Context query.
    pub context: Option<ValueBinding>,
    /// Function-level parameters.
    pub parameters: Option<SourceBinding>,
    /// Controllers, in declared order.
    pub controllers: Vec<ControllerBindings>,
}

impl FunctionBindings {
    fn value_bindings_mut(&mut self) -> Vec<&mut ValueBinding> {
        let mut out: Vec<&mut ValueBinding> = self.context.iter_mut().collect();
        for controller in &mut self.controllers {
            if let Some(set_point) = controller.set_point.as_mut() {
                out.push(&mut set_point.measured_value);
                out.push(&mut set_point.max_rate_of_change);
            }
            for limit in &mut controller.limits {
                out.extend(limit.measured_value.as_mut());
                out.push(&mut limit.max_rate_of_change);
            }
        }
        out
    }

    fn source_bindings_mut(&mut self) -> Vec<&mut SourceBinding> {
        let mut out: Vec<&mut SourceBinding> = self.parameters.iter_mut().collect();
        for controller in &mut self.controllers {
            out.extend(controller.parameters.as_mut());
            if let Some(set_point) = controller.set_point.as_mut() {
                out.push(&mut set_point.value);
            }
            for limit in &mut controller.limits {
                out.push(&mut limit.value);
            }
        }
        out
    }

    /// Number of declared destinations not resolved yet.
    #[must_use]
    pub fn missing_destinations(&self) -> usize {
        let mut missing = usize::from(
            self.parameters
                .as_ref()
                .is_some_and(|p| p.binding.has_primary() && p.destination.is_none()),
        );
        for controller in &self.controllers {
            let sources = controller
                .parameters
                .iter()
                .chain(controller.set_point.as_ref().map(|s| &s.value))
                .chain(controller.limits.iter().map(|l| &l.value));
            missing += sources
                .filter(|s| s.binding.has_primary() && s.destination.is_none())
                .count();
        }
        missing
    }
}

/// A discovered function, wired for projection and dispatch.
#[derive(Debug, Clone)]
pub struct FunctionInstance {
    /// Instance identifier.
    pub id: InstanceId,
    /// Descriptor as first seen.
    pub descriptor: FunctionDescriptor,
    /// Registry and destination wiring.
    pub bindings: FunctionBindings,
    /// Discovery time.
    pub discovered_at: DateTime<Utc>,
}

impl FunctionInstance {
    /// Function name.
    #[must_use]
    pub fn name(&self) -> &str {
        self.descriptor.name()
    }

    /// Function family.
    #[must_use]
    pub const fn family(&self) -> FunctionFamily {
        self.descriptor.family()
    }
}

/// Outcome of one discovery pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DiscoveryReport {
    /// Functions installed during the pass.
    pub discovered: Vec<String>,
    /// New payloads naming an already installed function.
    pub duplicates: usize,
    /// New payloads that failed to decode.
    pub decode_failures: usize,
    /// Bindings wired during the pass by a retry.
    pub rewired: usize,
}

/// Watches the capability feed and owns the discovered function instances.
pub struct CapabilityDiscovery {
    registry: QueryRegistry,
    capability_query: String,
    capability_key: Option<TrackingKey>,
    instances: IndexMap<(FunctionFamily, String), FunctionInstance>,
    /// Fingerprint of the last payload decoded per capability node.
    seen_payloads: HashMap<NodeIdentifier, u64>,
    telemetry: Option<ComposerTelemetry>,
}

impl fmt::Debug for CapabilityDiscovery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CapabilityDiscovery")
            .field("capability_query", &self.capability_query)
            .field("instances", &self.instances.len())
            .finish()
    }
}

impl CapabilityDiscovery {
    /// Creates a discovery over the capability feed query.
    #[must_use]
    pub fn new(registry: QueryRegistry, capability_query: impl Into<String>) -> Self {
        Self {
            registry,
            capability_query: capability_query.into(),
            capability_key: None,
            instances: IndexMap::new(),
            seen_payloads: HashMap::new(),
            telemetry: None,
        }
    }

    /// Attaches telemetry.
    #[must_use]
    pub fn with_telemetry(mut self, telemetry: ComposerTelemetry) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    /// Registers the capability feed query once.
    pub fn start(&mut self) -> ComposerResult<TrackingKey> {
        if let Some(key) = self.capability_key {
            return Ok(key);
        }
        let key = self.registry.register(&self.capability_query)?;
        self.capability_key = Some(key);
        info!(%key, "capability feed registered");
        Ok(key)
    }

    /// Decodes payloads not seen before, installs first-seen functions and
    /// retries unwired bindings of every known function.
    pub fn poll(&mut self, snapshot: &RegistrySnapshot, now: DateTime<Utc>) -> DiscoveryReport {
        let mut report = DiscoveryReport::default();
        if self.capability_key.is_none() {
            if let Err(err) = self.start() {
                warn!(error = %err, "capability feed registration failed");
            }
        }
        let feed = self.capability_key.and_then(|key| snapshot.entry(key));
        let nodes = feed.map(Entry::first_column_nodes).unwrap_or_default();
        let payloads: Vec<(NodeIdentifier, String)> = feed
            .map(|entry| {
                nodes
                    .iter()
                    .filter_map(|node| {
                        let text = entry.live_values.get(node)?.value.as_ref()?.as_text()?;
                        Some((node.clone(), text.to_owned()))
                    })
                    .collect()
            })
            .unwrap_or_default();
        self.seen_payloads.retain(|node, _| nodes.contains(node));

        for (node, payload) in payloads {
            let hash = fingerprint(&payload);
            if self.seen_payloads.insert(node, hash) == Some(hash) {
                continue;
            }
            let descriptor = match FunctionDescriptor::decode(&payload) {
                Ok(descriptor) => descriptor,
                Err(err) => {
                    warn!(error = %err, "capability descriptor rejected");
                    report.decode_failures += 1;
                    continue;
                }
            };
            let name = descriptor.name().to_owned();
            if self.install(descriptor, now).is_some() {
                report.discovered.push(name);
            } else {
                report.duplicates += 1;
            }
        }

        report.rewired = self.rewire();
        report
    }

    /// Installs a descriptor unless a function of the same family and name
    /// already exists. Returns the new instance id.
    pub fn install(
        &mut self,
        descriptor: FunctionDescriptor,
        now: DateTime<Utc>,
    ) -> Option<InstanceId> {
        let key = (descriptor.family(), descriptor.name().to_owned());
        if self.instances.contains_key(&key) {
            debug!(family = %key.0, name = %key.1, "descriptor already installed, ignored");
            return None;
        }
        let instance = self.wire(descriptor, now);
        info!(
            instance = %instance.id,
            family = %instance.family(),
            name = instance.name(),
            "function installed"
        );
        if let Some(tel) = &self.telemetry {
            let _ = tel.log(
                LogLevel::Info,
                "composer.function.discovered",
                json!({
                    "instance": instance.id.to_string(),
                    "family": instance.family().to_string(),
                    "name": instance.name(),
                    "missing_destinations": instance.bindings.missing_destinations(),
                }),
            );
        }
        let id = instance.id;
        self.instances.insert(key, instance);
        Some(id)
    }

    fn wire(&self, descriptor: FunctionDescriptor, now: DateTime<Utc>) -> FunctionInstance {
        let bindings = FunctionBindings {
            context: descriptor.context().map(|b| self.value_binding(b)),
            parameters: descriptor.parameters().map(|b| self.source_binding(b)),
            controllers: descriptor
                .controllers()
                .iter()
                .map(|controller| self.controller_bindings(controller))
                .collect(),
        };
        FunctionInstance {
            id: InstanceId::new(),
            descriptor,
            bindings,
            discovered_at: now,
        }
    }

    fn controller_bindings(&self, controller: &Controller) -> ControllerBindings {
        let set_point = match controller {
            Controller::LimitsOnly { .. } => None,
            Controller::ControlledVariable {
                set_point,
                measured_value,
                max_rate_of_change,
                ..
            } => Some(SetPointBindings {
                value: self.source_binding(set_point),
                measured_value: self.value_binding(measured_value),
                max_rate_of_change: self.value_binding(max_rate_of_change),
            }),
        };
        ControllerBindings {
            parameters: controller.parameters().map(|b| self.source_binding(b)),
            set_point,
            limits: controller
                .limits()
                .iter()
                .map(|limit| self.limit_bindings(limit))
                .collect(),
        }
    }

    fn limit_bindings(&self, limit: &ControllerLimit) -> LimitBindings {
        LimitBindings {
            is_min: limit.is_min,
            value: self.source_binding(&limit.value),
            measured_value: limit.measured_value.as_ref().map(|b| self.value_binding(b)),
            max_rate_of_change: self.value_binding(&limit.max_rate_of_change),
        }
    }

    fn value_binding(&self, binding: &SemanticBinding) -> ValueBinding {
        ValueBinding {
            binding: binding.clone(),
            key: self.register_value(binding),
        }
    }

    fn source_binding(&self, binding: &SemanticBinding) -> SourceBinding {
        SourceBinding {
            binding: binding.clone(),
            source: self.register_source(binding),
            destination: self.provision(binding),
        }
    }

    fn register_value(&self, binding: &SemanticBinding) -> Option<TrackingKey> {
        let query = if binding.has_primary() {
            &binding.query
        } else if binding.has_alternate() {
            &binding.alternate_query
        } else {
            return None;
        };
        self.register(query)
    }

    fn register_source(&self, binding: &SemanticBinding) -> Option<TrackingKey> {
        if !binding.has_alternate() {
            return None;
        }
        self.register(&binding.alternate_query)
    }

    fn register(&self, query: &str) -> Option<TrackingKey> {
        match self.registry.register(query) {
            Ok(key) => Some(key),
            Err(err) => {
                warn!(error = %err, "query registration failed");
                None
            }
        }
    }

    fn provision(&self, binding: &SemanticBinding) -> Option<Destination> {
        if !binding.has_primary() {
            return None;
        }
        match resolve_or_provision(&self.registry, binding) {
            Ok(destination) => Some(destination),
            Err(err) => {
                warn!(error = %err, query = %binding.query, "destination unavailable");
                None
            }
        }
    }

    fn rewire(&mut self) -> usize {
        let mut instances = std::mem::take(&mut self.instances);
        let mut rewired = 0;
        for instance in instances.values_mut() {
            for value in instance.bindings.value_bindings_mut() {
                if value.key.is_none() {
                    value.key = self.register_value(&value.binding);
                    rewired += usize::from(value.key.is_some());
                }
            }
            for source in instance.bindings.source_bindings_mut() {
                if source.source.is_none() && source.binding.has_alternate() {
                    source.source = self.register_source(&source.binding);
                    rewired += usize::from(source.source.is_some());
                }
                if source.destination.is_none() && source.binding.has_primary() {
                    source.destination = self.provision(&source.binding);
                    if source.destination.is_some() {
                        info!(instance = %instance.id, "destination provisioned on retry");
                        rewired += 1;
                    }
                }
            }
        }
        self.instances = instances;
        rewired
    }

    /// Installed instances in discovery order.
    pub fn instances(&self) -> impl Iterator<Item = &FunctionInstance> {
        self.instances.values()
    }

    /// Instance by family and name.
    #[must_use]
    pub fn instance(&self, family: FunctionFamily, name: &str) -> Option<&FunctionInstance> {
        self.instances.get(&(family, name.to_owned()))
    }

    /// Number of installed instances.
    #[must_use]
    pub fn len(&self) -> usize {
        self.instances.len()
    }

    /// True when nothing is installed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }
}

/// Resolves the primary query once; provisions it through the manifest when nothing matches.
pub fn resolve_or_provision(
    registry: &QueryRegistry,
    binding: &SemanticBinding,
) -> ComposerResult<Destination> {
    let client = registry.client();
    if let Some(result) = client.query_result(&binding.query)? {
        if result.first_node().is_some() {
            return Ok(result);
        }
    }
    let manifest = binding.manifest.as_ref().ok_or_else(|| {
        ComposerError::Provision(format!("no match and no manifest for `{}`", binding.query))
    })?;
    let injected = client.inject(manifest)?;
    injected.placeholder().ok_or_else(|| {
        ComposerError::Provision(format!("manifest `{}` provisioned nothing", manifest.name))
    })
}

fn fingerprint(payload: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    payload.hash(&mut hasher);
    hasher.finish()
}

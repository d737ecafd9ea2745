#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    missing_docs,
    rust_2018_idioms
)]

//! Advice composer: arbitrates competing drilling advisor proposals and
//! publishes one reconciled decision per function instance and tick.

/// Candidate selection, limit merging and envelope intersection.
#[path = "../arbitration/main.rs"]
pub mod arbitration;

/// Service configuration.
#[path = "../config.rs"]
pub mod config;

/// Function descriptors, feature tags, lookup tables and envelopes.
#[path = "../descriptor/main.rs"]
pub mod descriptor;

/// Capability discovery and function instance wiring.
#[path = "../discovery.rs"]
pub mod discovery;

/// Value write-back.
#[path = "../dispatch.rs"]
pub mod dispatch;

/// Error taxonomy.
#[path = "../error.rs"]
pub mod error;

/// Candidate materialization from registry state.
#[path = "../projector.rs"]
pub mod projector;

/// Live query registry and value cells.
#[path = "../registry/main.rs"]
pub mod registry;

/// Rate-of-change smoothing.
#[path = "../slew.rs"]
pub mod slew;

/// Telemetry helpers.
#[path = "../telemetry.rs"]
pub mod telemetry;

/// Runtime entrypoints and the tick driver.
#[path = "../main.rs"]
pub mod orchestration_entry;

pub use arbitration::{Selection, SelectionMode};
pub use config::{ComposerConfig, ObsolescenceConfig};
pub use descriptor::{
    context::{Context, FeatureCatalog, FeatureTag},
    envelope::SafeOperatingEnvelope,
    table::{LookupTable, Table1D, Table2D},
    FunctionDescriptor, FunctionFamily,
};
pub use discovery::{CapabilityDiscovery, FunctionInstance, InstanceId};
pub use dispatch::{DispatchTally, Dispatcher};
pub use error::{ComposerError, ComposerResult};
pub use orchestration_entry::{ComposerRuntime, InstanceOutcome, InstanceReport, TickReport};
pub use projector::{CandidateData, CandidateProjector, ProjectionReport, RowRejection};
pub use registry::{Entry, QueryRegistry, RegistrySnapshot, TrackingKey};
pub use slew::SlewLimiter;
pub use telemetry::{ComposerTelemetry, ComposerTelemetryBuilder};

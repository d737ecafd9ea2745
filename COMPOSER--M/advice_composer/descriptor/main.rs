//! Function descriptors published by advisors on the capability feed.

/// Feature tags, feature catalog and scheduling context.
pub mod context;
/// Safe operating envelope parameters.
pub mod envelope;
/// Lookup tables.
pub mod table;

use std::fmt;

use blackboard_client::Manifest;
use serde::{Deserialize, Serialize};

use crate::error::{ComposerError, ComposerResult};

/// Function family of a descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum FunctionFamily {
    /// Set-point and limit controllers.
    Controller,
    /// Drilling procedures.
    Procedure,
    /// Fault detection, isolation and recovery.
    FaultHandling,
    /// Safe operating envelopes.
    SafeEnvelope,
}

impl fmt::Display for FunctionFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Controller => "controller",
            Self::Procedure => "procedure",
            Self::FaultHandling => "fault_handling",
            Self::SafeEnvelope => "safe_envelope",
        };
        f.write_str(label)
    }
}

/// Semantic query pair. The primary query addresses the write-back
/// destination (or a single live value); the alternate query yields
/// `[node, advisor, feature]` rows for advisor-tagged sources.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SemanticBinding {
    /// Primary query text.
    #[serde(default)]
    pub query: String,
    /// Variables projected by the primary query.
    #[serde(default)]
    pub variables: Vec<String>,
    /// Alternate query text.
    #[serde(default)]
    pub alternate_query: String,
    /// Variables projected by the alternate query.
    #[serde(default)]
    pub alternate_variables: Vec<String>,
    /// Manifest injected when the primary query has no match.
    #[serde(default)]
    pub manifest: Option<Manifest>,
}

impl SemanticBinding {
    /// Whether the primary query is usable.
    #[must_use]
    pub fn has_primary(&self) -> bool {
        !self.query.trim().is_empty() && !self.variables.is_empty()
    }

    /// Whether the alternate query is usable.
    #[must_use]
    pub fn has_alternate(&self) -> bool {
        !self.alternate_query.trim().is_empty() && !self.alternate_variables.is_empty()
    }
}

/// Fields shared by procedure, fault handling and envelope descriptors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionHeader {
    /// Advisor-assigned function name.
    pub name: String,
    /// Binding of the scheduling context.
    #[serde(default)]
    pub context: Option<SemanticBinding>,
    /// Binding of the parameter payload.
    #[serde(default)]
    pub parameters: Option<SemanticBinding>,
}

/// Controller function descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControllerFunction {
    /// Advisor-assigned function name.
    pub name: String,
    /// Binding of the scheduling context.
    #[serde(default)]
    pub context: Option<SemanticBinding>,
    /// Binding of the function-level parameters.
    #[serde(default)]
    pub parameters: Option<SemanticBinding>,
    /// Controllers, in a stable order shared by every advisor of the function.
    #[serde(default)]
    pub controllers: Vec<Controller>,
}

/// One controller of a controller function.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Controller {
    /// Controller that only publishes limits.
    LimitsOnly {
        /// Controller parameters.
        #[serde(default)]
        parameters: Option<SemanticBinding>,
        /// Limits.
        #[serde(default)]
        limits: Vec<ControllerLimit>,
    },
    /// Controller driving a set-point.
    ControlledVariable {
        /// Controller parameters.
        #[serde(default)]
        parameters: Option<SemanticBinding>,
        /// Set-point source (alternate) and destination (primary).
        set_point: SemanticBinding,
        /// Measured value of the controlled variable.
        measured_value: SemanticBinding,
        /// Maximum set-point rate of change.
        max_rate_of_change: SemanticBinding,
        /// Limits.
        #[serde(default)]
        limits: Vec<ControllerLimit>,
    },
}

impl Controller {
    /// Controller parameters binding.
    #[must_use]
    pub const fn parameters(&self) -> Option<&SemanticBinding> {
        match self {
            Self::LimitsOnly { parameters, .. } | Self::ControlledVariable { parameters, .. } => {
                parameters.as_ref()
            }
        }
    }

    /// Limits of the controller.
    #[must_use]
    pub fn limits(&self) -> &[ControllerLimit] {
        match self {
            Self::LimitsOnly { limits, .. } | Self::ControlledVariable { limits, .. } => limits,
        }
    }
}

/// One limit of a controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControllerLimit {
    /// True for a floor, false for a ceiling.
    #[serde(default)]
    pub is_min: bool,
    /// Limit source (alternate) and destination (primary).
    pub value: SemanticBinding,
    /// Measured value of the limited variable.
    #[serde(default)]
    pub measured_value: Option<SemanticBinding>,
    /// Maximum rate of change of the limit.
    pub max_rate_of_change: SemanticBinding,
}

/// Capability descriptor, tagged by family.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "family")]
pub enum FunctionDescriptor {
    /// Controller function.
    Controller(ControllerFunction),
    /// Procedure function.
    Procedure(FunctionHeader),
    /// Fault handling function.
    FaultHandling(FunctionHeader),
    /// Safe operating envelope function.
    SafeEnvelope(FunctionHeader),
}

impl FunctionDescriptor {
    /// Decodes a descriptor from its JSON payload.
    pub fn decode(payload: &str) -> ComposerResult<Self> {
        let descriptor: Self = serde_json::from_str(payload)?;
        if descriptor.name().trim().is_empty() {
            return Err(ComposerError::Decode("descriptor without a name".into()));
        }
        Ok(descriptor)
    }

    /// Function name.
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Controller(function) => &function.name,
            Self::Procedure(header) | Self::FaultHandling(header) | Self::SafeEnvelope(header) => {
                &header.name
            }
        }
    }

    /// Function family.
    #[must_use]
    pub const fn family(&self) -> FunctionFamily {
        match self {
            Self::Controller(_) => FunctionFamily::Controller,
            Self::Procedure(_) => FunctionFamily::Procedure,
            Self::FaultHandling(_) => FunctionFamily::FaultHandling,
            Self::SafeEnvelope(_) => FunctionFamily::SafeEnvelope,
        }
    }

    /// Context binding.
    #[must_use]
    pub const fn context(&self) -> Option<&SemanticBinding> {
        match self {
            Self::Controller(function) => function.context.as_ref(),
            Self::Procedure(header) | Self::FaultHandling(header) | Self::SafeEnvelope(header) => {
                header.context.as_ref()
            }
        }
    }

    /// Function-level parameters binding.
    #[must_use]
    pub const fn parameters(&self) -> Option<&SemanticBinding> {
        match self {
            Self::Controller(function) => function.parameters.as_ref(),
            Self::Procedure(header) | Self::FaultHandling(header) | Self::SafeEnvelope(header) => {
                header.parameters.as_ref()
            }
        }
    }

    /// Controllers, empty for non-controller families.
    #[must_use]
    pub fn controllers(&self) -> &[Controller] {
        match self {
            Self::Controller(function) => &function.controllers,
            _ => &[],
        }
    }
}

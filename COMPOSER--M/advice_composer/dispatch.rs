//! Write-back of winning values to their destinations.

use std::sync::Arc;

use blackboard_client::{BlackboardClient, DataValue, ValueUpdate};
use chrono::{DateTime, Utc};
use composer_logging::LogLevel;
use serde::Serialize;
use serde_json::json;
use tracing::{debug, warn};

use crate::{discovery::Destination, projector::CandidateData, telemetry::ComposerTelemetry};

/// Successful and failed writes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DispatchTally {
    /// Writes the blackboard accepted.
    pub written: usize,
    /// Writes that were dropped or rejected.
    pub failed: usize,
}

impl DispatchTally {
    fn record(&mut self, ok: bool) {
        if ok {
            self.written += 1;
        } else {
            self.failed += 1;
        }
    }

    /// Adds another tally.
    pub fn absorb(&mut self, other: Self) {
        self.written += other.written;
        self.failed += other.failed;
    }
}

/// Writes values to destination nodes. Failures are logged and reported as `false`.
#[derive(Clone)]
pub struct Dispatcher {
    client: Arc<dyn BlackboardClient>,
    telemetry: ComposerTelemetry,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("telemetry", &self.telemetry)
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    /// Creates a dispatcher writing through `client`.
    #[must_use]
    pub fn new(client: Arc<dyn BlackboardClient>, telemetry: ComposerTelemetry) -> Self {
        Self { client, telemetry }
    }

    /// Writes a number.
    pub fn send_scalar(&self, destination: &Destination, value: f64, at: DateTime<Utc>) -> bool {
        self.send_value(destination, &DataValue::Number(value), at)
    }

    /// Serializes `value` as JSON text and writes it.
    pub fn send_object<T: Serialize>(
        &self,
        destination: &Destination,
        value: &T,
        at: DateTime<Utc>,
    ) -> bool {
        match serde_json::to_string(value) {
            Ok(text) => self.send_value(destination, &DataValue::Text(text), at),
            Err(err) => {
                self.failed(destination, &format!("encode: {err}"));
                false
            }
        }
    }

    /// Writes a value to the node at row 0, column 0 of `destination`.
    pub fn send_value(&self, destination: &Destination, value: &DataValue, at: DateTime<Utc>) -> bool {
        let Some(node) = destination.first_node().filter(|node| node.is_addressable()) else {
            debug!("destination has no addressable node, write skipped");
            return false;
        };
        let update = ValueUpdate {
            node: node.clone(),
            value: value.clone(),
            timestamp: at,
        };
        match self.client.update_values(std::slice::from_ref(&update)) {
            Ok(true) => {
                debug!(%node, %value, "value written");
                true
            }
            Ok(false) => {
                self.failed(destination, "write rejected");
                false
            }
            Err(err) => {
                self.failed(destination, &err.to_string());
                false
            }
        }
    }

    /// Writes every resolved slot of a winner: parameters, controller
    /// parameters, set-points and limits.
    pub fn publish(&self, winner: &CandidateData, at: DateTime<Utc>) -> DispatchTally {
        let mut tally = DispatchTally::default();
        if let Some(parameters) = &winner.parameters {
            tally.record(self.send_value(&parameters.destination, &parameters.value, at));
        }
        for controller in &winner.controllers {
            if let Some(parameters) = &controller.parameters {
                tally.record(self.send_value(&parameters.destination, &parameters.value, at));
            }
            if let Some(set_point) = &controller.set_point {
                tally.record(self.send_scalar(&set_point.destination, set_point.value, at));
            }
            for limit in &controller.limits {
                if let (Some(value), Some(destination)) = (limit.value, &limit.destination) {
                    tally.record(self.send_scalar(destination, value, at));
                }
            }
        }
        tally
    }

    fn failed(&self, destination: &Destination, reason: &str) {
        let node = destination
            .first_node()
            .map(ToString::to_string)
            .unwrap_or_default();
        warn!(%node, reason, "dispatch failed");
        let _ = self.telemetry.log(
            LogLevel::Warn,
            "composer.dispatch.failed",
            json!({ "node": node, "reason": reason }),
        );
    }
}

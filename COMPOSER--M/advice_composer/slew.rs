//! Bounded-rate smoothing of winning set-points and limits between ticks.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tracing::trace;

use crate::{discovery::InstanceId, projector::CandidateData};

const EPSILON: f64 = 1e-12;

/// Moves `previous` toward `target` by at most `rate * dt`.
/// Reaches the target exactly when the step budget covers the gap.
#[must_use]
pub fn slew(previous: f64, target: f64, rate: f64, dt: f64) -> f64 {
    let gap = target - previous;
    if gap.abs() <= EPSILON || dt <= EPSILON {
        return target;
    }
    let budget = rate.abs() * dt;
    if budget >= gap.abs() {
        return target;
    }
    gap.signum().mul_add(budget, previous)
}

/// Per-instance memory of the last published winner.
#[derive(Debug, Default)]
pub struct SlewLimiter {
    memory: HashMap<InstanceId, (CandidateData, DateTime<Utc>)>,
}

impl SlewLimiter {
    /// Empty limiter.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Slews `winner` in place against the previous winner of `instance` and
    /// remembers the result. Returns how many slots were adjusted.
    pub fn apply(
        &mut self,
        instance: InstanceId,
        winner: &mut CandidateData,
        now: DateTime<Utc>,
    ) -> usize {
        let mut adjusted = 0;
        if let Some((previous, at)) = self.memory.get(&instance) {
            #[allow(clippy::cast_precision_loss)]
            let dt = (now - *at).num_milliseconds().max(0) as f64 / 1000.0;
            for (current, before) in winner.controllers.iter_mut().zip(&previous.controllers) {
                if let (Some(sp), Some(prev)) =
                    (current.set_point.as_mut(), before.set_point.as_ref())
                {
                    let slewed = slew(prev.value, sp.value, sp.max_rate_of_change, dt);
                    adjusted += usize::from(slewed != sp.value);
                    sp.value = slewed;
                }
                for (limit, prev) in current.limits.iter_mut().zip(&before.limits) {
                    let (Some(target), Some(last), Some(rate)) =
                        (limit.value, prev.value, limit.max_rate_of_change)
                    else {
                        continue;
                    };
                    let slewed = slew(last, target, rate, dt);
                    adjusted += usize::from(slewed != target);
                    limit.value = Some(slewed);
                }
            }
            trace!(%instance, adjusted, dt, "winner slewed");
        }
        self.memory.insert(instance, (winner.clone(), now));
        adjusted
    }

    /// Last winner remembered for an instance.
    #[must_use]
    pub fn previous(&self, instance: InstanceId) -> Option<&CandidateData> {
        self.memory.get(&instance).map(|(winner, _)| winner)
    }
}

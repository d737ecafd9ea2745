use indexmap::IndexMap;
use tracing::{debug, warn};

use super::rank;
use crate::{
    descriptor::{
        context::Context,
        envelope::{Bound, EnvelopeParameters, SafeOperatingEnvelope},
        table::LookupTable,
    },
    discovery::Destination,
    error::{ComposerError, ComposerResult},
    projector::CandidateData,
};

fn span(axis: &[f64]) -> ComposerResult<(f64, f64)> {
    match (axis.first(), axis.last()) {
        (Some(lo), Some(hi)) => Ok((*lo, *hi)),
        _ => Err(ComposerError::Intersection("empty axis".into())),
    }
}

/// Intersects tables of the same shape: each axis is restricted to the
/// common domain and resampled on the union of in-range coordinates, and
/// every grid point combines the interpolated sources with `bound`.
pub fn intersect_tables<T: LookupTable>(tables: &[&T], bound: Bound) -> ComposerResult<T> {
    let first = tables
        .first()
        .ok_or_else(|| ComposerError::Intersection("no table to intersect".into()))?;
    let dims = first.axes().len();
    if tables.iter().any(|table| table.axes().len() != dims) {
        return Err(ComposerError::Intersection("tables differ in dimension".into()));
    }

    let mut axes = Vec::with_capacity(dims);
    for dim in 0..dims {
        let (mut lo, mut hi) = (f64::NEG_INFINITY, f64::INFINITY);
        for table in tables {
            let (min, max) = span(&table.axes()[dim])?;
            lo = lo.max(min);
            hi = hi.min(max);
        }
        if lo > hi {
            return Err(ComposerError::Intersection(format!(
                "axis {dim} domains do not overlap"
            )));
        }
        let mut coordinates = Vec::new();
        for table in tables {
            let before = coordinates.len();
            coordinates.extend(
                table.axes()[dim]
                    .iter()
                    .copied()
                    .filter(|c| (lo..=hi).contains(c)),
            );
            if coordinates.len() == before {
                return Err(ComposerError::Intersection(format!(
                    "a table has no coordinate of axis {dim} in [{lo}, {hi}]"
                )));
            }
        }
        coordinates.sort_by(f64::total_cmp);
        coordinates.dedup();
        axes.push(coordinates);
    }

    let total: usize = axes.iter().map(Vec::len).product();
    let mut point = vec![0.0; dims];
    let mut values = Vec::with_capacity(total);
    for flat in 0..total {
        let mut rest = flat;
        for dim in (0..dims).rev() {
            let axis: &Vec<f64> = &axes[dim];
            point[dim] = axis[rest % axis.len()];
            rest /= axis.len();
        }
        values.push(
            tables
                .iter()
                .filter_map(|table| table.interpolate(&point))
                .reduce(|a, b| bound.combine(a, b)),
        );
    }
    if values.iter().all(Option::is_none) {
        return Err(ComposerError::Intersection(
            "no grid point received a value".into(),
        ));
    }
    T::from_grid(axes, values)
}

/// Intersects `ordered` (highest priority first), dropping the lowest
/// priority source after each failure. Returns the combination and how
/// many sources it kept.
pub fn combine<P: EnvelopeParameters>(ordered: &[&P]) -> Option<(P, usize)> {
    for kept in (1..=ordered.len()).rev() {
        match P::intersect(&ordered[..kept]) {
            Ok(combined) => return Some((combined, kept)),
            Err(err) => debug!(kept, error = %err, "envelope intersection failed, dropping last"),
        }
    }
    None
}

/// Result of combining the envelope candidates of one instance.
#[derive(Debug, Clone, PartialEq)]
pub enum EnvelopeOutcome {
    /// No candidate carries a decodable envelope.
    NoCandidates,
    /// Every subset failed to intersect.
    Exhausted,
    /// Combined envelope, to be written to the top survivor's destination.
    Combined {
        /// Intersection of the surviving envelopes.
        envelope: SafeOperatingEnvelope,
        /// Surviving advisors, highest priority first.
        advisors: Vec<String>,
        /// Destination of the top survivor.
        destination: Destination,
    },
}

/// Ranks envelope candidates against the context, decodes their payloads
/// and combines as many as intersect.
#[must_use]
pub fn combine_candidates(
    context: &Context,
    candidates: &IndexMap<String, CandidateData>,
) -> EnvelopeOutcome {
    let mut decoded = Vec::new();
    for entry in rank(context, candidates.values()) {
        let Some(slot) = &entry.candidate.parameters else {
            continue;
        };
        let Some(payload) = slot.value.as_text() else {
            warn!(advisor = %entry.candidate.advisor, "envelope payload is not text");
            continue;
        };
        match SafeOperatingEnvelope::decode(payload) {
            Ok(envelope) => decoded.push((entry.candidate.advisor.clone(), envelope, slot)),
            Err(err) => warn!(advisor = %entry.candidate.advisor, error = %err, "envelope rejected"),
        }
    }
    if decoded.is_empty() {
        return EnvelopeOutcome::NoCandidates;
    }
    let ordered: Vec<&SafeOperatingEnvelope> = decoded.iter().map(|(_, e, _)| e).collect();
    let Some((envelope, kept)) = combine(&ordered) else {
        warn!(candidates = decoded.len(), "no envelope subset intersects");
        return EnvelopeOutcome::Exhausted;
    };
    let destination = decoded[0].2.destination.clone();
    EnvelopeOutcome::Combined {
        envelope,
        advisors: decoded
            .into_iter()
            .take(kept)
            .map(|(advisor, _, _)| advisor)
            .collect(),
        destination,
    }
}

use crate::projector::{CandidateData, LimitSlot};

/// Folds a contributor limit into the winner's slot at the same position.
/// An unset winner slot adopts the contributor; otherwise a floor keeps the
/// larger value and a ceiling keeps the smaller one.
pub fn merge_limit(winner: &mut LimitSlot, contributor: &LimitSlot) {
    let Some(value) = contributor.value else {
        return;
    };
    match winner.value {
        None => {
            winner.value = Some(value);
            winner.max_rate_of_change = contributor.max_rate_of_change;
            winner.measured_value = contributor.measured_value;
            winner.destination.clone_from(&contributor.destination);
        }
        Some(current) => {
            winner.value = Some(if contributor.is_min {
                current.max(value)
            } else {
                current.min(value)
            });
        }
    }
}

/// Merges every limit position the two candidates share.
pub fn merge_candidate(winner: &mut CandidateData, contributor: &CandidateData) {
    for (ours, theirs) in winner.controllers.iter_mut().zip(&contributor.controllers) {
        for (slot, other) in ours.limits.iter_mut().zip(&theirs.limits) {
            merge_limit(slot, other);
        }
    }
}

//! Winner selection for controller, procedure and fault handling functions.

/// Safe envelope intersection and fallback.
pub mod envelope;
/// Limit merging.
pub mod limits;

use indexmap::{IndexMap, IndexSet};
use tracing::debug;

use crate::{
    descriptor::{
        context::{Context, FeatureTag},
        FunctionFamily,
    },
    projector::CandidateData,
};

/// How a family picks its winner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionMode {
    /// Set-point richness decides ties; limits-only candidates contribute limits.
    Controller,
    /// One candidate wins, richness is whether it carries parameters.
    Single,
}

impl SelectionMode {
    /// Mode of a family. Safe envelopes are combined, not selected.
    #[must_use]
    pub const fn for_family(family: FunctionFamily) -> Option<Self> {
        match family {
            FunctionFamily::Controller => Some(Self::Controller),
            FunctionFamily::Procedure | FunctionFamily::FaultHandling => Some(Self::Single),
            FunctionFamily::SafeEnvelope => None,
        }
    }
}

/// Candidate that survived the context filter, with its intersection.
#[derive(Debug, Clone)]
pub struct Ranked<'c> {
    /// Candidate.
    pub candidate: &'c CandidateData,
    /// Declared features that the context prefers.
    pub intersection: IndexSet<FeatureTag>,
}

/// Outcome of a selection.
#[derive(Debug, Clone, PartialEq)]
pub struct Selection {
    /// Winning candidate, limits already merged.
    pub winner: CandidateData,
    /// Intersection of the winner with the context.
    pub intersection: IndexSet<FeatureTag>,
    /// Advisors whose limits were merged into the winner.
    pub contributors: Vec<String>,
}

/// Filters candidates against the context and orders them by intersection
/// size (descending), then advisor name. An empty context keeps everyone.
#[must_use]
pub fn rank<'c>(
    context: &Context,
    candidates: impl IntoIterator<Item = &'c CandidateData>,
) -> Vec<Ranked<'c>> {
    let mut ranked: Vec<Ranked<'c>> = candidates
        .into_iter()
        .filter_map(|candidate| {
            let intersection = context.intersect(&candidate.features);
            (context.is_empty() || !intersection.is_empty()).then_some(Ranked {
                candidate,
                intersection,
            })
        })
        .collect();
    ranked.sort_by(|a, b| {
        b.intersection
            .len()
            .cmp(&a.intersection.len())
            .then_with(|| a.candidate.advisor.cmp(&b.candidate.advisor))
    });
    ranked
}

fn same_set(a: &IndexSet<FeatureTag>, b: &IndexSet<FeatureTag>) -> bool {
    a.len() == b.len() && a.iter().all(|tag| b.contains(tag))
}

/// Among entries carrying exactly the top entry's intersection, the richest
/// one; earlier entries win ties.
fn pick_specific<'r, 'c>(
    ranked: &'r [Ranked<'c>],
    richness: impl Fn(&CandidateData) -> usize,
) -> Option<&'r Ranked<'c>> {
    let top = ranked.first()?;
    let best = ranked
        .iter()
        .filter(|entry| same_set(&entry.intersection, &top.intersection))
        .fold(None::<&Ranked<'c>>, |best, entry| match best {
            Some(current) if richness(current.candidate) >= richness(entry.candidate) => {
                Some(current)
            }
            _ => Some(entry),
        });
    best.or(Some(top))
}

/// Selects a controller winner. Candidates without set-points only compete
/// when nobody has one; otherwise their limits are merged into the winner.
#[must_use]
pub fn select_controller(
    context: &Context,
    candidates: &IndexMap<String, CandidateData>,
) -> Option<Selection> {
    let ranked = rank(context, candidates.values());
    let (with_set_points, only_limits): (Vec<_>, Vec<_>) = ranked
        .into_iter()
        .partition(|entry| entry.candidate.set_point_count() > 0);

    let chosen = pick_specific(&with_set_points, CandidateData::set_point_count)
        .or_else(|| only_limits.first())?;
    let mut winner = chosen.candidate.clone();
    let mut contributors = Vec::new();
    for entry in &only_limits {
        if entry.candidate.advisor == winner.advisor {
            continue;
        }
        limits::merge_candidate(&mut winner, entry.candidate);
        contributors.push(entry.candidate.advisor.clone());
    }
    debug!(
        winner = %winner.advisor,
        contributors = contributors.len(),
        "controller winner selected"
    );
    Some(Selection {
        winner,
        intersection: chosen.intersection.clone(),
        contributors,
    })
}

/// Selects a procedure or fault handling winner.
#[must_use]
pub fn select_single(
    context: &Context,
    candidates: &IndexMap<String, CandidateData>,
) -> Option<Selection> {
    let ranked = rank(context, candidates.values());
    let chosen = pick_specific(&ranked, |candidate| {
        usize::from(candidate.parameters.is_some())
    })?;
    debug!(winner = %chosen.candidate.advisor, "winner selected");
    Some(Selection {
        winner: chosen.candidate.clone(),
        intersection: chosen.intersection.clone(),
        contributors: Vec::new(),
    })
}

/// Dispatches to the selection routine of `mode`.
#[must_use]
pub fn select(
    mode: SelectionMode,
    context: &Context,
    candidates: &IndexMap<String, CandidateData>,
) -> Option<Selection> {
    match mode {
        SelectionMode::Controller => select_controller(context, candidates),
        SelectionMode::Single => select_single(context, candidates),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::projector::{ControllerSlot, LimitSlot, ParameterSlot, SetPointSlot};
    use blackboard_client::{DataValue, NodeIdentifier, QueryResult, QueryRow};
    use proptest::prelude::*;

    pub(crate) fn destination(id: &str) -> QueryResult {
        QueryResult {
            variables: vec!["?d".into()],
            rows: vec![QueryRow::new(vec![NodeIdentifier::new("ns", id)])],
        }
    }

    pub(crate) fn set_point(value: f64) -> SetPointSlot {
        SetPointSlot {
            value,
            measured_value: value,
            max_rate_of_change: 1.0,
            destination: destination("sp"),
        }
    }

    pub(crate) fn limit(is_min: bool, value: Option<f64>) -> LimitSlot {
        LimitSlot {
            is_min,
            value,
            max_rate_of_change: value.map(|_| 1.0),
            measured_value: None,
            destination: value.map(|_| destination("lim")),
        }
    }

    pub(crate) fn candidate(
        advisor: &str,
        features: &[&str],
        set_points: usize,
        limits: Vec<LimitSlot>,
    ) -> CandidateData {
        let mut controllers: Vec<ControllerSlot> = (0..set_points.max(1))
            .map(|i| ControllerSlot {
                set_point: (i < set_points).then(|| set_point(10.0 * (i + 1) as f64)),
                ..ControllerSlot::default()
            })
            .collect();
        controllers[0].limits = limits;
        CandidateData {
            advisor: advisor.into(),
            features: features.iter().map(|tag| FeatureTag::new(*tag)).collect(),
            parameters: None,
            controllers,
        }
    }

    fn context(tags: &[&str]) -> Context {
        Context::from_tags(tags.iter().map(|tag| FeatureTag::new(*tag)))
    }

    fn map(candidates: Vec<CandidateData>) -> IndexMap<String, CandidateData> {
        candidates
            .into_iter()
            .map(|c| (c.advisor.clone(), c))
            .collect()
    }

    #[test]
    fn richer_candidate_wins_equal_intersections_in_any_order() {
        let ctx = context(&["CuttingsTransportFeature"]);
        let a = candidate(
            "A",
            &["CuttingsTransportFeature", "RigActionPlanFeature"],
            2,
            Vec::new(),
        );
        let b = candidate("B", &["CuttingsTransportFeature"], 1, Vec::new());
        for order in [vec![a.clone(), b.clone()], vec![b, a]] {
            let selection = select_controller(&ctx, &map(order)).unwrap();
            assert_eq!(selection.winner.advisor, "A");
        }
    }

    #[test]
    fn top_ranked_intersection_is_preferred_over_richness() {
        let ctx = context(&["CuttingsTransportFeature", "DrillStemVibrationFeature"]);
        let narrow = candidate("Narrow", &["CuttingsTransportFeature"], 3, Vec::new());
        let wide = candidate(
            "Wide",
            &["CuttingsTransportFeature", "DrillStemVibrationFeature"],
            1,
            Vec::new(),
        );
        let selection = select_controller(&ctx, &map(vec![narrow, wide])).unwrap();
        assert_eq!(selection.winner.advisor, "Wide");
        assert_eq!(selection.intersection.len(), 2);
    }

    #[test]
    fn equal_counts_with_different_sets_keep_the_top_entry() {
        let ctx = context(&["CuttingsTransportFeature", "DrillStemVibrationFeature"]);
        let first = candidate("Alpha", &["CuttingsTransportFeature"], 1, Vec::new());
        let second = candidate("Beta", &["DrillStemVibrationFeature"], 4, Vec::new());
        let selection = select_controller(&ctx, &map(vec![second, first])).unwrap();
        assert_eq!(selection.winner.advisor, "Alpha");
    }

    #[test]
    fn limits_only_candidates_contribute_to_the_winner() {
        let ctx = context(&["CuttingsTransportFeature"]);
        let winner = candidate(
            "Sp",
            &["CuttingsTransportFeature"],
            1,
            vec![limit(false, Some(50.0)), limit(true, None)],
        );
        let limiter = candidate(
            "Lim",
            &["CuttingsTransportFeature"],
            0,
            vec![limit(false, Some(40.0)), limit(true, Some(5.0))],
        );
        let selection = select_controller(&ctx, &map(vec![winner, limiter])).unwrap();
        assert_eq!(selection.winner.advisor, "Sp");
        assert_eq!(selection.contributors, vec!["Lim".to_owned()]);
        let limits = &selection.winner.controllers[0].limits;
        assert_eq!(limits[0].value, Some(40.0));
        assert_eq!(limits[1].value, Some(5.0));
    }

    #[test]
    fn limits_only_winner_when_nobody_has_set_points() {
        let ctx = context(&[]);
        let a = candidate("A", &["RigActionPlanFeature"], 0, vec![limit(false, Some(40.0))]);
        let b = candidate("B", &["RigActionPlanFeature"], 0, vec![limit(false, Some(30.0))]);
        let selection = select_controller(&ctx, &map(vec![b, a])).unwrap();
        assert_eq!(selection.winner.advisor, "A");
        assert_eq!(selection.winner.controllers[0].limits[0].value, Some(30.0));
    }

    #[test]
    fn non_matching_candidates_are_dropped() {
        let ctx = context(&["DrillStemVibrationFeature"]);
        let a = candidate("A", &["CuttingsTransportFeature"], 1, Vec::new());
        assert!(select_controller(&ctx, &map(vec![a])).is_none());
    }

    #[test]
    fn single_selection_prefers_candidates_with_parameters() {
        let ctx = context(&["RigActionPlanFeature"]);
        let mut with = candidate("Z", &["RigActionPlanFeature"], 0, Vec::new());
        with.parameters = Some(ParameterSlot {
            value: DataValue::Text("{}".into()),
            destination: destination("p"),
        });
        let without = candidate("A", &["RigActionPlanFeature"], 0, Vec::new());
        let selection = select(SelectionMode::Single, &ctx, &map(vec![without, with])).unwrap();
        assert_eq!(selection.winner.advisor, "Z");
    }

    const TAGS: [&str; 3] = [
        "CuttingsTransportFeature",
        "DrillStemVibrationFeature",
        "RigActionPlanFeature",
    ];

    fn tags() -> impl Strategy<Value = Vec<&'static str>> {
        proptest::sample::subsequence(TAGS.to_vec(), 0..=TAGS.len())
    }

    proptest! {
        #[test]
        fn winner_intersects_a_non_empty_context(
            ctx in tags(),
            declared in proptest::collection::vec((tags(), 0usize..3), 1..6),
        ) {
            let candidates: Vec<CandidateData> = declared
                .iter()
                .enumerate()
                .map(|(i, (features, set_points))| {
                    candidate(&format!("adv{i}"), features, *set_points, Vec::new())
                })
                .collect();
            let ctx = context(&ctx);
            if let Some(selection) = select_controller(&ctx, &map(candidates)) {
                if !ctx.is_empty() {
                    prop_assert!(!ctx.intersect(&selection.winner.features).is_empty());
                }
            }
        }
    }
}

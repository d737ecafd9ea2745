use serde::{Deserialize, Serialize};

use super::table::{LookupTable, Table1D, Table2D};
use crate::{
    arbitration::envelope::intersect_tables,
    error::{ComposerError, ComposerResult},
};

/// Side of the operating region a table bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bound {
    /// Ceiling: combined with `min`.
    Upper,
    /// Floor: combined with `max`.
    Lower,
}

impl Bound {
    /// Most restrictive of two bound values.
    #[must_use]
    pub fn combine(self, a: f64, b: f64) -> f64 {
        match self {
            Self::Upper => a.min(b),
            Self::Lower => a.max(b),
        }
    }
}

/// Parameter object made of bound tables that can be intersected field by field.
pub trait EnvelopeParameters: Sized {
    /// Intersects every table field across `sources`. A field absent from
    /// every source stays absent; any failing field fails the whole object.
    fn intersect(sources: &[&Self]) -> ComposerResult<Self>;
}

fn intersect_field<'a, S, T>(
    sources: &[&'a S],
    get: impl Fn(&'a S) -> Option<&'a T>,
    bound: Bound,
) -> ComposerResult<Option<T>>
where
    T: LookupTable + 'a,
{
    let tables: Vec<&T> = sources.iter().filter_map(|source| get(*source)).collect();
    if tables.is_empty() {
        return Ok(None);
    }
    intersect_tables(&tables, bound).map(Some)
}

/// Safe operating envelope published by envelope advisors.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SafeOperatingEnvelope {
    /// Maximum flowrate against depth.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_flowrate: Option<Table1D>,
    /// Minimum flowrate against depth.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_flowrate: Option<Table1D>,
    /// Maximum rotational speed against depth and flowrate.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_rotational_speed: Option<Table2D>,
    /// Maximum weight on bit against depth.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_weight_on_bit: Option<Table1D>,
    /// Maximum torque against depth and rotational speed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_torque: Option<Table2D>,
}

impl SafeOperatingEnvelope {
    /// Decodes an envelope payload.
    pub fn decode(payload: &str) -> ComposerResult<Self> {
        let envelope: Self = serde_json::from_str(payload)?;
        if envelope.is_empty() {
            return Err(ComposerError::Decode("envelope without any table".into()));
        }
        Ok(envelope)
    }

    /// True when no table is present.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.max_flowrate.is_none()
            && self.min_flowrate.is_none()
            && self.max_rotational_speed.is_none()
            && self.max_weight_on_bit.is_none()
            && self.max_torque.is_none()
    }
}

impl EnvelopeParameters for SafeOperatingEnvelope {
    fn intersect(sources: &[&Self]) -> ComposerResult<Self> {
        Ok(Self {
            max_flowrate: intersect_field(sources, |s| s.max_flowrate.as_ref(), Bound::Upper)?,
            min_flowrate: intersect_field(sources, |s| s.min_flowrate.as_ref(), Bound::Lower)?,
            max_rotational_speed: intersect_field(
                sources,
                |s| s.max_rotational_speed.as_ref(),
                Bound::Upper,
            )?,
            max_weight_on_bit: intersect_field(
                sources,
                |s| s.max_weight_on_bit.as_ref(),
                Bound::Upper,
            )?,
            max_torque: intersect_field(sources, |s| s.max_torque.as_ref(), Bound::Upper)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flow(axis: Vec<f64>, values: Vec<f64>) -> Table1D {
        Table1D::new(axis, values.into_iter().map(Some).collect()).unwrap()
    }

    #[test]
    fn fields_combine_with_their_bound() {
        let a = SafeOperatingEnvelope {
            max_flowrate: Some(flow(vec![0.0, 100.0], vec![3.0, 3.0])),
            min_flowrate: Some(flow(vec![0.0, 100.0], vec![1.0, 1.0])),
            ..SafeOperatingEnvelope::default()
        };
        let b = SafeOperatingEnvelope {
            max_flowrate: Some(flow(vec![0.0, 100.0], vec![2.5, 4.0])),
            min_flowrate: Some(flow(vec![0.0, 100.0], vec![1.5, 0.5])),
            ..SafeOperatingEnvelope::default()
        };
        let combined = SafeOperatingEnvelope::intersect(&[&a, &b]).unwrap();
        assert_eq!(
            combined.max_flowrate.unwrap().values(),
            &[Some(2.5), Some(3.0)]
        );
        assert_eq!(
            combined.min_flowrate.unwrap().values(),
            &[Some(1.5), Some(1.0)]
        );
        assert!(combined.max_torque.is_none());
    }

    #[test]
    fn decode_requires_a_table() {
        assert!(SafeOperatingEnvelope::decode("{}").is_err());
        let payload = r#"{"max_flowrate":{"axis":[0.0,1.0],"values":[2.0,null]}}"#;
        let envelope = SafeOperatingEnvelope::decode(payload).unwrap();
        assert_eq!(envelope.max_flowrate.unwrap().values(), &[Some(2.0), None]);
    }
}

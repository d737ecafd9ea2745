use std::fmt;

use indexmap::IndexSet;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::{ComposerError, ComposerResult};

/// Drilling features known without configuration.
pub const DEFAULT_FEATURES: &[&str] = &[
    "CuttingsTransportFeature",
    "DrillStemVibrationFeature",
    "RigActionPlanFeature",
];

/// Opaque capability symbol.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FeatureTag(String);

impl FeatureTag {
    /// Builds a tag without catalog validation.
    #[must_use]
    pub fn new(tag: impl Into<String>) -> Self {
        Self(tag.into())
    }

    /// Tag text.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FeatureTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Raw column text that does not name a known feature.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown feature tag: {0}")]
pub struct UnknownFeature(pub String);

/// Vocabulary of accepted feature tags.
#[derive(Debug, Clone)]
pub struct FeatureCatalog {
    known: IndexSet<String>,
}

impl Default for FeatureCatalog {
    fn default() -> Self {
        Self::new(std::iter::empty::<String>())
    }
}

impl FeatureCatalog {
    /// Default vocabulary extended with `extra` tags.
    pub fn new<I, S>(extra: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut known: IndexSet<String> =
            DEFAULT_FEATURES.iter().map(|f| (*f).to_owned()).collect();
        known.extend(extra.into_iter().map(Into::into));
        Self { known }
    }

    /// Parses raw column text. IRI prefixes up to the last `#` or `/` are ignored.
    pub fn parse(&self, raw: &str) -> Result<FeatureTag, UnknownFeature> {
        let local = raw
            .rsplit(|c: char| c == '#' || c == '/')
            .next()
            .unwrap_or(raw)
            .trim();
        if self.known.contains(local) {
            Ok(FeatureTag(local.to_owned()))
        } else {
            Err(UnknownFeature(raw.to_owned()))
        }
    }

    /// Number of known tags.
    #[must_use]
    pub fn len(&self) -> usize {
        self.known.len()
    }

    /// True when the vocabulary is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.known.is_empty()
    }
}

/// Current scheduling preference: an ordered feature set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Context {
    /// Preferred features.
    pub preferences: IndexSet<FeatureTag>,
}

#[derive(Deserialize)]
struct ContextWire {
    #[serde(default)]
    capability_preferences: Vec<String>,
}

impl Context {
    /// Decodes a published context. Unknown tags are dropped; a non-empty
    /// list with no known tag is rejected, so only a literally empty list
    /// means no preference.
    pub fn decode(payload: &str, catalog: &FeatureCatalog) -> ComposerResult<Self> {
        let wire: ContextWire = serde_json::from_str(payload)?;
        let preferences: IndexSet<FeatureTag> = wire
            .capability_preferences
            .iter()
            .filter_map(|raw| catalog.parse(raw).ok())
            .collect();
        if preferences.is_empty() && !wire.capability_preferences.is_empty() {
            return Err(ComposerError::Decode(format!(
                "no known feature in context preferences {:?}",
                wire.capability_preferences
            )));
        }
        Ok(Self { preferences })
    }

    /// Context from already parsed tags.
    #[must_use]
    pub fn from_tags(tags: impl IntoIterator<Item = FeatureTag>) -> Self {
        Self {
            preferences: tags.into_iter().collect(),
        }
    }

    /// Intersection of a feature set with the preferences, in preference order.
    #[must_use]
    pub fn intersect(&self, features: &IndexSet<FeatureTag>) -> IndexSet<FeatureTag> {
        self.preferences
            .iter()
            .filter(|tag| features.contains(*tag))
            .cloned()
            .collect()
    }

    /// True when no preference has been expressed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.preferences.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_iri_prefixes() {
        let catalog = FeatureCatalog::new(["HoleCleaningFeature"]);
        assert_eq!(
            catalog
                .parse("http://ddhub.no/Vocabulary#CuttingsTransportFeature")
                .unwrap()
                .as_str(),
            "CuttingsTransportFeature"
        );
        assert!(catalog.parse("ddhub/HoleCleaningFeature").is_ok());
        assert_eq!(
            catalog.parse("Nonsense"),
            Err(UnknownFeature("Nonsense".into()))
        );
    }

    #[test]
    fn decodes_context_and_drops_unknown_tags() {
        let catalog = FeatureCatalog::default();
        let context = Context::decode(
            r#"{"capability_preferences":["RigActionPlanFeature","Bogus","CuttingsTransportFeature"]}"#,
            &catalog,
        )
        .unwrap();
        let tags: Vec<&str> = context.preferences.iter().map(FeatureTag::as_str).collect();
        assert_eq!(tags, ["RigActionPlanFeature", "CuttingsTransportFeature"]);
        assert!(Context::decode("{}", &catalog).unwrap().is_empty());
        assert!(Context::decode("not json", &catalog).is_err());
    }

    #[test]
    fn context_of_only_unknown_tags_is_rejected() {
        let catalog = FeatureCatalog::default();
        let err = Context::decode(r#"{"capability_preferences":["HoleCleaningFeature"]}"#, &catalog)
            .unwrap_err();
        assert!(matches!(err, ComposerError::Decode(_)));
        assert!(Context::decode(r#"{"capability_preferences":[]}"#, &catalog)
            .unwrap()
            .is_empty());
    }
}

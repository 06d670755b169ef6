//! Display sets and the attribute values that rules are evaluated against.
//!
//! A display set is a renderable grouping of image instances (usually one
//! series).  It is owned by the viewer's data layer; the engine only reads its
//! attributes and refers to it by UID.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Unique identifier of a display set.
pub type DisplaySetUid = String;

/// Attribute name reporting the modality of a series (e.g. `"CT"`).
pub const MODALITY: &str = "Modality";
/// Attribute name reporting the acquisition plane (e.g. `"axial"`).
pub const ORIENTATION: &str = "Orientation";

/// A dynamically typed attribute value.
///
/// Deserializes untagged, so TOML/JSON authors write plain literals:
/// `equals = "CT"`, `greater_than = 4`, `equals = true`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    List(Vec<AttributeValue>),
}

impl AttributeValue {
    /// Returns the value as a number when it is numeric (or numeric text).
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            AttributeValue::Int(v) => Some(*v as f64),
            AttributeValue::Float(v) => Some(*v),
            AttributeValue::Text(s) => s.trim().parse().ok(),
            AttributeValue::Bool(_) | AttributeValue::List(_) => None,
        }
    }

    /// Returns the value as text, if it is text.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttributeValue::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Equality that treats `Int(4)` and `Float(4.0)` as equal and compares
    /// text case-sensitively.
    pub fn loose_eq(&self, other: &AttributeValue) -> bool {
        match (self, other) {
            (AttributeValue::List(a), AttributeValue::List(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.loose_eq(y))
            }
            (AttributeValue::Bool(a), AttributeValue::Bool(b)) => a == b,
            (AttributeValue::Text(a), AttributeValue::Text(b)) => a == b,
            (a, b) => match (a.as_numeric(), b.as_numeric()) {
                (Some(x), Some(y)) => x == y,
                _ => false,
            },
        }
    }

    // Strictly numeric variants only; text never compares equal to a number.
    fn as_numeric(&self) -> Option<f64> {
        match self {
            AttributeValue::Int(v) => Some(*v as f64),
            AttributeValue::Float(v) => Some(*v),
            _ => None,
        }
    }
}

impl From<&str> for AttributeValue {
    fn from(value: &str) -> Self {
        AttributeValue::Text(value.to_string())
    }
}

impl From<String> for AttributeValue {
    fn from(value: String) -> Self {
        AttributeValue::Text(value)
    }
}

impl From<i64> for AttributeValue {
    fn from(value: i64) -> Self {
        AttributeValue::Int(value)
    }
}

impl From<f64> for AttributeValue {
    fn from(value: f64) -> Self {
        AttributeValue::Float(value)
    }
}

impl From<bool> for AttributeValue {
    fn from(value: bool) -> Self {
        AttributeValue::Bool(value)
    }
}

/// Anything a matching rule can be evaluated against.
///
/// Values are returned owned because some subjects (see [`StudySubject`])
/// derive their attributes on demand.
pub trait AttributeSource {
    fn attribute(&self, name: &str) -> Option<AttributeValue>;
}

/// An externally owned series handle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DisplaySet {
    pub uid: DisplaySetUid,
    pub study_instance_uid: String,
    #[serde(default)]
    pub attributes: BTreeMap<String, AttributeValue>,
}

impl DisplaySet {
    pub fn new(uid: impl Into<String>, study_instance_uid: impl Into<String>) -> Self {
        Self {
            uid: uid.into(),
            study_instance_uid: study_instance_uid.into(),
            attributes: BTreeMap::new(),
        }
    }

    /// Builder-style attribute setter, mostly used by fixtures.
    pub fn with(mut self, name: &str, value: impl Into<AttributeValue>) -> Self {
        self.attributes.insert(name.to_string(), value.into());
        self
    }

    pub fn modality(&self) -> Option<&str> {
        self.attributes.get(MODALITY).and_then(AttributeValue::as_str)
    }

    pub fn orientation(&self) -> Option<&str> {
        self.attributes.get(ORIENTATION).and_then(AttributeValue::as_str)
    }
}

impl AttributeSource for DisplaySet {
    fn attribute(&self, name: &str) -> Option<AttributeValue> {
        match name {
            "DisplaySetInstanceUID" => Some(AttributeValue::Text(self.uid.clone())),
            "StudyInstanceUID" => Some(AttributeValue::Text(self.study_instance_uid.clone())),
            _ => self.attributes.get(name).cloned(),
        }
    }
}

/// Study-level view over the display sets of one study, used for
/// protocol-level matching rules.
///
/// Derived attributes:
/// - `StudyInstanceUID`
/// - `ModalitiesInStudy`: distinct modalities in declaration order
/// - `NumberOfDisplaySets`
///
/// Any other attribute resolves to the value shared by every series that has
/// it, or to the distinct list of values when the series disagree.
pub struct StudySubject<'a> {
    pub study_instance_uid: &'a str,
    pub display_sets: &'a [DisplaySet],
}

impl<'a> StudySubject<'a> {
    pub fn new(study_instance_uid: &'a str, display_sets: &'a [DisplaySet]) -> Self {
        Self {
            study_instance_uid,
            display_sets,
        }
    }

    fn distinct(&self, name: &str) -> Vec<AttributeValue> {
        let mut values: Vec<AttributeValue> = Vec::new();
        for ds in self.display_sets {
            if let Some(v) = ds.attributes.get(name) {
                if !values.iter().any(|seen| seen.loose_eq(v)) {
                    values.push(v.clone());
                }
            }
        }
        values
    }
}

impl AttributeSource for StudySubject<'_> {
    fn attribute(&self, name: &str) -> Option<AttributeValue> {
        match name {
            "StudyInstanceUID" => Some(AttributeValue::Text(self.study_instance_uid.to_string())),
            "ModalitiesInStudy" => Some(AttributeValue::List(self.distinct(MODALITY))),
            "NumberOfDisplaySets" => Some(AttributeValue::Int(self.display_sets.len() as i64)),
            _ => {
                let mut values = self.distinct(name);
                match values.len() {
                    0 => None,
                    1 => values.pop(),
                    _ => Some(AttributeValue::List(values)),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ct(uid: &str) -> DisplaySet {
        DisplaySet::new(uid, "1.2.3").with(MODALITY, "CT")
    }

    #[test]
    fn test_loose_eq_treats_int_and_float_as_equal() {
        assert!(AttributeValue::Int(4).loose_eq(&AttributeValue::Float(4.0)));
    }

    #[test]
    fn test_loose_eq_does_not_equate_text_with_number() {
        assert!(!AttributeValue::from("4").loose_eq(&AttributeValue::Int(4)));
    }

    #[test]
    fn test_as_f64_parses_numeric_text() {
        assert_eq!(AttributeValue::from(" 12.5 ").as_f64(), Some(12.5));
        assert_eq!(AttributeValue::Bool(true).as_f64(), None);
    }

    #[test]
    fn test_display_set_exposes_uid_as_attribute() {
        let ds = ct("ds-1");
        assert_eq!(
            ds.attribute("DisplaySetInstanceUID"),
            Some(AttributeValue::from("ds-1"))
        );
        assert_eq!(ds.attribute("Missing"), None);
    }

    #[test]
    fn test_study_subject_collects_distinct_modalities_in_order() {
        let sets = vec![
            ct("a"),
            DisplaySet::new("b", "1.2.3").with(MODALITY, "PT"),
            ct("c"),
        ];
        let study = StudySubject::new("1.2.3", &sets);

        assert_eq!(
            study.attribute("ModalitiesInStudy"),
            Some(AttributeValue::List(vec!["CT".into(), "PT".into()]))
        );
        assert_eq!(study.attribute("NumberOfDisplaySets"), Some(AttributeValue::Int(3)));
    }

    #[test]
    fn test_study_subject_returns_shared_value_when_series_agree() {
        let sets = vec![ct("a"), ct("b")];
        let study = StudySubject::new("1.2.3", &sets);
        assert_eq!(study.attribute(MODALITY), Some(AttributeValue::from("CT")));
    }

    #[test]
    fn test_study_subject_returns_none_for_attribute_no_series_has() {
        let sets = vec![ct("a")];
        let study = StudySubject::new("1.2.3", &sets);
        assert_eq!(study.attribute("SliceThickness"), None);
    }
}

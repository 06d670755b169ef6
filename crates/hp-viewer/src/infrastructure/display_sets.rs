//! In-memory display set source.
//!
//! Stands in for the viewer's data layer: series are added as they "arrive"
//! and can be flagged as still loading.  A study can be read from a JSON
//! fixture:
//!
//! ```json
//! {
//!   "display_sets": [
//!     { "uid": "ct-1", "study_instance_uid": "1.2.3",
//!       "attributes": { "Modality": "CT", "numImageFrames": 120 },
//!       "loading": true }
//!   ]
//! }
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::{PoisonError, RwLock};

use hp_core::{AttributeValue, DisplaySet, DisplaySetUid};
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use crate::application::ports::{DisplaySetEvent, DisplaySetProvider};

#[derive(Debug, Error)]
pub enum StudyLoadError {
    #[error("I/O error reading study at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse study JSON: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Debug, Deserialize)]
struct StudyFile {
    display_sets: Vec<StudyEntry>,
}

#[derive(Debug, Deserialize)]
struct StudyEntry {
    uid: DisplaySetUid,
    study_instance_uid: String,
    #[serde(default)]
    attributes: BTreeMap<String, AttributeValue>,
    #[serde(default)]
    loading: bool,
}

#[derive(Debug, Default)]
struct Inner {
    display_sets: Vec<DisplaySet>,
    loading: BTreeSet<DisplaySetUid>,
}

#[derive(Debug, Default)]
pub struct InMemoryDisplaySetProvider {
    inner: RwLock<Inner>,
}

impl InMemoryDisplaySetProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a study fixture.
    ///
    /// # Errors
    ///
    /// [`StudyLoadError::Parse`] for malformed JSON.
    pub fn from_json(text: &str) -> Result<Self, StudyLoadError> {
        let file: StudyFile = serde_json::from_str(text)?;
        let provider = Self::new();
        for entry in file.display_sets {
            provider.set_loading(&entry.uid, entry.loading);
            provider.add(vec![DisplaySet {
                uid: entry.uid,
                study_instance_uid: entry.study_instance_uid,
                attributes: entry.attributes,
            }]);
        }
        Ok(provider)
    }

    /// Reads a study fixture from disk.
    ///
    /// # Errors
    ///
    /// [`StudyLoadError::Io`] when the file cannot be read, otherwise as
    /// [`Self::from_json`].
    pub fn from_file(path: &Path) -> Result<Self, StudyLoadError> {
        let text = std::fs::read_to_string(path).map_err(|source| StudyLoadError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&text)
    }

    /// Adds or replaces display sets by uid and returns the event to forward
    /// to the controller.
    pub fn add(&self, display_sets: Vec<DisplaySet>) -> DisplaySetEvent {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let mut added = Vec::new();
        let mut changed = Vec::new();
        for ds in display_sets {
            match inner.display_sets.iter().position(|d| d.uid == ds.uid) {
                Some(index) => {
                    changed.push(ds.uid.clone());
                    inner.display_sets[index] = ds;
                }
                None => {
                    added.push(ds.uid.clone());
                    inner.display_sets.push(ds);
                }
            }
        }
        debug!(added = added.len(), changed = changed.len(), "display sets updated");
        if added.is_empty() {
            DisplaySetEvent::Changed(changed)
        } else {
            added.extend(changed);
            DisplaySetEvent::Added(added)
        }
    }

    pub fn set_loading(&self, display_set_uid: &str, loading: bool) {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if loading {
            inner.loading.insert(display_set_uid.to_string());
        } else {
            inner.loading.remove(display_set_uid);
        }
    }

    pub fn uids(&self) -> Vec<DisplaySetUid> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner.display_sets.iter().map(|d| d.uid.clone()).collect()
    }
}

impl DisplaySetProvider for InMemoryDisplaySetProvider {
    fn active_display_sets(&self) -> Vec<DisplaySet> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .display_sets
            .clone()
    }

    fn is_loading(&self, display_set_uid: &str) -> bool {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .loading
            .contains(display_set_uid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hp_core::MODALITY;

    const STUDY: &str = r#"{
        "display_sets": [
            { "uid": "ct-1", "study_instance_uid": "1.2.3",
              "attributes": { "Modality": "CT", "numImageFrames": 120 } },
            { "uid": "ct-2", "study_instance_uid": "1.2.3",
              "attributes": { "Modality": "CT" }, "loading": true }
        ]
    }"#;

    #[test]
    fn test_from_json_reads_sets_in_order_with_loading_flags() {
        // Act
        let provider = InMemoryDisplaySetProvider::from_json(STUDY).expect("valid study");

        // Assert
        assert_eq!(provider.uids(), ["ct-1", "ct-2"]);
        assert_eq!(provider.active_display_sets()[0].modality(), Some("CT"));
        assert!(!provider.is_loading("ct-1"));
        assert!(provider.is_loading("ct-2"));
    }

    #[test]
    fn test_add_reports_added_then_changed() {
        let provider = InMemoryDisplaySetProvider::new();
        let ds = DisplaySet::new("mr-1", "9").with(MODALITY, "MR");

        assert_eq!(provider.add(vec![ds.clone()]), DisplaySetEvent::Added(vec!["mr-1".into()]));
        assert_eq!(provider.add(vec![ds]), DisplaySetEvent::Changed(vec!["mr-1".into()]));
        assert_eq!(provider.active_display_sets().len(), 1);
    }

    #[test]
    fn test_set_loading_clears_flag() {
        let provider = InMemoryDisplaySetProvider::from_json(STUDY).unwrap();
        provider.set_loading("ct-2", false);
        assert!(!provider.is_loading("ct-2"));
    }

    #[test]
    fn test_malformed_study_is_a_parse_error() {
        assert!(matches!(
            InMemoryDisplaySetProvider::from_json("{ \"display_sets\": 3 }"),
            Err(StudyLoadError::Parse(_))
        ));
    }
}

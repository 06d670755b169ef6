//! Protocol matcher: picks the best protocol for a study and binds series to
//! the chosen protocol's display set selectors.
//!
//! # Tie-breaks
//!
//! Both levels use "highest score wins, earliest declaration wins ties":
//!
//! - protocols are compared in library (or candidate list) order;
//! - series are compared in the order the display set provider lists them.
//!
//! This order dependence is kept for compatibility with existing protocol
//! libraries and is not configurable.

use std::collections::BTreeMap;

use thiserror::Error;
use tracing::debug;

use super::display_set::{DisplaySet, DisplaySetUid, StudySubject};
use super::protocol::{Protocol, ProtocolLibrary};
use super::rules::score;

/// Errors the matcher cannot recover from on its own.
#[derive(Debug, Error, PartialEq)]
pub enum MatchError {
    /// Nothing matched and the configured fallback protocol is not loaded.
    #[error("no protocol matched and default protocol '{0}' is not loaded")]
    DefaultProtocolMissing(String),
}

/// Ranked series per selector id.
///
/// Every selector declared by the protocol has an entry, possibly empty, so a
/// slot referencing an undeclared selector can be told apart from a selector
/// that simply matched nothing.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DisplaySetSelectorMap {
    matches: BTreeMap<String, Vec<DisplaySetUid>>,
}

impl DisplaySetSelectorMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, selector_id: impl Into<String>, ranked: Vec<DisplaySetUid>) {
        self.matches.insert(selector_id.into(), ranked);
    }

    pub fn contains_selector(&self, selector_id: &str) -> bool {
        self.matches.contains_key(selector_id)
    }

    /// Ranked matches of a selector (best first).
    pub fn matches(&self, selector_id: &str) -> &[DisplaySetUid] {
        self.matches.get(selector_id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Resolves one `(selector, match_index)` reference to at most one series.
    pub fn resolve(&self, selector_id: &str, match_index: usize) -> Option<&str> {
        self.matches(selector_id).get(match_index).map(String::as_str)
    }

    pub fn selector_ids(&self) -> impl Iterator<Item = &str> {
        self.matches.keys().map(String::as_str)
    }
}

/// Best protocol for a study.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolMatch {
    pub protocol_id: String,
    pub score: u32,
}

/// Outcome of a full matching run.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchOutcome {
    pub protocol_id: String,
    pub selector_map: DisplaySetSelectorMap,
    /// `true` when no candidate was eligible and the default protocol was used.
    pub fell_back: bool,
}

/// Picks the highest-scoring eligible protocol; the first one wins ties.
pub fn best_protocol<'p>(
    candidates: impl IntoIterator<Item = &'p Protocol>,
    study: &StudySubject<'_>,
) -> Option<ProtocolMatch> {
    let mut best: Option<ProtocolMatch> = None;
    for protocol in candidates {
        let Some(s) = score(&protocol.matching_rules, study) else {
            debug!(protocol = %protocol.id, "protocol rejected by required rule");
            continue;
        };
        // Strictly greater keeps the earliest protocol on ties.
        if best.as_ref().map_or(true, |b| s > b.score) {
            best = Some(ProtocolMatch {
                protocol_id: protocol.id.clone(),
                score: s,
            });
        }
    }
    best
}

/// Ranks the series for every selector of `protocol`.
pub fn match_selectors(protocol: &Protocol, display_sets: &[DisplaySet]) -> DisplaySetSelectorMap {
    let mut map = DisplaySetSelectorMap::new();
    for (selector_id, selector) in &protocol.display_set_selectors {
        let mut scored: Vec<(u32, usize, &DisplaySet)> = display_sets
            .iter()
            .enumerate()
            .filter_map(|(order, ds)| {
                score(&selector.series_matching_rules, ds).map(|s| (s, order, ds))
            })
            .collect();
        // Highest score first, then declaration order.
        scored.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
        map.insert(
            selector_id.clone(),
            scored.into_iter().map(|(_, _, ds)| ds.uid.clone()).collect(),
        );
    }
    map
}

/// Restricts `display_sets` to one study when any of them belongs to it.
pub fn study_display_sets(study_uid: &str, display_sets: &[DisplaySet]) -> Vec<DisplaySet> {
    let own: Vec<DisplaySet> = display_sets
        .iter()
        .filter(|ds| ds.study_instance_uid == study_uid)
        .cloned()
        .collect();
    if own.is_empty() {
        display_sets.to_vec()
    } else {
        own
    }
}

/// Runs protocol selection followed by selector binding.
pub struct ProtocolMatcher {
    default_protocol_id: String,
}

impl ProtocolMatcher {
    pub fn new(default_protocol_id: impl Into<String>) -> Self {
        Self {
            default_protocol_id: default_protocol_id.into(),
        }
    }

    pub fn default_protocol_id(&self) -> &str {
        &self.default_protocol_id
    }

    /// Matches `candidates` (in order) against the study.
    ///
    /// When none is eligible, the default protocol is taken from `library`
    /// and the outcome is flagged `fell_back`.
    ///
    /// # Errors
    ///
    /// Returns [`MatchError::DefaultProtocolMissing`] when the fallback is needed
    /// but not loaded.
    pub fn run<'p>(
        &self,
        candidates: impl IntoIterator<Item = &'p Protocol>,
        library: &ProtocolLibrary,
        study_uid: &str,
        display_sets: &[DisplaySet],
    ) -> Result<MatchOutcome, MatchError> {
        let study_sets = study_display_sets(study_uid, display_sets);
        let subject = StudySubject::new(study_uid, &study_sets);

        let (protocol, fell_back) = match best_protocol(candidates, &subject)
            .and_then(|m| library.get(&m.protocol_id))
        {
            Some(p) => (p, false),
            None => {
                let fallback = library
                    .get(&self.default_protocol_id)
                    .ok_or_else(|| MatchError::DefaultProtocolMissing(self.default_protocol_id.clone()))?;
                (fallback, true)
            }
        };

        debug!(protocol = %protocol.id, fell_back, "protocol selected");
        Ok(MatchOutcome {
            protocol_id: protocol.id.clone(),
            selector_map: match_selectors(protocol, &study_sets),
            fell_back,
        })
    }
}

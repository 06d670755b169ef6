//! Declarative protocol model.
//!
//! Protocols are authored externally (see the TOML libraries shipped with the
//! viewer) and are immutable once loaded.  A protocol describes:
//!
//! - **matching rules** deciding whether the protocol fits a study,
//! - **display set selectors** binding series to named roles,
//! - **stages**: alternative layouts (one-up, 2×2, MPR, …), each a grid shape
//!   plus one slot spec per viewport.
//!
//! ```text
//! Protocol ──► Stage[0] ── layout 1×3 ── SlotSpec(axial) SlotSpec(sagittal) SlotSpec(coronal)
//!          └─► Stage[1] ── layout 2×2 ── …
//! ```

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use super::display_set::AttributeValue;
use super::rules::Rule;

/// Identifier of a viewport within a grid.
pub type ViewportId = String;

/// Rows × columns of a stage or grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GridLayout {
    pub rows: u32,
    pub cols: u32,
}

impl GridLayout {
    pub const ONE_UP: GridLayout = GridLayout { rows: 1, cols: 1 };

    pub fn new(rows: u32, cols: u32) -> Self {
        Self { rows, cols }
    }

    pub fn capacity(&self) -> usize {
        (self.rows as usize) * (self.cols as usize)
    }
}

impl fmt::Display for GridLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.rows, self.cols)
    }
}

/// Whether a stage can be navigated to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    #[default]
    Enabled,
    Disabled,
}

/// Kind of cross-viewport synchronization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncGroupType {
    /// Camera pan and zoom.
    ZoomPan,
    /// Window width / level.
    Voi,
    /// Frame (image) index.
    FrameView,
}

impl fmt::Display for SyncGroupType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SyncGroupType::ZoomPan => "zoompan",
            SyncGroupType::Voi => "voi",
            SyncGroupType::FrameView => "frameview",
        };
        f.write_str(name)
    }
}

/// Membership of one slot's viewport in a named sync group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncGroupSpec {
    #[serde(rename = "type")]
    pub kind: SyncGroupType,
    pub id: String,
    #[serde(default = "default_true")]
    pub source: bool,
    #[serde(default = "default_true")]
    pub target: bool,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub options: BTreeMap<String, AttributeValue>,
}

impl SyncGroupSpec {
    /// A source+target membership with no options.
    pub fn new(kind: SyncGroupType, id: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
            source: true,
            target: true,
            options: BTreeMap::new(),
        }
    }

    /// Explicit frame offset for frame-view groups (`viewport_index` option).
    pub fn viewport_index(&self) -> Option<i64> {
        self.options
            .get("viewport_index")
            .and_then(AttributeValue::as_f64)
            .map(|v| v as i64)
    }
}

/// Rendering mode of a viewport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViewportType {
    #[default]
    Stack,
    Volume,
    Volume3d,
}

/// Per-viewport configuration carried from the slot spec into the grid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViewportOptions {
    #[serde(default)]
    pub viewport_type: ViewportType,
    #[serde(default = "default_tool_group")]
    pub tool_group_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub orientation: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sync_groups: Vec<SyncGroupSpec>,
}

impl Default for ViewportOptions {
    fn default() -> Self {
        Self {
            viewport_type: ViewportType::default(),
            tool_group_id: default_tool_group(),
            orientation: None,
            sync_groups: Vec::new(),
        }
    }
}

/// Reference from a slot to the `match_index`-th series matched by a selector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DisplaySetRef {
    pub selector_id: String,
    #[serde(default)]
    pub match_index: usize,
    /// Options applied to the display set in this viewport (e.g. a VOI preset).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub options: BTreeMap<String, AttributeValue>,
}

impl DisplaySetRef {
    pub fn new(selector_id: impl Into<String>) -> Self {
        Self {
            selector_id: selector_id.into(),
            match_index: 0,
            options: BTreeMap::new(),
        }
    }
}

/// One viewport's configuration within a stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlotSpec {
    /// Viewport id; generated from the position when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub viewport_id: Option<ViewportId>,
    /// The primary slot becomes the active viewport.
    #[serde(default)]
    pub primary: bool,
    #[serde(default)]
    pub viewport_options: ViewportOptions,
    #[serde(default)]
    pub display_set_refs: Vec<DisplaySetRef>,
}

/// One layout variant of a protocol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stage {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub layout: GridLayout,
    #[serde(default)]
    pub slots: Vec<SlotSpec>,
    #[serde(default)]
    pub status: StageStatus,
}

impl Stage {
    pub fn is_enabled(&self) -> bool {
        self.status == StageStatus::Enabled
    }
}

/// Series-level rules for one named selector.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DisplaySetSelector {
    #[serde(default)]
    pub series_matching_rules: Vec<Rule>,
}

/// Hooks a protocol asks the controller to run.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ProtocolCallbacks {
    /// Name of a registered layout hook consulted before any grid reshape.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_layout_change: Option<String>,
}

/// A complete hanging protocol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Protocol {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub matching_rules: Vec<Rule>,
    #[serde(default)]
    pub display_set_selectors: BTreeMap<String, DisplaySetSelector>,
    /// Template for viewports created by a free-form grid reshape.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_viewport: Option<SlotSpec>,
    pub stages: Vec<Stage>,
    #[serde(default)]
    pub tool_group_ids: Vec<String>,
    #[serde(default)]
    pub callbacks: ProtocolCallbacks,
}

impl Protocol {
    pub fn stage(&self, index: usize) -> Option<&Stage> {
        self.stages.get(index)
    }

    /// Resolves a stage reference to an index.  An explicit index wins over an id;
    /// neither yields `None`.
    pub fn stage_index(&self, stage_id: Option<&str>, stage_index: Option<usize>) -> Option<usize> {
        if let Some(index) = stage_index {
            return (index < self.stages.len()).then_some(index);
        }
        let id = stage_id?;
        self.stages.iter().position(|s| s.id == id)
    }
}

/// Ordered collection of loaded protocols.
///
/// Order matters: it is the tie-break order used by the matcher.
#[derive(Debug, Clone, Default)]
pub struct ProtocolLibrary {
    protocols: Vec<Protocol>,
}

impl ProtocolLibrary {
    pub fn new(protocols: Vec<Protocol>) -> Self {
        let mut library = Self::default();
        for p in protocols {
            library.insert(p);
        }
        library
    }

    /// Adds a protocol, replacing (in place) any earlier one with the same id.
    pub fn insert(&mut self, protocol: Protocol) {
        match self.protocols.iter_mut().find(|p| p.id == protocol.id) {
            Some(existing) => *existing = protocol,
            None => self.protocols.push(protocol),
        }
    }

    pub fn get(&self, id: &str) -> Option<&Protocol> {
        self.protocols.iter().find(|p| p.id == id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Protocol> {
        self.protocols.iter()
    }

    pub fn as_slice(&self) -> &[Protocol] {
        &self.protocols
    }

    pub fn len(&self) -> usize {
        self.protocols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.protocols.is_empty()
    }
}

fn default_true() -> bool {
    true
}

fn default_tool_group() -> String {
    "default".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stage(id: &str, status: StageStatus) -> Stage {
        Stage {
            id: id.to_string(),
            name: id.to_string(),
            layout: GridLayout::ONE_UP,
            slots: vec![],
            status,
        }
    }

    fn protocol(id: &str) -> Protocol {
        Protocol {
            id: id.to_string(),
            name: String::new(),
            description: String::new(),
            matching_rules: vec![],
            display_set_selectors: BTreeMap::new(),
            default_viewport: None,
            stages: vec![
                stage("axial", StageStatus::Enabled),
                stage("sagittal", StageStatus::Disabled),
            ],
            tool_group_ids: vec![],
            callbacks: ProtocolCallbacks::default(),
        }
    }

    #[test]
    fn test_stage_index_prefers_explicit_index() {
        let p = protocol("mpr");
        assert_eq!(p.stage_index(Some("axial"), Some(1)), Some(1));
    }

    #[test]
    fn test_stage_index_resolves_stage_id() {
        let p = protocol("mpr");
        assert_eq!(p.stage_index(Some("sagittal"), None), Some(1));
        assert_eq!(p.stage_index(Some("coronal"), None), None);
    }

    #[test]
    fn test_stage_index_rejects_out_of_range_index() {
        let p = protocol("mpr");
        assert_eq!(p.stage_index(None, Some(7)), None);
    }

    #[test]
    fn test_library_insert_replaces_same_id_in_place() {
        let mut lib = ProtocolLibrary::new(vec![protocol("a"), protocol("b")]);
        let mut replacement = protocol("a");
        replacement.name = "replaced".to_string();
        lib.insert(replacement);

        assert_eq!(lib.len(), 2);
        assert_eq!(lib.as_slice()[0].name, "replaced");
    }

    #[test]
    fn test_sync_group_spec_reads_viewport_index_option() {
        let mut spec = SyncGroupSpec::new(SyncGroupType::FrameView, "frameViewSync");
        spec.options.insert("viewport_index".to_string(), AttributeValue::Int(3));
        assert_eq!(spec.viewport_index(), Some(3));
    }

    #[test]
    fn test_sync_group_spec_defaults_to_source_and_target_in_toml() {
        let spec: SyncGroupSpec = toml::from_str("type = \"zoompan\"\nid = \"zoompansync\"").unwrap();
        assert!(spec.source && spec.target);
        assert_eq!(spec.kind, SyncGroupType::ZoomPan);
    }

    #[test]
    fn test_grid_layout_capacity() {
        assert_eq!(GridLayout::new(2, 3).capacity(), 6);
        assert_eq!(GridLayout::new(2, 2).to_string(), "2x2");
    }
}

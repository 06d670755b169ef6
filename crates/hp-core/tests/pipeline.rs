//! Integration tests for the hp-core matching → resolution → sync pipeline.
//!
//! These tests drive the public API with a protocol library written in TOML,
//! the same format the viewer loads from disk.

use hp_core::{
    evaluate, resolve_stage, score, DisplaySet, GridLayout, GridState, GridStore,
    PresentationChange, PresentationStore, Protocol, ProtocolLibrary, ProtocolMatcher,
    StudySubject, SyncGroupCoordinator, SyncGroupType, MODALITY, ORIENTATION,
};
use serde::Deserialize;

#[derive(Deserialize)]
struct LibraryFile {
    protocols: Vec<Protocol>,
}

const LIBRARY: &str = r#"
[[protocols]]
id = "default"
name = "Default"

[protocols.display_set_selectors.any]
series_matching_rules = [
  { attribute = "numImageFrames", constraint = { greater_than = 0 } },
]

[[protocols.stages]]
id = "one-up"
layout = { rows = 1, cols = 1 }

[[protocols.stages.slots]]
viewport_id = "default"
display_set_refs = [{ selector_id = "any" }]

[[protocols]]
id = "ct-compare"
name = "CT side by side"
matching_rules = [
  { attribute = "ModalitiesInStudy", constraint = { contains = "CT" }, required = true },
  { attribute = "NumberOfDisplaySets", constraint = { greater_than = 1 }, weight = 3 },
]

[protocols.display_set_selectors.ct]
series_matching_rules = [
  { attribute = "Modality", constraint = { equals = "CT" }, required = true },
  { attribute = "numImageFrames", constraint = { greater_than = 100 }, weight = 10 },
]

[[protocols.stages]]
id = "1x2"
layout = { rows = 1, cols = 2 }

[[protocols.stages.slots]]
viewport_id = "left"
viewport_options = { sync_groups = [{ type = "zoompan", id = "zoompansync" }] }
display_set_refs = [{ selector_id = "ct", match_index = 0 }]

[[protocols.stages.slots]]
viewport_id = "right"
viewport_options = { sync_groups = [{ type = "zoompan", id = "zoompansync" }] }
display_set_refs = [{ selector_id = "ct", match_index = 1 }]

[[protocols]]
id = "mr-only"
matching_rules = [
  { attribute = "ModalitiesInStudy", constraint = { contains = "MR" }, required = true },
]

[[protocols.stages]]
id = "one-up"
layout = { rows = 1, cols = 1 }
"#;

fn library() -> ProtocolLibrary {
    let file: LibraryFile = toml::from_str(LIBRARY).expect("fixture library must parse");
    ProtocolLibrary::new(file.protocols)
}

fn ct_study() -> Vec<DisplaySet> {
    vec![
        DisplaySet::new("ct-thin", "1.2.3")
            .with(MODALITY, "CT")
            .with(ORIENTATION, "axial")
            .with("numImageFrames", 400i64),
        DisplaySet::new("ct-scout", "1.2.3")
            .with(MODALITY, "CT")
            .with("numImageFrames", 2i64),
    ]
}

#[test]
fn test_matched_protocol_passes_every_required_rule() {
    // Arrange
    let lib = library();
    let study = ct_study();
    let subject = StudySubject::new("1.2.3", &study);

    // Act
    let outcome = ProtocolMatcher::new("default")
        .run(lib.iter(), &lib, "1.2.3", &study)
        .expect("default protocol is loaded");

    // Assert
    let chosen = lib.get(&outcome.protocol_id).expect("chosen protocol is in the library");
    assert_eq!(chosen.id, "ct-compare");
    for rule in chosen.matching_rules.iter().filter(|r| r.required) {
        assert!(evaluate(rule, &subject).passed, "{rule:?} must pass");
    }
    assert!(score(&chosen.matching_rules, &subject).is_some());
}

#[test]
fn test_pipeline_resolves_ranked_series_into_slots() {
    // Arrange
    let lib = library();
    let study = ct_study();
    let outcome = ProtocolMatcher::new("default")
        .run(lib.iter(), &lib, "1.2.3", &study)
        .unwrap();
    let protocol = lib.get(&outcome.protocol_id).unwrap();

    // Act
    let grid = resolve_stage(&protocol.stages[0], &outcome.selector_map, &GridState::empty(), true)
        .expect("stage must resolve");

    // Assert
    assert_eq!(grid.layout(), GridLayout::new(1, 2));
    assert_eq!(grid.viewport("left").unwrap().display_set_uids, ["ct-thin".to_string()]);
    assert_eq!(grid.viewport("right").unwrap().display_set_uids, ["ct-scout".to_string()]);

    let mut store = GridStore::new();
    store.commit(grid.clone()).expect("resolved grid is valid");
    assert_eq!(store.snapshot(), grid);
}

#[test]
fn test_mr_study_falls_back_to_default_protocol() {
    let lib = library();
    let study = vec![DisplaySet::new("pt-1", "9.9").with(MODALITY, "PT").with("numImageFrames", 5i64)];
    let candidates: Vec<&Protocol> = lib.iter().filter(|p| p.id != "default").collect();

    let outcome = ProtocolMatcher::new("default")
        .run(candidates, &lib, "9.9", &study)
        .unwrap();

    assert!(outcome.fell_back);
    assert_eq!(outcome.protocol_id, "default");
    assert_eq!(outcome.selector_map.resolve("any", 0), Some("pt-1"));
}

#[test]
fn test_zoompan_propagates_until_group_is_disabled() {
    // Arrange
    let lib = library();
    let study = ct_study();
    let outcome = ProtocolMatcher::new("default")
        .run(lib.iter(), &lib, "1.2.3", &study)
        .unwrap();
    let protocol = lib.get(&outcome.protocol_id).unwrap();
    let grid =
        resolve_stage(&protocol.stages[0], &outcome.selector_map, &GridState::empty(), true).unwrap();
    let mut coordinator = SyncGroupCoordinator::new();
    coordinator.reconcile(&grid);
    let mut presentations = PresentationStore::new();

    // Act: zoom the left viewport
    coordinator.apply_change(
        &mut presentations,
        "left",
        &PresentationChange::Camera { pan: (5.0, 5.0), zoom: 2.0 },
    );

    // Assert: the right viewport followed
    assert_eq!(presentations.get("right").zoom, 2.0);
    assert_eq!(presentations.get("right").pan, (5.0, 5.0));

    // Act: disable, then zoom again
    coordinator
        .toggle(SyncGroupType::ZoomPan, "zoompansync", None, &grid, &study)
        .unwrap();
    coordinator.apply_change(
        &mut presentations,
        "left",
        &PresentationChange::Camera { pan: (0.0, 0.0), zoom: 3.0 },
    );

    // Assert: membership kept, propagation stopped
    assert_eq!(coordinator.get("zoompansync").unwrap().members.len(), 2);
    assert_eq!(presentations.get("right").zoom, 2.0);
}

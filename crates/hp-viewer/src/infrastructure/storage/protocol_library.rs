//! Loads hanging protocols from TOML documents.
//!
//! A protocol file holds an array of `[[protocols]]` tables in the schema of
//! [`hp_core::Protocol`].  The built-in file is compiled into the binary; site
//! files listed in the config are layered on top of it in order, and a later
//! protocol with an already-loaded id replaces the earlier one.
//!
//! Every protocol is validated on load.  A protocol that could never be
//! applied (no stages, a stage with more slots than its grid has cells, a slot
//! referring to an undeclared selector) is rejected with
//! [`ProtocolLoadError::Invalid`] instead of failing later at apply time.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use hp_core::{Protocol, ProtocolLibrary};
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info};

use super::config::ProtocolSourceConfig;

const BUILTIN_PROTOCOLS: &str = include_str!("../../../protocols/builtin.toml");

#[derive(Debug, Error)]
pub enum ProtocolLoadError {
    #[error("I/O error reading protocols at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse protocols in {origin}: {source}")]
    Parse {
        origin: String,
        #[source]
        source: toml::de::Error,
    },

    #[error("protocol '{protocol_id}' is invalid: {reason}")]
    Invalid { protocol_id: String, reason: String },
}

#[derive(Debug, Deserialize)]
struct ProtocolFile {
    #[serde(default)]
    protocols: Vec<Protocol>,
}

/// Parses and validates a protocol document.  `origin` names it in errors.
///
/// # Errors
///
/// [`ProtocolLoadError::Parse`] for malformed TOML and
/// [`ProtocolLoadError::Invalid`] for the first protocol that fails validation.
pub fn parse_protocols(text: &str, origin: &str) -> Result<Vec<Protocol>, ProtocolLoadError> {
    let file: ProtocolFile = toml::from_str(text).map_err(|source| ProtocolLoadError::Parse {
        origin: origin.to_string(),
        source,
    })?;
    for protocol in &file.protocols {
        validate(protocol)?;
    }
    debug!(origin, count = file.protocols.len(), "protocols parsed");
    Ok(file.protocols)
}

/// The protocols shipped with the viewer.
///
/// # Errors
///
/// Only if the embedded document is broken.
pub fn builtin_protocols() -> Result<Vec<Protocol>, ProtocolLoadError> {
    parse_protocols(BUILTIN_PROTOCOLS, "<builtin>")
}

/// Builds the library described by `config`.  Relative paths are resolved
/// against `base_dir` (the config file's directory).
///
/// # Errors
///
/// The first [`ProtocolLoadError`] met while reading or validating a file.
pub fn load_library(
    config: &ProtocolSourceConfig,
    base_dir: &Path,
) -> Result<ProtocolLibrary, ProtocolLoadError> {
    let mut library = if config.use_builtin {
        ProtocolLibrary::new(builtin_protocols()?)
    } else {
        ProtocolLibrary::default()
    };

    for relative in &config.paths {
        let path = base_dir.join(relative);
        let text = std::fs::read_to_string(&path).map_err(|source| ProtocolLoadError::Io {
            path: path.clone(),
            source,
        })?;
        for protocol in parse_protocols(&text, &path.display().to_string())? {
            library.insert(protocol);
        }
    }

    info!(protocols = library.len(), "protocol library loaded");
    Ok(library)
}

fn validate(protocol: &Protocol) -> Result<(), ProtocolLoadError> {
    let invalid = |reason: String| ProtocolLoadError::Invalid {
        protocol_id: protocol.id.clone(),
        reason,
    };

    if protocol.id.is_empty() {
        return Err(invalid("empty id".to_string()));
    }
    if protocol.stages.is_empty() {
        return Err(invalid("no stages".to_string()));
    }

    let slots = protocol
        .stages
        .iter()
        .flat_map(|stage| &stage.slots)
        .chain(protocol.default_viewport.as_ref());
    for slot in slots {
        for r in &slot.display_set_refs {
            if !protocol.display_set_selectors.contains_key(&r.selector_id) {
                return Err(invalid(format!("undeclared selector '{}'", r.selector_id)));
            }
        }
    }

    for stage in &protocol.stages {
        let capacity = stage.layout.capacity();
        if capacity == 0 {
            return Err(invalid(format!("stage '{}' has an empty layout", stage.id)));
        }
        if stage.slots.len() > capacity {
            return Err(invalid(format!(
                "stage '{}' has {} slots for a {} grid",
                stage.id,
                stage.slots.len(),
                stage.layout
            )));
        }
        let mut ids = BTreeSet::new();
        for id in stage.slots.iter().filter_map(|s| s.viewport_id.as_deref()) {
            if !ids.insert(id) {
                return Err(invalid(format!("stage '{}' repeats viewport '{id}'", stage.id)));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const ONE_STAGE: &str = r#"
[[protocols]]
id = "site-ct"

[protocols.display_set_selectors.ct]
series_matching_rules = [{ attribute = "Modality", constraint = { equals = "CT" } }]

[[protocols.stages]]
id = "single"
layout = { rows = 1, cols = 1 }

[[protocols.stages.slots]]
display_set_refs = [{ selector_id = "ct" }]
"#;

    fn err_reason(text: &str) -> String {
        match parse_protocols(text, "test") {
            Err(ProtocolLoadError::Invalid { reason, .. }) => reason,
            other => panic!("expected Invalid, got {other:?}"),
        }
    }

    #[test]
    fn test_builtin_protocols_parse_and_include_default() {
        let protocols = builtin_protocols().expect("builtin library must be valid");
        let ids: Vec<&str> = protocols.iter().map(|p| p.id.as_str()).collect();

        assert!(ids.contains(&"default"));
        assert!(ids.contains(&"mpr"));
    }

    #[test]
    fn test_builtin_mpr_has_disabled_sagittal_stage() {
        let protocols = builtin_protocols().unwrap();
        let mpr = protocols.iter().find(|p| p.id == "mpr").unwrap();

        let enabled: Vec<bool> = mpr.stages.iter().map(|s| s.is_enabled()).collect();
        assert_eq!(enabled, [true, false, true]);
    }

    #[test]
    fn test_parse_protocols_accepts_valid_document() {
        let protocols = parse_protocols(ONE_STAGE, "test").unwrap();
        assert_eq!(protocols.len(), 1);
        assert_eq!(protocols[0].stages[0].slots.len(), 1);
    }

    #[test]
    fn test_undeclared_selector_is_rejected() {
        let text = ONE_STAGE.replace("selector_id = \"ct\"", "selector_id = \"mr\"");
        assert!(err_reason(&text).contains("undeclared selector 'mr'"));
    }

    #[test]
    fn test_too_many_slots_is_rejected() {
        let text = format!(
            "{}\n[[protocols.stages.slots]]\ndisplay_set_refs = [{{ selector_id = \"ct\" }}]\n",
            ONE_STAGE
        );
        assert!(err_reason(&text).contains("2 slots for a 1x1 grid"));
    }

    #[test]
    fn test_protocol_without_stages_is_rejected() {
        let text = "[[protocols]]\nid = \"empty\"\nstages = []\n";
        assert_eq!(err_reason(text), "no stages");
    }

    #[test]
    fn test_malformed_document_is_a_parse_error() {
        assert!(matches!(
            parse_protocols("[[protocols]\n", "broken"),
            Err(ProtocolLoadError::Parse { .. })
        ));
    }

    #[test]
    fn test_site_file_replaces_builtin_protocol_with_same_id() {
        // Arrange
        let dir = std::env::temp_dir().join(format!("hp-protocols-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let site = ONE_STAGE.replace("site-ct", "default");
        std::fs::write(dir.join("site.toml"), site).unwrap();
        let config = ProtocolSourceConfig {
            use_builtin: true,
            paths: vec![PathBuf::from("site.toml")],
        };

        // Act
        let library = load_library(&config, &dir).unwrap();

        // Assert
        let default = library.get("default").unwrap();
        assert_eq!(default.stages[0].id, "single");
        assert!(library.get("mpr").is_some());
    }

    #[test]
    fn test_missing_site_file_is_an_io_error() {
        let config = ProtocolSourceConfig {
            use_builtin: false,
            paths: vec![PathBuf::from("does-not-exist.toml")],
        };
        assert!(matches!(
            load_library(&config, &std::env::temp_dir()),
            Err(ProtocolLoadError::Io { .. })
        ));
    }
}

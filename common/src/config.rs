//! Layered HCL configuration loading (spec §6).
//!
//! Generalizes the teacher's single-file `ConfigEngine<T>` (`fetiche-common`)
//! into the two-layer loader spec.md requires: a system-wide file is read
//! first, then a per-user file is read and merged on top of it
//! section-by-section, so a user can override one `resource "foo" { ... }`
//! block without repeating every other section.

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::{env, fs};

use directories::BaseDirs;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, trace};

use crate::Versioned;

const TAG: &str = "gc3pie";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read configuration file {0}: {1}")]
    Read(PathBuf, std::io::Error),
    #[error("cannot parse HCL in {0}: {1}")]
    Parse(PathBuf, hcl::Error),
    #[error("cannot map merged configuration onto the target schema: {0}")]
    Schema(serde_json::Error),
    #[error("no configuration file found (looked in {0:?})")]
    NotFound(Vec<PathBuf>),
    #[error("invalid configuration: {0}")]
    Validation(String),
}

/// File-format/schema-neutral loader: knows where configuration files live,
/// not what they contain.
#[derive(Debug)]
pub struct ConfigEngine<T> {
    _marker: PhantomData<T>,
}

impl<T> ConfigEngine<T>
where
    T: Debug + DeserializeOwned + Versioned,
{
    /// `/etc/gc3pie/gc3pie.hcl` on Unix (or the platform equivalent).
    pub fn system_config_path() -> PathBuf {
        #[cfg(unix)]
        {
            PathBuf::from("/etc").join(TAG).join("gc3pie.hcl")
        }
        #[cfg(windows)]
        {
            PathBuf::from(env::var("ProgramData").unwrap_or_else(|_| "C:\\ProgramData".into()))
                .join(TAG)
                .join("gc3pie.hcl")
        }
    }

    /// `$XDG_CONFIG_HOME/gc3pie/gc3pie.hcl` (or platform equivalent).
    pub fn user_config_path() -> PathBuf {
        match BaseDirs::new() {
            Some(base) => base.config_dir().join(TAG).join("gc3pie.hcl"),
            None => {
                let home = env::var("HOME").unwrap_or_else(|_| ".".into());
                PathBuf::from(home).join(".config").join(TAG).join("gc3pie.hcl")
            }
        }
    }

    /// Load and merge the layered configuration. `explicit`, if given,
    /// replaces the per-user layer (spec §6's "later overrides earlier"
    /// still applies: the system-wide layer is read first, regardless).
    #[tracing::instrument]
    pub fn load(explicit: Option<&Path>) -> Result<T, ConfigError> {
        let system = Self::system_config_path();
        let user = explicit
            .map(Path::to_path_buf)
            .unwrap_or_else(Self::user_config_path);

        let mut layers = Vec::new();
        if let Some(v) = Self::read_layer(&system)? {
            layers.push(v);
        }
        if let Some(v) = Self::read_layer(&user)? {
            layers.push(v);
        }

        if layers.is_empty() {
            return Err(ConfigError::NotFound(vec![system, user]));
        }

        let merged = layers
            .into_iter()
            .reduce(merge_sections)
            .expect("non-empty layers");

        debug!(?merged, "merged configuration");
        serde_json::from_value(merged).map_err(ConfigError::Schema)
    }

    fn read_layer(path: &Path) -> Result<Option<JsonValue>, ConfigError> {
        if !path.exists() {
            trace!(?path, "configuration layer absent");
            return Ok(None);
        }
        let data = fs::read_to_string(path).map_err(|e| ConfigError::Read(path.to_path_buf(), e))?;
        let value: JsonValue =
            hcl::from_str(&data).map_err(|e| ConfigError::Parse(path.to_path_buf(), e))?;
        Ok(Some(value))
    }
}

/// Merge two parsed HCL documents one section (top-level key) at a time:
/// a top-level key present in `overlay` replaces the same key in `base`
/// (spec §6: "later overrides earlier, section-by-section"); sections
/// `base` has and `overlay` doesn't mention survive unchanged.
fn merge_sections(base: JsonValue, overlay: JsonValue) -> JsonValue {
    match (base, overlay) {
        (JsonValue::Object(mut base_map), JsonValue::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                match (base_map.get(&key).cloned(), &value) {
                    (Some(JsonValue::Object(existing)), JsonValue::Object(incoming)) => {
                        let mut merged: BTreeMap<String, JsonValue> = existing.into_iter().collect();
                        for (k, v) in incoming {
                            merged.insert(k.clone(), v.clone());
                        }
                        let obj: serde_json::Map<String, JsonValue> = merged.into_iter().collect();
                        base_map.insert(key, JsonValue::Object(obj));
                    }
                    _ => {
                        base_map.insert(key, value);
                    }
                }
            }
            JsonValue::Object(base_map)
        }
        (_, overlay) => overlay,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_layer_overrides_system_layer_per_section() {
        let system: JsonValue =
            hcl::from_str(r#"default { poll_interval = "30" max_in_flight = "4" }"#).unwrap();
        let user: JsonValue = hcl::from_str(r#"default { max_in_flight = "8" }"#).unwrap();
        let merged = merge_sections(system, user);

        let default = merged.get("default").unwrap();
        assert_eq!(default.get("max_in_flight").unwrap(), "8");
        assert_eq!(default.get("poll_interval").unwrap(), "30");
    }

    #[test]
    fn sections_absent_from_overlay_are_preserved() {
        let system: JsonValue =
            hcl::from_str(r#"resource "local" { type = "shellcmd" } default { poll_interval = "30" }"#)
                .unwrap();
        let user: JsonValue = hcl::from_str(r#"default { poll_interval = "5" }"#).unwrap();
        let merged = merge_sections(system, user);

        assert!(merged.get("resource").is_some());
        assert_eq!(merged["default"]["poll_interval"], "5");
    }
}

//! Environment loading and key-group validation.
//!
//! The environment is read once, from an env file (`KEY=value` per line) or,
//! when no file exists, from the process environment. After loading it is
//! immutable; nothing else in the crate reads process variables.
//!
//! Keys are organised in [`KeyGroup`]s. Required groups are validated
//! together and every missing key is reported in one error, so an operator
//! can fix the env file in a single pass. Optional groups are only probed
//! with [`Environment::is_complete`]; an incomplete optional group disables
//! the step that depends on it.

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};

use crate::error::{MissingGroup, OpsError, Result};

/// A named set of keys that must be present together.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyGroup {
    pub name: &'static str,
    pub keys: &'static [&'static str],
}

pub const LOCAL: KeyGroup = KeyGroup {
    name: "local",
    keys: &[
        "DOMAIN",
        "DATAVERSE_USER",
        "PAYARA",
        "DATAVERSE_CONTENT_STORAGE",
        "SOLR_PATH",
        "SOLR_USER",
    ],
};

pub const PRODUCTION: KeyGroup = KeyGroup {
    name: "production",
    keys: &[
        "PRODUCTION_DOMAIN",
        "PRODUCTION_SERVER",
        "PRODUCTION_SSH_USER",
        "PRODUCTION_DATAVERSE_CONTENT_STORAGE",
        "PRODUCTION_SOLR_PATH",
        "PRODUCTION_PAYARA",
    ],
};

pub const DATABASE: KeyGroup = KeyGroup {
    name: "database",
    keys: &[
        "DB_HOST",
        "DB_PORT",
        "DB_NAME",
        "DB_USER",
        "PRODUCTION_DB_HOST",
        "PRODUCTION_DB_NAME",
        "PRODUCTION_DB_USER",
    ],
};

pub const COUNTER: KeyGroup = KeyGroup {
    name: "counter",
    keys: &["COUNTER_PROCESSOR_DIR", "PRODUCTION_COUNTER_PROCESSOR_DIR"],
};

pub const UPGRADE: KeyGroup = KeyGroup {
    name: "upgrade",
    keys: &[
        "PAYARA",
        "DATAVERSE_USER",
        "CURRENT_VERSION",
        "TARGET_VERSION",
        "PAYARA_DOWNLOAD_URL",
        "PAYARA_SHA256",
        "WAR_DOWNLOAD_URL",
        "WAR_SHA256",
    ],
};

pub const SEARCH_UPGRADE: KeyGroup = KeyGroup {
    name: "search-upgrade",
    keys: &["SOLR_PATH", "SOLR_USER", "SOLR_SCHEMA_URL", "SOLR_CONFIG_URL"],
};

pub const FIELD_UPDATER: KeyGroup = KeyGroup {
    name: "field-updater",
    keys: &["UPDATE_FIELDS_URL", "CUSTOM_METADATA_BLOCKS"],
};

pub const FEATURES: KeyGroup = KeyGroup {
    name: "features",
    keys: &["FEATURE_FLAGS"],
};

pub const FIELD_MIGRATION: KeyGroup = KeyGroup {
    name: "field-migration",
    keys: &["MIGRATION_FIELD_NAME", "MIGRATION_FIELD_TYPE"],
};

pub const DEFAULT_API_URL: &str = "http://localhost:8080";

/// Immutable key/value configuration for one run.
#[derive(Debug, Clone, Default)]
pub struct Environment {
    values: BTreeMap<String, String>,
    origin: Option<PathBuf>,
}

impl Environment {
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            values: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
            origin: None,
        }
    }

    /// Parse an env file without exporting anything into the process.
    pub fn from_env_file(path: &Path) -> Result<Self> {
        let iter = dotenvy::from_path_iter(path).map_err(|err| env_file_error(path, err))?;
        let mut values = BTreeMap::new();
        for item in iter {
            let (key, value) = item.map_err(|err| env_file_error(path, err))?;
            values.insert(key, value);
        }
        Ok(Self {
            values,
            origin: Some(path.to_path_buf()),
        })
    }

    pub fn from_process_env() -> Self {
        Self::from_pairs(std::env::vars())
    }

    /// Load `path` if it exists, otherwise fall back to the process environment.
    pub fn load(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::from_env_file(path)
        } else {
            tracing::debug!(
                "env file {} not found; reading the process environment",
                path.display()
            );
            Ok(Self::from_process_env())
        }
    }

    pub fn origin(&self) -> Option<&Path> {
        self.origin.as_deref()
    }

    /// Trimmed value of `key`; empty values count as absent.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values
            .get(key)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }

    pub fn get_or<'a>(&'a self, key: &str, default: &'a str) -> &'a str {
        self.get(key).unwrap_or(default)
    }

    /// Value of a key that a validated group guarantees.
    pub fn require(&self, key: &str) -> Result<&str> {
        self.get(key).ok_or_else(|| OpsError::Configuration {
            missing: vec![MissingGroup {
                group: "required".to_string(),
                keys: vec![key.to_string()],
            }],
        })
    }

    /// Comma separated list value; empty entries are dropped.
    pub fn list(&self, key: &str) -> Vec<String> {
        self.get(key)
            .map(|v| {
                v.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn missing_keys(&self, group: &KeyGroup) -> Vec<String> {
        group
            .keys
            .iter()
            .filter(|key| self.get(key).is_none())
            .map(|key| key.to_string())
            .collect()
    }

    pub fn is_complete(&self, group: &KeyGroup) -> bool {
        self.missing_keys(group).is_empty()
    }

    /// Validate all required groups, reporting every missing key at once.
    pub fn validate_required(&self, groups: &[KeyGroup]) -> Result<()> {
        let missing: Vec<MissingGroup> = groups
            .iter()
            .filter_map(|group| {
                let keys = self.missing_keys(group);
                (!keys.is_empty()).then(|| MissingGroup {
                    group: group.name.to_string(),
                    keys,
                })
            })
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(OpsError::Configuration { missing })
        }
    }

    pub fn api_url(&self) -> &str {
        self.get_or("DATAVERSE_API_URL", DEFAULT_API_URL)
            .trim_end_matches('/')
    }

    pub fn payara_service(&self) -> &str {
        self.get_or("PAYARA_SERVICE", "payara")
    }

    pub fn solr_service(&self) -> &str {
        self.get_or("SOLR_SERVICE", "solr")
    }
}

fn env_file_error(path: &Path, err: dotenvy::Error) -> OpsError {
    match err {
        dotenvy::Error::Io(inner) => OpsError::Io(io::Error::new(
            inner.kind(),
            format!("failed to read env file {}: {inner}", path.display()),
        )),
        other => OpsError::invalid_options(format!(
            "failed to parse env file {}: {other}",
            path.display()
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use std::fs;
    use tempfile::TempDir;

    fn full_sync_env() -> Vec<(String, String)> {
        LOCAL
            .keys
            .iter()
            .chain(PRODUCTION.keys)
            .chain(DATABASE.keys)
            .map(|k| (k.to_string(), format!("value-of-{k}")))
            .collect()
    }

    #[test]
    fn reports_every_missing_key_across_groups() {
        let dropped: BTreeSet<&str> = ["DOMAIN", "SOLR_USER", "PRODUCTION_SERVER", "DB_PORT"]
            .into_iter()
            .collect();
        let env = Environment::from_pairs(
            full_sync_env()
                .into_iter()
                .filter(|(k, _)| !dropped.contains(k.as_str())),
        );

        let err = env
            .validate_required(&[LOCAL, PRODUCTION, DATABASE])
            .unwrap_err();
        let reported: BTreeSet<&str> = err.missing_keys().into_iter().collect();
        assert_eq!(reported, dropped);
        let msg = err.to_string();
        assert!(msg.contains("[local]"));
        assert!(msg.contains("[production]"));
        assert!(msg.contains("[database]"));
    }

    #[test]
    fn blank_values_count_as_missing() {
        let mut pairs = full_sync_env();
        pairs.push(("DB_HOST".into(), "   ".into()));
        let env = Environment::from_pairs(pairs);
        let err = env.validate_required(&[DATABASE]).unwrap_err();
        assert_eq!(err.missing_keys(), vec!["DB_HOST"]);
    }

    #[test]
    fn optional_group_is_probed_without_error() {
        let env = Environment::from_pairs([("COUNTER_PROCESSOR_DIR", "/usr/local/counter")]);
        assert!(!env.is_complete(&COUNTER));
        assert_eq!(
            env.missing_keys(&COUNTER),
            vec!["PRODUCTION_COUNTER_PROCESSOR_DIR".to_string()]
        );
    }

    #[test]
    fn reads_env_file_without_touching_process_env() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(".env");
        fs::write(
            &path,
            "# staging clone\nDOMAIN=staging.example.org\nFEATURE_FLAGS=\"a, b,,c\"\n",
        )
        .unwrap();

        let env = Environment::from_env_file(&path).unwrap();
        assert_eq!(env.get("DOMAIN"), Some("staging.example.org"));
        assert_eq!(env.list("FEATURE_FLAGS"), vec!["a", "b", "c"]);
        assert_eq!(env.origin(), Some(path.as_path()));
        assert!(std::env::var("FEATURE_FLAGS").is_err());
    }

    #[test]
    fn defaults_for_service_names_and_api() {
        let env = Environment::from_pairs([("DATAVERSE_API_URL", "https://dv.example.org/")]);
        assert_eq!(env.api_url(), "https://dv.example.org");
        assert_eq!(env.payara_service(), "payara");
        assert_eq!(env.solr_service(), "solr");
    }
}

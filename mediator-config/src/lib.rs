//! Process-wide sandbox configuration store.
//!
//! `ConfigStore` owns the in-memory `SandboxConfig` behind a `RwLock`.
//! After startup there is a single writer — the control plane's request
//! handlers — so readers may observe a config mid-write only in the sense
//! that an individual field read and a concurrent write are not atomic
//! with respect to each other across the *whole* struct; any single field
//! read is consistent because `get()` clones the guarded value.

use std::fs;
use std::path::Path;
use std::path::PathBuf;
use std::sync::RwLock;

use mediator_protocol::Category;
use mediator_protocol::CategoryMode;
use mediator_protocol::RuleSet;
use mediator_protocol::SandboxConfig;
use mediator_rules::parse;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to write config file {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("config path `{0}` does not exist")]
    UnknownPath(String),
    #[error("config path `{0}` cannot be traversed further (not an object)")]
    NotAnObject(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Which side of a rule to add/remove from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleKind {
    Allow,
    Deny,
}

pub struct ConfigStore {
    path: PathBuf,
    inner: RwLock<SandboxConfig>,
}

impl ConfigStore {
    /// Load from `path`, patching in defaults for any field the distillation
    /// of an older config file omitted (forward compatibility), and
    /// normalizing hardened category modes immediately so `get()` never
    /// returns a config that violates the exec/packages invariant. Falls
    /// back to built-in defaults if the file is missing or fails to parse.
    pub fn load(path: impl Into<PathBuf>, git_staging_repo: impl Into<String>) -> Self {
        let path = path.into();
        let config = match fs::read_to_string(&path) {
            Ok(contents) => match serde_json::from_str::<SandboxConfig>(&contents) {
                Ok(mut cfg) => {
                    normalize_hardened_modes(&mut cfg);
                    cfg
                }
                Err(err) => {
                    tracing::warn!(path = %path.display(), error = %err, "config parse failed, using defaults");
                    SandboxConfig::default_for(git_staging_repo)
                }
            },
            Err(_) => SandboxConfig::default_for(git_staging_repo),
        };
        ConfigStore {
            path,
            inner: RwLock::new(config),
        }
    }

    /// Pretty-print the current config as JSON with a trailing newline.
    pub fn save(&self) -> Result<()> {
        #[allow(clippy::unwrap_used)]
        let config = self.inner.read().unwrap();
        let mut json = serde_json::to_string_pretty(&*config).map_err(|source| {
            ConfigError::Write {
                path: self.path.clone(),
                source: std::io::Error::other(source),
            }
        })?;
        json.push('\n');
        fs::write(&self.path, json).map_err(|source| ConfigError::Write {
            path: self.path.clone(),
            source,
        })
    }

    pub fn get(&self) -> SandboxConfig {
        #[allow(clippy::unwrap_used)]
        self.inner.read().unwrap().clone()
    }

    pub fn is_endpoint_allowed(&self, host: &str) -> bool {
        #[allow(clippy::unwrap_used)]
        let config = self.inner.read().unwrap();
        config
            .allowed_endpoints
            .iter()
            .any(|suffix| host == suffix || host.ends_with(&format!(".{suffix}")))
    }

    /// `exec` and `packages` are always reported as `approve-each`
    /// regardless of the persisted value.
    pub fn get_category_mode(&self, category: Category) -> CategoryMode {
        if category.is_hardened() {
            return CategoryMode::ApproveEach;
        }
        #[allow(clippy::unwrap_used)]
        let config = self.inner.read().unwrap();
        config
            .categories
            .get(&category)
            .copied()
            .unwrap_or_default()
    }

    /// Writes that set a hardened category to anything but `approve-each`
    /// are silently discarded. Returns whether the mode was actually
    /// applied.
    pub fn set_category_mode(&self, category: Category, mode: CategoryMode) -> bool {
        if category.is_hardened() && mode != CategoryMode::ApproveEach {
            return false;
        }
        #[allow(clippy::unwrap_used)]
        let mut config = self.inner.write().unwrap();
        config.categories.insert(category, mode);
        true
    }

    /// Rejects unparseable rules and exact duplicates; otherwise inserts
    /// and returns true.
    pub fn add_rule(&self, kind: RuleKind, rule: &str) -> bool {
        if parse(rule).is_none() {
            return false;
        }
        #[allow(clippy::unwrap_used)]
        let mut config = self.inner.write().unwrap();
        let bucket = match kind {
            RuleKind::Allow => &mut config.rules.allow,
            RuleKind::Deny => &mut config.rules.deny,
        };
        if bucket.iter().any(|r| r == rule) {
            return false;
        }
        bucket.push(rule.to_string());
        true
    }

    pub fn remove_rule(&self, kind: RuleKind, rule: &str) -> bool {
        #[allow(clippy::unwrap_used)]
        let mut config = self.inner.write().unwrap();
        let bucket = match kind {
            RuleKind::Allow => &mut config.rules.allow,
            RuleKind::Deny => &mut config.rules.deny,
        };
        let before = bucket.len();
        bucket.retain(|r| r != rule);
        bucket.len() != before
    }

    pub fn rules(&self) -> RuleSet {
        #[allow(clippy::unwrap_used)]
        self.inner.read().unwrap().rules.clone()
    }

    pub fn add_allowed_endpoint(&self, suffix: &str) -> bool {
        #[allow(clippy::unwrap_used)]
        let mut config = self.inner.write().unwrap();
        if config.allowed_endpoints.iter().any(|s| s == suffix) {
            return false;
        }
        config.allowed_endpoints.push(suffix.to_string());
        true
    }

    pub fn remove_allowed_endpoint(&self, suffix: &str) -> bool {
        #[allow(clippy::unwrap_used)]
        let mut config = self.inner.write().unwrap();
        let before = config.allowed_endpoints.len();
        config.allowed_endpoints.retain(|s| s != suffix);
        config.allowed_endpoints.len() != before
    }

    /// Apply an agent-proposed sandbox change. Walks `path` as a dot-separated sequence of
    /// JSON object keys and assigns `value` at the leaf. Used once a
    /// `category: sandbox` permission request with a `proposal` has been
    /// approved. `reason` is accepted for audit purposes only; it has no
    /// effect on the mutation itself.
    pub fn apply_config_change(
        &self,
        path: &str,
        value: serde_json::Value,
        _reason: Option<&str>,
    ) -> Result<()> {
        #[allow(clippy::unwrap_used)]
        let mut config = self.inner.write().unwrap();
        let mut json = serde_json::to_value(&*config).map_err(|source| ConfigError::Write {
            path: self.path.clone(),
            source: std::io::Error::other(source),
        })?;

        let segments: Vec<&str> = path.split('.').collect();
        assign_at_path(&mut json, &segments, value)?;

        let updated: SandboxConfig =
            serde_json::from_value(json).map_err(|source| ConfigError::Parse {
                path: self.path.clone(),
                source,
            })?;
        *config = updated;
        Ok(())
    }
}

fn assign_at_path(
    json: &mut serde_json::Value,
    segments: &[&str],
    value: serde_json::Value,
) -> Result<()> {
    let Some((last, parents)) = segments.split_last() else {
        return Err(ConfigError::UnknownPath(String::new()));
    };

    let mut cursor = json;
    for seg in parents {
        cursor = cursor
            .as_object_mut()
            .ok_or_else(|| ConfigError::NotAnObject(seg.to_string()))?
            .entry(seg.to_string())
            .or_insert_with(|| serde_json::Value::Object(Default::default()));
    }
    let obj = cursor
        .as_object_mut()
        .ok_or_else(|| ConfigError::NotAnObject((*last).to_string()))?;
    obj.insert((*last).to_string(), value);
    Ok(())
}

fn normalize_hardened_modes(config: &mut SandboxConfig) {
    for cat in [Category::Exec, Category::Packages] {
        config.categories.insert(cat, CategoryMode::ApproveEach);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mediator_protocol::Category;
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    fn store() -> (tempfile::TempDir, ConfigStore) {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sandbox.config.json");
        let store = ConfigStore::load(&path, "/tmp/staging.git");
        (dir, store)
    }

    #[test]
    fn hardened_mode_accessor_always_approve_each() {
        let (_dir, store) = store();
        assert!(!store.set_category_mode(Category::Exec, CategoryMode::AllowAll));
        assert_eq!(
            store.get_category_mode(Category::Exec),
            CategoryMode::ApproveEach
        );
        assert!(!store.set_category_mode(Category::Packages, CategoryMode::DenyAll));
        assert_eq!(
            store.get_category_mode(Category::Packages),
            CategoryMode::ApproveEach
        );
    }

    #[test]
    fn non_hardened_mode_is_settable() {
        let (_dir, store) = store();
        assert!(store.set_category_mode(Category::Network, CategoryMode::AllowAll));
        assert_eq!(
            store.get_category_mode(Category::Network),
            CategoryMode::AllowAll
        );
    }

    #[test]
    fn add_rule_rejects_unparseable() {
        let (_dir, store) = store();
        assert!(!store.add_rule(RuleKind::Allow, "not a rule"));
        assert!(store.rules().allow.is_empty());
    }

    #[test]
    fn add_rule_rejects_duplicates() {
        let (_dir, store) = store();
        assert!(store.add_rule(RuleKind::Allow, "network(example.com)"));
        assert!(!store.add_rule(RuleKind::Allow, "network(example.com)"));
        assert_eq!(store.rules().allow.len(), 1);
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sandbox.config.json");
        let store = ConfigStore::load(&path, "/tmp/staging.git");
        store.add_rule(RuleKind::Deny, "network(evil.example.com)");
        store.add_allowed_endpoint("internal.corp");
        store.save().unwrap();

        let reloaded = ConfigStore::load(&path, "/tmp/staging.git");
        assert_eq!(reloaded.get(), store.get());
    }

    #[test]
    fn is_endpoint_allowed_matches_suffix() {
        let (_dir, store) = store();
        store.add_allowed_endpoint("example.com");
        assert!(store.is_endpoint_allowed("example.com"));
        assert!(store.is_endpoint_allowed("api.example.com"));
        assert!(!store.is_endpoint_allowed("example.com.evil.net"));
    }

    #[test]
    fn apply_config_change_walks_dotted_path() {
        let (_dir, store) = store();
        store
            .apply_config_change(
                "categories.network",
                serde_json::json!("allow-all"),
                Some("agent requested broader network access"),
            )
            .unwrap();
        assert_eq!(
            store.get_category_mode(Category::Network),
            CategoryMode::AllowAll
        );
    }

    #[test]
    fn load_normalizes_stale_hardened_mode_from_disk() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sandbox.config.json");
        let mut raw = SandboxConfig::default_for("/tmp/staging.git");
        raw.categories.insert(Category::Exec, CategoryMode::AllowAll);
        fs::write(&path, serde_json::to_string_pretty(&raw).unwrap()).unwrap();

        let store = ConfigStore::load(&path, "/tmp/staging.git");
        assert_eq!(
            store.get().categories[&Category::Exec],
            CategoryMode::ApproveEach
        );
    }
}

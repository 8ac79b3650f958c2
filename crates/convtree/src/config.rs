//! Store configuration loaded from TOML.
//!
//! ```toml
//! [store]
//! db = "${CONVTREE_HOME:-.}/conversations.db"
//! busy_timeout_ms = 5000
//! sibling_retry_limit = 3
//! default_title = "New Chat"
//! ```

use anyhow::{Context, Result, anyhow};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Title a session carries until a user message (or rename) replaces it.
pub const DEFAULT_TITLE: &str = "New Chat";

/// Top-level config file layout
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    #[serde(default)]
    pub store: StoreConfig,
}

/// Conversation store settings
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StoreConfig {
    /// Database file; `None` keeps everything in memory.
    #[serde(default)]
    pub db: Option<PathBuf>,
    /// How long a writer waits on a locked database file before failing.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
    /// Attempts at allocate+insert before a sibling race is reported.
    #[serde(default = "default_sibling_retry_limit")]
    pub sibling_retry_limit: u32,
    /// Placeholder title for sessions without a derived or user-chosen title.
    #[serde(default = "default_title")]
    pub default_title: String,
}

fn default_busy_timeout_ms() -> u64 {
    5_000
}

fn default_sibling_retry_limit() -> u32 {
    3
}

fn default_title() -> String {
    DEFAULT_TITLE.to_string()
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db: None,
            busy_timeout_ms: default_busy_timeout_ms(),
            sibling_retry_limit: default_sibling_retry_limit(),
            default_title: default_title(),
        }
    }
}

impl StoreConfig {
    pub fn with_db(mut self, db: impl Into<PathBuf>) -> Self {
        self.db = Some(db.into());
        self
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.sibling_retry_limit == 0 {
            return Err(anyhow!("'sibling_retry_limit' must be at least 1"));
        }
        if self.default_title.trim().is_empty() {
            return Err(anyhow!("'default_title' must not be empty"));
        }
        Ok(())
    }
}

/// Load and parse a config file
pub async fn load_config(path: impl AsRef<Path>) -> Result<StoreConfig> {
    let path = path.as_ref();
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read config file: {:?}", path))?;

    let base_path = path.parent().unwrap_or(Path::new("."));
    parse_config(&content, base_path)
}

/// Parse config text; relative `db` paths resolve against `base_path`.
pub fn parse_config(content: &str, base_path: &Path) -> Result<StoreConfig> {
    let processed = interpolate_env_vars(content)?;
    let file: ConfigFile =
        toml::from_str(&processed).with_context(|| "Failed to parse store config")?;

    let mut config = file.store;
    config.validate()?;
    if let Some(db) = config.db.take() {
        config.db = Some(if db.is_relative() {
            base_path.join(db)
        } else {
            db
        });
    }
    Ok(config)
}

/// Failure to expand an environment reference in config text.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InterpolationError {
    #[error("Environment variable {name} is not set and the reference has no default")]
    MissingVar { name: String },
}

/// `${NAME}` or `${NAME:-fallback}`
static ENV_REF: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::-([^}]*))?\}").expect("valid env ref regex")
});

/// Expand `${NAME}` and `${NAME:-fallback}` references from the process environment.
///
/// An unset or empty variable takes the fallback; without one, the first such reference is
/// returned as [`InterpolationError::MissingVar`].
pub fn interpolate_env_vars(content: &str) -> Result<String, InterpolationError> {
    let mut expanded = String::with_capacity(content.len());
    let mut copied_up_to = 0;

    for caps in ENV_REF.captures_iter(content) {
        let Some(reference) = caps.get(0) else {
            continue;
        };
        let name = &caps[1];
        let value = std::env::var(name)
            .ok()
            .filter(|v| !v.is_empty())
            .or_else(|| caps.get(2).map(|fallback| fallback.as_str().to_string()))
            .ok_or_else(|| InterpolationError::MissingVar {
                name: name.to_string(),
            })?;

        expanded.push_str(&content[copied_up_to..reference.start()]);
        expanded.push_str(&value);
        copied_up_to = reference.end();
    }
    expanded.push_str(&content[copied_up_to..]);
    Ok(expanded)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_uses_defaults() {
        let config = parse_config("", Path::new("/etc/convtree")).unwrap();
        assert_eq!(config, StoreConfig::default());
        assert_eq!(config.busy_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn relative_db_resolves_against_config_dir() {
        let config = parse_config(
            "[store]\ndb = \"data/chat.db\"\nsibling_retry_limit = 5\n",
            Path::new("/srv/app"),
        )
        .unwrap();
        assert_eq!(config.db, Some(PathBuf::from("/srv/app/data/chat.db")));
        assert_eq!(config.sibling_retry_limit, 5);
    }

    #[test]
    fn env_default_is_used_when_unset() {
        let config = parse_config(
            "[store]\ndb = \"${CONVTREE_TEST_SURELY_UNSET_DIR:-/var/lib}/chat.db\"\n",
            Path::new("."),
        )
        .unwrap();
        assert_eq!(config.db, Some(PathBuf::from("/var/lib/chat.db")));
    }

    #[test]
    fn missing_required_env_var_fails() {
        let err = parse_config(
            "[store]\ndb = \"${CONVTREE_TEST_SURELY_UNSET_DIR}/chat.db\"\n",
            Path::new("."),
        )
        .unwrap_err();
        assert!(err.to_string().contains("CONVTREE_TEST_SURELY_UNSET_DIR"));
    }

    #[test]
    fn rejects_invalid_values_and_unknown_keys() {
        assert!(parse_config("[store]\nsibling_retry_limit = 0\n", Path::new(".")).is_err());
        assert!(parse_config("[store]\ndefault_title = \"  \"\n", Path::new(".")).is_err());
        assert!(parse_config("[store]\npool_size = 4\n", Path::new(".")).is_err());
    }

    #[test]
    fn interpolation_reports_first_missing_var() {
        let err = interpolate_env_vars(
            "a = \"${CONVTREE_TEST_SURELY_UNSET_A}\"\nb = \"${CONVTREE_TEST_SURELY_UNSET_B}\"\n",
        )
        .unwrap_err();
        assert_eq!(
            err,
            InterpolationError::MissingVar {
                name: "CONVTREE_TEST_SURELY_UNSET_A".to_string()
            }
        );
    }

    #[test]
    fn interpolation_keeps_surrounding_text() {
        assert_eq!(
            interpolate_env_vars("x=${CONVTREE_TEST_SURELY_UNSET_A:-1}, y=${CONVTREE_TEST_SURELY_UNSET_B:-}!")
                .unwrap(),
            "x=1, y=!"
        );
        assert_eq!(interpolate_env_vars("no refs $ {here}").unwrap(), "no refs $ {here}");
    }

    #[tokio::test]
    async fn load_config_reads_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("convtree.toml");
        tokio::fs::write(&path, "[store]\ndb = \"chat.db\"\ndefault_title = \"Untitled\"\n")
            .await
            .unwrap();

        let config = load_config(&path).await.unwrap();
        assert_eq!(config.db, Some(dir.path().join("chat.db")));
        assert_eq!(config.default_title, "Untitled");
    }
}

use std::{path::Path, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{HError, error::result::HResult, template::TemplateEntry};

/// Policy of the session pools
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SessionPoolConfig {
    /// Idle sessions are only evicted once a pool holds at least this many sessions
    pub eviction_threshold: usize,
    /// Sessions idle for at least this long may be closed
    pub max_idle_secs: u64,
    /// Number of sessions always kept open by the eviction
    pub min_open: usize,
}

impl Default for SessionPoolConfig {
    fn default() -> Self {
        Self {
            eviction_threshold: 5,
            max_idle_secs: 180,
            min_open: 1,
        }
    }
}

impl SessionPoolConfig {
    #[must_use]
    pub const fn max_idle(&self) -> Duration {
        Duration::from_secs(self.max_idle_secs)
    }
}

/// Configuration of a token
///
/// ```toml
/// name = "hsm"
/// max_sessions = 16
/// explicit_cancel = false
///
/// [session_pool]
/// max_idle_secs = 60
///
/// [[attributes]]
/// operation = "generate"
/// class = "private_key"
/// values = { sensitive = true, extractable = false }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TokenConfig {
    /// Name of the token in the logs
    pub name: String,
    /// Maximum number of sessions the provider opens, further capped by the token limits
    pub max_sessions: Option<usize>,
    /// Cancel an operation left in flight with a matching final call.
    /// When `false`, the session running the operation is closed instead.
    pub explicit_cancel: bool,
    /// Messages up to this size are digested with a single call at digest time
    pub digest_buffer_size: usize,
    /// Capacity of the cache of imported secret keys, 0 disables the cache
    pub secret_key_cache_size: usize,
    /// Destroy the objects of unreachable keys from a background thread
    pub background_key_reaper: bool,
    /// Minimal delay between two presence checks of a removable token
    pub presence_check_interval_ms: u64,
    pub session_pool: SessionPoolConfig,
    /// Attribute templates applied when creating objects
    pub attributes: Vec<TemplateEntry>,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            name: "token".to_owned(),
            max_sessions: None,
            explicit_cancel: true,
            digest_buffer_size: 96,
            secret_key_cache_size: 100,
            background_key_reaper: false,
            presence_check_interval_ms: 50,
            session_pool: SessionPoolConfig::default(),
            attributes: Vec::new(),
        }
    }
}

impl TokenConfig {
    /// Parse a configuration from its TOML representation
    pub fn from_toml_str(content: &str) -> HResult<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration from a TOML file
    pub fn from_file(path: &Path) -> HResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            HError::Config(format!("cannot read the configuration file {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&content)
    }

    fn validate(&self) -> HResult<()> {
        if self.max_sessions == Some(0) {
            return Err(HError::Config("max_sessions must be at least 1".to_owned()));
        }
        if self.session_pool.eviction_threshold == 0 {
            return Err(HError::Config(
                "session_pool.eviction_threshold must be at least 1".to_owned(),
            ));
        }
        Ok(())
    }

    #[must_use]
    pub const fn presence_check_interval(&self) -> Duration {
        Duration::from_millis(self.presence_check_interval_ms)
    }
}

//! Configuration loading and persistence.
//!
//! Handles reading and writing the E2E settings file (`e2e.json`) and the
//! limits that bound ratchet memory under an adversarial relay. Secrets are
//! never stored here; see the keyring module.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Settings file name under the config directory.
const CONFIG_FILE: &str = "e2e.json";

/// Default capacity of the skipped message-key cache.
pub const DEFAULT_MAX_SKIPPED_KEYS: usize = 2000;
/// Default largest counter jump accepted from one envelope.
pub const DEFAULT_MAX_SKIP_PER_MESSAGE: u32 = 1000;
/// Default consecutive decryption failures before teardown.
pub const DEFAULT_MAX_DECRYPT_FAILURES: u32 = 5;
/// Default upper bound for a serialized envelope (1 MiB).
pub const DEFAULT_MAX_ENVELOPE_SIZE: usize = 1024 * 1024;

/// Configuration for the E2E session layer.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Config {
    /// Name announced to peers in the presence handshake.
    pub display_name: String,
    /// Capacity of the out-of-order message-key cache.
    #[serde(default = "default_max_skipped_keys")]
    pub max_skipped_keys: usize,
    /// Largest counter jump a single envelope may request.
    #[serde(default = "default_max_skip_per_message")]
    pub max_skip_per_message: u32,
    /// Consecutive decryption failures tolerated before the session is torn down.
    #[serde(default = "default_max_decrypt_failures")]
    pub max_decrypt_failures: u32,
    /// Envelopes larger than this are rejected before parsing.
    #[serde(default = "default_max_envelope_size")]
    pub max_envelope_size: usize,
}

fn default_max_skipped_keys() -> usize {
    DEFAULT_MAX_SKIPPED_KEYS
}

fn default_max_skip_per_message() -> u32 {
    DEFAULT_MAX_SKIP_PER_MESSAGE
}

fn default_max_decrypt_failures() -> u32 {
    DEFAULT_MAX_DECRYPT_FAILURES
}

fn default_max_envelope_size() -> usize {
    DEFAULT_MAX_ENVELOPE_SIZE
}

impl Default for Config {
    fn default() -> Self {
        Self {
            display_name: default_display_name(),
            max_skipped_keys: DEFAULT_MAX_SKIPPED_KEYS,
            max_skip_per_message: DEFAULT_MAX_SKIP_PER_MESSAGE,
            max_decrypt_failures: DEFAULT_MAX_DECRYPT_FAILURES,
            max_envelope_size: DEFAULT_MAX_ENVELOPE_SIZE,
        }
    }
}

/// Generate default display name based on hostname.
pub fn default_display_name() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .map_or_else(
            || "Botster CLI".to_string(),
            |h| format!("Botster CLI ({})", h),
        )
}

fn override_number<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
    target: &mut T,
) {
    if let Some(value) = lookup(name) {
        match value.parse() {
            Ok(n) => *target = n,
            Err(_) => log::warn!("Ignoring invalid {name}={value}"),
        }
    }
}

impl Config {
    /// Returns the configuration directory path, creating it if necessary.
    ///
    /// Directory selection priority:
    /// 1. `#[cfg(test)]` (unit tests): `tmp/botster-test`
    /// 2. `BOTSTER_CONFIG_DIR` env var: explicit override
    /// 3. `BOTSTER_ENV=test`: `tmp/botster-test` (integration tests)
    /// 4. Default: platform config dir (macOS: ~/Library/Application Support/botster)
    pub fn config_dir() -> Result<PathBuf> {
        let dir = {
            #[cfg(test)]
            {
                PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tmp/botster-test")
            }

            #[cfg(not(test))]
            {
                if let Ok(custom_dir) = std::env::var("BOTSTER_CONFIG_DIR") {
                    PathBuf::from(custom_dir)
                } else if crate::env::should_skip_keyring() {
                    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tmp/botster-test")
                } else {
                    dirs::config_dir()
                        .context("Could not determine config directory")?
                        .join("botster")
                }
            }
        };
        fs::create_dir_all(&dir).context("Failed to create config directory")?;
        Ok(dir)
    }

    /// Path of the settings file under the config directory.
    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join(CONFIG_FILE))
    }

    /// Loads configuration from file, with environment variable overrides.
    ///
    /// A missing file means defaults; a file that exists but cannot be
    /// parsed is an error.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from(&Self::config_path()?)?;
        config.apply_overrides(|name| std::env::var(name).ok());
        Ok(config)
    }

    /// Loads configuration from `path` without applying overrides.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            log::debug!("No {} found, using default E2E config", path.display());
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))
    }

    /// Applies `BOTSTER_*` overrides resolved through `lookup`.
    ///
    /// Unparseable numeric values are logged and ignored.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(name) = lookup("BOTSTER_DISPLAY_NAME") {
            if !name.trim().is_empty() {
                self.display_name = name;
            }
        }

        override_number(&lookup, "BOTSTER_MAX_SKIPPED_KEYS", &mut self.max_skipped_keys);
        override_number(&lookup, "BOTSTER_MAX_SKIP", &mut self.max_skip_per_message);
        override_number(
            &lookup,
            "BOTSTER_MAX_DECRYPT_FAILURES",
            &mut self.max_decrypt_failures,
        );
    }

    /// Saves configuration to the default settings file.
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    /// Saves configuration to `path`, readable by the owner only.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)
            .with_context(|| format!("Failed to write {}", path.display()))?;

        #[cfg(unix)]
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;

        Ok(())
    }

    /// Ratchet limits derived from this configuration.
    pub fn ratchet_limits(&self) -> crate::ratchet::RatchetLimits {
        crate::ratchet::RatchetLimits {
            max_skipped_keys: self.max_skipped_keys,
            max_skip_per_message: self.max_skip_per_message,
        }
    }
}

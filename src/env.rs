//! Runtime environment detection.
//!
//! `BOTSTER_ENV` decides where key material lives:
//! - `test` / `system_test` - file-backed credentials under the repo `tmp/` dir
//! - `development` or `dev` - development mode (OS keyring)
//! - anything else or unset - production (OS keyring)

/// Runtime environment for the E2E layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    /// Production environment (default).
    Production,
    /// Development environment.
    Development,
    /// Test environment - file storage instead of keyring.
    Test,
    /// System test environment - spawned by the Rails system tests.
    SystemTest,
}

impl Environment {
    /// Detect current environment from `BOTSTER_ENV`.
    #[must_use]
    pub fn current() -> Self {
        Self::parse(std::env::var("BOTSTER_ENV").ok().as_deref())
    }

    fn parse(value: Option<&str>) -> Self {
        match value {
            Some("test") => Self::Test,
            Some("system_test") => Self::SystemTest,
            Some("development" | "dev") => Self::Development,
            _ => Self::Production,
        }
    }

    /// Returns `true` if running in any test mode (test or system_test).
    #[must_use]
    pub fn is_any_test(self) -> bool {
        matches!(self, Self::Test | Self::SystemTest)
    }
}

impl std::fmt::Display for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Production => write!(f, "production"),
            Self::Development => write!(f, "development"),
            Self::Test => write!(f, "test"),
            Self::SystemTest => write!(f, "system_test"),
        }
    }
}

/// Returns `true` if keyring should be bypassed (any test mode).
#[must_use]
pub fn should_skip_keyring() -> bool {
    Environment::current().is_any_test()
}

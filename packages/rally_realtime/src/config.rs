use std::time::Duration;

use serde::{Deserialize, Serialize};

/// What to do when calling code misuses a handle.
///
/// Defaults to `Panic` in debug builds and `Log` in release builds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MisusePolicy {
    /// Log a warning and carry on
    Log,
    /// Log, then panic
    Panic,
}

impl Default for MisusePolicy {
    fn default() -> Self {
        if cfg!(debug_assertions) {
            Self::Panic
        } else {
            Self::Log
        }
    }
}

/// Coordinator tunables (lives under `[realtime]` in the binary's config file).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Bound on transport connection establishment. 0 disables the bound.
    #[serde(default = "default_open_timeout_ms")]
    pub open_timeout_ms: u64,
    #[serde(default)]
    pub misuse_policy: MisusePolicy,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            open_timeout_ms: default_open_timeout_ms(),
            misuse_policy: MisusePolicy::default(),
        }
    }
}

impl CoordinatorConfig {
    pub fn open_timeout(&self) -> Duration {
        Duration::from_millis(self.open_timeout_ms)
    }

    pub fn with_open_timeout(mut self, timeout: Duration) -> Self {
        self.open_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_misuse_policy(mut self, policy: MisusePolicy) -> Self {
        self.misuse_policy = policy;
        self
    }
}

fn default_open_timeout_ms() -> u64 {
    10_000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = CoordinatorConfig::default();
        assert_eq!(config.open_timeout(), Duration::from_secs(10));
        assert_eq!(config.misuse_policy, MisusePolicy::default());
    }

    #[test]
    fn misuse_is_loud_in_debug_builds() {
        let expected = if cfg!(debug_assertions) {
            MisusePolicy::Panic
        } else {
            MisusePolicy::Log
        };
        assert_eq!(MisusePolicy::default(), expected);
    }

    #[test]
    fn partial_deserialize_fills_defaults() {
        let config: CoordinatorConfig =
            serde_json::from_str(r#"{"misuse_policy":"log"}"#).unwrap();
        assert_eq!(config.misuse_policy, MisusePolicy::Log);
        assert_eq!(config.open_timeout_ms, 10_000);
    }
}

use std::path::Path;
use std::time::Duration;

use rally_realtime::CoordinatorConfig;
use serde::{Deserialize, Serialize};

// =============================================================================
// Config (figment-deserialized from defaults / rally.toml / env vars)
// =============================================================================
//
//   rally.toml:      [endpoint]
//                    url = "wss://project.example.co/realtime/v1/websocket"
//
//   env var:         RALLY_ENDPOINT__URL=...   (double underscore = nesting)
//
//   (single underscore stays within field names: RALLY_REALTIME__OPEN_TIMEOUT_MS)

pub const CONFIG_FILE: &str = "rally.toml";

/// Top-level configuration, deserialized by figment.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct WatchConfig {
    #[serde(default)]
    pub endpoint: EndpointConfig,
    #[serde(default)]
    pub realtime: CoordinatorConfig,
}

/// Realtime endpoint settings (lives under `[endpoint]` in rally.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EndpointConfig {
    /// WebSocket URL of the realtime service
    #[serde(default = "default_url")]
    pub url: String,
    /// Project API key, sent as the `apikey` query parameter
    #[serde(default)]
    pub api_key: Option<String>,
    /// Interval between protocol heartbeats. 0 disables them.
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            url: default_url(),
            api_key: None,
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
        }
    }
}

impl EndpointConfig {
    /// The URL to dial, with the protocol version and API key appended.
    pub fn socket_url(&self) -> String {
        let separator = if self.url.contains('?') { '&' } else { '?' };
        let mut url = format!("{}{}vsn=1.0.0", self.url, separator);
        if let Some(key) = self.api_key.as_deref().filter(|k| !k.is_empty()) {
            url.push_str("&apikey=");
            url.push_str(key);
        }
        url
    }

    pub fn heartbeat_interval(&self) -> Option<Duration> {
        match self.heartbeat_interval_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }
}

fn default_url() -> String {
    "ws://127.0.0.1:4000/realtime/v1/websocket".to_string()
}

fn default_heartbeat_interval_secs() -> u64 {
    30
}

/// Build a figment that layers: defaults → rally.toml → RALLY_* env vars.
///
/// Env vars use double-underscore for nesting into sections:
///   `RALLY_ENDPOINT__API_KEY=...`  →  `endpoint.api_key = "..."`
///   `RALLY_REALTIME__MISUSE_POLICY=panic`  →  `realtime.misuse_policy = "panic"`
pub fn load_config(config_dir: &Path) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    Figment::from(Serialized::defaults(WatchConfig::default()))
        .merge(Toml::file(config_dir.join(CONFIG_FILE)))
        .merge(Env::prefixed("RALLY_").split("__"))
}

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use topic_mux::MuxConfig;

// =============================================================================
// Unified config (figment-deserialized from defaults / realtime.toml / env)
// =============================================================================
//
// Two equivalent ways to configure:
//
//   realtime.toml:   [typing]
//                    countdown_ms = 1500
//
//   env var:         TIDEPOOL_TYPING__COUNTDOWN_MS=1500   (double underscore = nesting)

/// Top-level tunable configuration, deserialized by figment.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RealtimeFileConfig {
    #[serde(default)]
    pub multiplexer: MultiplexerFileConfig,
    #[serde(default)]
    pub presence: PresenceFileConfig,
    #[serde(default)]
    pub typing: TypingFileConfig,
}

/// Multiplexer tunables (lives under `[multiplexer]` in realtime.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MultiplexerFileConfig {
    #[serde(default = "default_teardown_delay_ms")]
    pub teardown_delay_ms: u64,
    #[serde(default = "default_keepalive_topic")]
    pub keepalive_topic: String,
}

impl Default for MultiplexerFileConfig {
    fn default() -> Self {
        Self {
            teardown_delay_ms: default_teardown_delay_ms(),
            keepalive_topic: default_keepalive_topic(),
        }
    }
}

/// Presence tunables (lives under `[presence]` in realtime.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PresenceFileConfig {
    /// Demote the local user to `away` after the page has been hidden for
    /// this long.
    #[serde(default = "default_idle_after_secs")]
    pub idle_after_secs: u64,
}

impl Default for PresenceFileConfig {
    fn default() -> Self {
        Self {
            idle_after_secs: default_idle_after_secs(),
        }
    }
}

/// Typing tunables (lives under `[typing]` in realtime.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TypingFileConfig {
    /// Quiet period after which a "stopped typing" signal is auto-emitted.
    #[serde(default = "default_countdown_ms")]
    pub countdown_ms: u64,
}

impl Default for TypingFileConfig {
    fn default() -> Self {
        Self {
            countdown_ms: default_countdown_ms(),
        }
    }
}

fn default_teardown_delay_ms() -> u64 {
    1000
}
fn default_keepalive_topic() -> String {
    "tidepool:keepalive".to_string()
}
fn default_idle_after_secs() -> u64 {
    300
}
fn default_countdown_ms() -> u64 {
    2000
}

/// Build a figment that layers: defaults → realtime.toml → TIDEPOOL_* env vars.
///
/// Env vars use double-underscore for nesting into sections:
///   `TIDEPOOL_PRESENCE__IDLE_AFTER_SECS=60`  →  `presence.idle_after_secs = 60`
pub fn load_config(config_dir: &Path) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    Figment::from(Serialized::defaults(RealtimeFileConfig::default()))
        .merge(Toml::file(config_dir.join("realtime.toml")))
        .merge(Env::prefixed("TIDEPOOL_").split("__"))
}

// =============================================================================
// Runtime config structs (derived from RealtimeFileConfig)
// =============================================================================

/// Presence configuration (runtime view).
#[derive(Clone, Debug)]
pub struct PresenceConfig {
    pub idle_after: Duration,
}

impl PresenceConfig {
    pub fn from_file(fc: &PresenceFileConfig) -> Self {
        Self {
            idle_after: Duration::from_secs(fc.idle_after_secs),
        }
    }
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self::from_file(&PresenceFileConfig::default())
    }
}

/// Typing configuration (runtime view).
#[derive(Clone, Debug)]
pub struct TypingConfig {
    pub countdown: Duration,
}

impl TypingConfig {
    pub fn from_file(fc: &TypingFileConfig) -> Self {
        Self {
            countdown: Duration::from_millis(fc.countdown_ms),
        }
    }
}

impl Default for TypingConfig {
    fn default() -> Self {
        Self::from_file(&TypingFileConfig::default())
    }
}

/// Resolved configuration for the whole realtime core.
#[derive(Clone, Debug)]
pub struct RealtimeConfig {
    pub mux: MuxConfig,
    pub presence: PresenceConfig,
    pub typing: TypingConfig,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self::from_file(&RealtimeFileConfig::default())
    }
}

impl RealtimeConfig {
    pub fn from_file(fc: &RealtimeFileConfig) -> Self {
        Self {
            mux: MuxConfig {
                teardown_delay: Duration::from_millis(fc.multiplexer.teardown_delay_ms),
                keepalive_topic: fc.multiplexer.keepalive_topic.clone(),
            },
            presence: PresenceConfig::from_file(&fc.presence),
            typing: TypingConfig::from_file(&fc.typing),
        }
    }
}

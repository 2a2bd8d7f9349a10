use crate::error::BridgeError;
use serde::{Deserialize, Serialize};

/// What scope teardown does with a handle that is pinned at the time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PinPolicy {
    /// Mark the handle and postpone the bulk free until the last unpin.
    #[default]
    Defer,
    /// Wait up to `timeout_ms` for the pin to be released, then defer.
    Block { timeout_ms: u64 },
}

/// Runtime configuration for a [`Session`](crate::Session).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeConfig {
    pub plan_cache_capacity: usize,
    pub cursor_batch_size: usize,
    pub pin_policy: PinPolicy,
    /// Valid handles older than this are reported by `Session::check_leaks`.
    pub leak_warning_ms: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            plan_cache_capacity: 128,
            cursor_batch_size: 100,
            pin_policy: PinPolicy::Defer,
            leak_warning_ms: 60_000,
        }
    }
}

impl BridgeConfig {
    pub fn with_plan_cache_capacity(mut self, capacity: usize) -> Self {
        self.plan_cache_capacity = capacity;
        self
    }

    pub fn with_cursor_batch_size(mut self, batch_size: usize) -> Self {
        self.cursor_batch_size = batch_size;
        self
    }

    pub fn with_pin_policy(mut self, policy: PinPolicy) -> Self {
        self.pin_policy = policy;
        self
    }

    pub fn with_leak_warning_ms(mut self, ms: u64) -> Self {
        self.leak_warning_ms = ms;
        self
    }

    pub fn validate(&self) -> Result<(), BridgeError> {
        if self.plan_cache_capacity == 0 {
            return Err(BridgeError::InvalidConfig {
                message: "plan_cache_capacity must be at least 1".into(),
            });
        }
        if let PinPolicy::Block { timeout_ms: 0 } = self.pin_policy {
            return Err(BridgeError::InvalidConfig {
                message: "pin_wait_ms must be positive for the block policy".into(),
            });
        }
        Ok(())
    }

    /// Builds a config from host-style `key = value` settings, the way a
    /// backend exposes extension parameters. Keys are case-insensitive.
    ///
    /// Recognised keys: `plan_cache_size`, `cursor_batch_size`,
    /// `pin_policy` (`defer` or `block`), `pin_wait_ms`, `leak_warning_ms`.
    pub fn from_settings<'a, I>(settings: I) -> Result<Self, BridgeError>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut config = Self::default();
        let mut blocking = false;
        let mut pin_wait_ms = 1_000;
        for (key, value) in settings {
            let value = value.trim();
            match key.trim().to_ascii_lowercase().as_str() {
                "plan_cache_size" => config.plan_cache_capacity = parse_setting(key, value)?,
                "cursor_batch_size" => config.cursor_batch_size = parse_setting(key, value)?,
                "pin_wait_ms" => pin_wait_ms = parse_setting(key, value)?,
                "leak_warning_ms" => config.leak_warning_ms = parse_setting(key, value)?,
                "pin_policy" => {
                    blocking = match value.to_ascii_lowercase().as_str() {
                        "defer" => false,
                        "block" => true,
                        other => {
                            return Err(BridgeError::InvalidConfig {
                                message: format!("pin_policy: unknown policy '{other}'"),
                            });
                        }
                    }
                }
                other => {
                    return Err(BridgeError::InvalidConfig {
                        message: format!("unknown setting '{other}'"),
                    });
                }
            }
        }
        if blocking {
            config.pin_policy = PinPolicy::Block {
                timeout_ms: pin_wait_ms,
            };
        }
        config.validate()?;
        Ok(config)
    }
}

fn parse_setting<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, BridgeError> {
    value.parse().map_err(|_| BridgeError::InvalidConfig {
        message: format!("{key}: cannot parse '{value}'"),
    })
}

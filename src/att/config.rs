use std::time::Duration;

use super::*;

/// Server configuration.
#[derive(Clone, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(default)]
pub struct Config {
    /// Server `ATT_MTU` sent in `ATT_EXCHANGE_MTU_RSP`.
    pub preferred_mtu: u16,
    /// Maximum attribute value length accepted by `ATT_EXECUTE_WRITE_REQ`.
    pub max_attr_len: usize,
    /// Size of the handle pool.
    pub max_handles: u16,
    /// Maximum number of prepared write fragments per connection.
    pub prep_queue_cap: usize,
    /// Idle timeout of a prepared write transaction.
    pub queued_write_timeout: Duration,
    /// Whether `ATT_SIGNED_WRITE_CMD` is accepted.
    pub signed_writes: bool,
    /// Consecutive signature failures before the link is terminated.
    pub max_sign_failures: u32,
    /// Whether clients that have not seen the latest registry change get
    /// `DatabaseOutOfSync` ([Vol 3] Part G, Section 2.5.2.1).
    pub robust_caching: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            preferred_mtu: 256,
            max_attr_len: MAX_VAL_LEN,
            max_handles: u16::MAX,
            prep_queue_cap: 64,
            queued_write_timeout: Duration::from_secs(30),
            signed_writes: true,
            max_sign_failures: 3,
            robust_caching: false,
        }
    }
}

impl Config {
    /// Returns the server MTU clamped to the valid range.
    #[inline]
    #[must_use]
    pub fn server_mtu(&self) -> u16 {
        self.preferred_mtu.clamp(DEFAULT_MTU, MAX_MTU)
    }
}

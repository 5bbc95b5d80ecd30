//! Node configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Default deadline for one request/response exchange.
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 10_000;
/// Default cap on a single frame.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 1024 * 1024;
/// Default routing table bucket size (k).
pub const DEFAULT_BUCKET_SIZE: usize = 20;

/// Tunables shared by the transport and the routing table.
///
/// Missing fields fall back to their defaults, so `{}` is a valid config.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub request_timeout_ms: u64,
    pub max_frame_size: usize,
    pub bucket_size: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            bucket_size: DEFAULT_BUCKET_SIZE,
        }
    }
}

impl NodeConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

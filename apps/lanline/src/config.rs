use std::env;
use std::time::Duration;

use tracing::warn;
use url::Url;

use crate::error::CallError;
use crate::peer::{AddressFamily, CandidatePolicy};

pub const DEFAULT_RELAY_URL: &str = "ws://localhost:8080";
pub const DEFAULT_RING_TIMEOUT_SECS: u64 = 45;

/// How to reach the relay and who to claim to be.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub url: Url,
    pub user_id: Option<String>,
    pub name: Option<String>,
    pub token: Option<String>,
}

impl RelayConfig {
    pub fn new(url: &str) -> Result<Self, CallError> {
        let url = Url::parse(url)
            .map_err(|e| CallError::Signaling(format!("invalid relay url '{url}': {e}")))?;
        Ok(Self {
            url,
            user_id: None,
            name: None,
            token: None,
        })
    }

    /// WebSocket URL carrying the identity parameters.
    pub fn connect_url(&self) -> Url {
        let mut url = self.url.clone();
        if url.path().is_empty() || url.path() == "/" {
            url.set_path("/ws");
        }
        {
            let mut query = url.query_pairs_mut();
            if let Some(token) = &self.token {
                query.append_pair("token", token);
            }
            if let Some(user_id) = &self.user_id {
                query.append_pair("user_id", user_id);
            }
            if let Some(name) = &self.name {
                query.append_pair("name", name);
            }
        }
        url
    }
}

/// Behaviour of the call session.
#[derive(Debug, Clone)]
pub struct CallConfig {
    /// How long an unanswered ring waits before giving up. `None` waits forever.
    pub ring_timeout: Option<Duration>,
    pub candidate_policy: CandidatePolicy,
    /// Name presented to callees; the relay fills it from the identity when unset.
    pub display_name: Option<String>,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            ring_timeout: Some(Duration::from_secs(DEFAULT_RING_TIMEOUT_SECS)),
            candidate_policy: CandidatePolicy::default(),
            display_name: None,
        }
    }
}

impl CallConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(value) = env::var("LANLINE_RING_TIMEOUT_SECS") {
            match value.parse::<u64>() {
                Ok(0) => config.ring_timeout = None,
                Ok(secs) => config.ring_timeout = Some(Duration::from_secs(secs)),
                Err(_) => warn!(value, "ignoring invalid LANLINE_RING_TIMEOUT_SECS"),
            }
        }

        if let Ok(value) = env::var("LANLINE_ADDRESS_FAMILY") {
            match value.parse::<AddressFamily>() {
                Ok(family) => config.candidate_policy = CandidatePolicy::new(family),
                Err(err) => warn!(error = %err, "ignoring LANLINE_ADDRESS_FAMILY"),
            }
        }

        config.display_name = env::var("LANLINE_NAME").ok().filter(|n| !n.trim().is_empty());
        config
    }
}

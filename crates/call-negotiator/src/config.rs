use std::env;
use std::time::Duration;

use thiserror::Error;

use crate::error::NegotiationError;
use crate::id::CallId;

/// Public STUN servers used when nothing else is configured.
pub const DEFAULT_STUN_URLS: [&str; 4] = [
    "stun:stun1.l.google.com:19302",
    "stun:stun2.l.google.com:19302",
    "stun:stun3.l.google.com:19302",
    "stun:stun4.l.google.com:19302",
];

/// STUN/TURN entry handed to the engine untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceServer {
    pub urls: Vec<String>,
    pub username: Option<String>,
    pub credential: Option<String>,
}

impl IceServer {
    pub fn new(urls: Vec<String>) -> Self {
        Self {
            urls,
            username: None,
            credential: None,
        }
    }

    pub fn with_credentials(urls: Vec<String>, username: String, credential: String) -> Self {
        Self {
            urls,
            username: Some(username),
            credential: Some(credential),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("local peer id must not be empty")]
    EmptyPeerId,
    #[error("candidate batch window must be greater than zero")]
    ZeroBatchWindow,
    #[error("answer timeout must be greater than zero")]
    ZeroAnswerTimeout,
    #[error("invalid value {value:?} for {var}")]
    InvalidValue { var: &'static str, value: String },
}

impl From<ConfigError> for NegotiationError {
    fn from(err: ConfigError) -> Self {
        NegotiationError::Config(err.to_string())
    }
}

/// Negotiator configuration.
#[derive(Debug, Clone)]
pub struct CallConfig {
    /// Our own peer id: the `from` of outbound messages and the tie-break key
    /// when two peers dial each other at once.
    pub local_peer_id: String,
    pub ice_servers: Vec<IceServer>,
    /// ICE restarts attempted before a failure is terminal.
    pub max_ice_restarts: u32,
    /// Reclaims calls whose offer was never answered. Off by default.
    pub answer_timeout: Option<Duration>,
    /// Coalesce local candidates for this long before sending. `None` sends
    /// each candidate as soon as it is gathered.
    pub candidate_batch_window: Option<Duration>,
    /// Candidates held for call ids we have not seen a description for yet.
    pub orphan_candidate_limit: usize,
    pub orphan_candidate_ttl: Duration,
    /// How many closed call ids are remembered so late traffic is dropped.
    pub closed_id_memory: usize,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            local_peer_id: random_peer_id(),
            ice_servers: vec![IceServer::new(
                DEFAULT_STUN_URLS.iter().map(|url| url.to_string()).collect(),
            )],
            max_ice_restarts: 1,
            answer_timeout: None,
            candidate_batch_window: None,
            orphan_candidate_limit: 64,
            orphan_candidate_ttl: Duration::from_secs(30),
            closed_id_memory: 256,
        }
    }
}

impl CallConfig {
    pub fn new(local_peer_id: impl Into<String>) -> Self {
        Self {
            local_peer_id: local_peer_id.into(),
            ..Default::default()
        }
    }

    /// No STUN/TURN; host candidates only.
    pub fn localhost(local_peer_id: impl Into<String>) -> Self {
        Self {
            ice_servers: Vec::new(),
            ..Self::new(local_peer_id)
        }
    }

    pub fn builder() -> CallConfigBuilder {
        CallConfigBuilder::default()
    }

    /// Load configuration from `CALL_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    pub(crate) fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = CallConfig::default();
        if let Some(peer) = lookup("CALL_PEER_ID") {
            config.local_peer_id = peer.trim().to_string();
        }
        if let Some(urls) = lookup("CALL_ICE_SERVERS") {
            let urls: Vec<String> = urls
                .split(',')
                .map(str::trim)
                .filter(|url| !url.is_empty())
                .map(str::to_string)
                .collect();
            config.ice_servers = if urls.is_empty() {
                Vec::new()
            } else {
                vec![IceServer::new(urls)]
            };
        }
        if lookup("CALL_LOCALHOST_ONLY").is_some_and(|v| v != "0" && !v.is_empty()) {
            config.ice_servers.clear();
        }
        if let Some(value) = lookup("CALL_MAX_ICE_RESTARTS") {
            config.max_ice_restarts = parse_number("CALL_MAX_ICE_RESTARTS", &value)?;
        }
        if let Some(value) = lookup("CALL_ANSWER_TIMEOUT_MS") {
            let millis = parse_number("CALL_ANSWER_TIMEOUT_MS", &value)?;
            config.answer_timeout = Some(Duration::from_millis(millis));
        }
        if let Some(value) = lookup("CALL_CANDIDATE_BATCH_MS") {
            let millis = parse_number("CALL_CANDIDATE_BATCH_MS", &value)?;
            config.candidate_batch_window = Some(Duration::from_millis(millis));
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.local_peer_id.trim().is_empty() {
            return Err(ConfigError::EmptyPeerId);
        }
        if self.candidate_batch_window == Some(Duration::ZERO) {
            return Err(ConfigError::ZeroBatchWindow);
        }
        if self.answer_timeout == Some(Duration::ZERO) {
            return Err(ConfigError::ZeroAnswerTimeout);
        }
        Ok(())
    }
}

fn parse_number<T: std::str::FromStr>(var: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        var,
        value: value.to_string(),
    })
}

fn random_peer_id() -> String {
    let id = CallId::random();
    format!("peer-{}", &id.as_str()[..12])
}

/// Builder for [`CallConfig`].
#[derive(Debug, Default)]
pub struct CallConfigBuilder {
    local_peer_id: Option<String>,
    ice_servers: Vec<IceServer>,
    localhost_only: bool,
    max_ice_restarts: Option<u32>,
    answer_timeout: Option<Duration>,
    candidate_batch_window: Option<Duration>,
    orphan_candidate_limit: Option<usize>,
    orphan_candidate_ttl: Option<Duration>,
}

impl CallConfigBuilder {
    pub fn local_peer_id(mut self, peer_id: impl Into<String>) -> Self {
        self.local_peer_id = Some(peer_id.into());
        self
    }

    pub fn add_ice_server(mut self, urls: Vec<String>) -> Self {
        self.ice_servers.push(IceServer::new(urls));
        self
    }

    pub fn add_ice_server_with_credentials(
        mut self,
        urls: Vec<String>,
        username: String,
        credential: String,
    ) -> Self {
        self.ice_servers
            .push(IceServer::with_credentials(urls, username, credential));
        self
    }

    pub fn localhost_only(mut self) -> Self {
        self.localhost_only = true;
        self
    }

    pub fn max_ice_restarts(mut self, restarts: u32) -> Self {
        self.max_ice_restarts = Some(restarts);
        self
    }

    pub fn answer_timeout(mut self, timeout: Duration) -> Self {
        self.answer_timeout = Some(timeout);
        self
    }

    pub fn candidate_batch_window(mut self, window: Duration) -> Self {
        self.candidate_batch_window = Some(window);
        self
    }

    pub fn orphan_candidates(mut self, limit: usize, ttl: Duration) -> Self {
        self.orphan_candidate_limit = Some(limit);
        self.orphan_candidate_ttl = Some(ttl);
        self
    }

    pub fn build(self) -> Result<CallConfig, ConfigError> {
        let mut config = match self.local_peer_id {
            Some(peer) => CallConfig::new(peer),
            None => CallConfig::default(),
        };
        if !self.ice_servers.is_empty() {
            config.ice_servers = self.ice_servers;
        }
        if self.localhost_only {
            config.ice_servers.clear();
        }
        if let Some(restarts) = self.max_ice_restarts {
            config.max_ice_restarts = restarts;
        }
        config.answer_timeout = self.answer_timeout;
        config.candidate_batch_window = self.candidate_batch_window;
        if let Some(limit) = self.orphan_candidate_limit {
            config.orphan_candidate_limit = limit;
        }
        if let Some(ttl) = self.orphan_candidate_ttl {
            config.orphan_candidate_ttl = ttl;
        }
        config.validate()?;
        Ok(config)
    }
}

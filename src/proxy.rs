use crate::config::ProxyConfig;
use anyhow::Context;
use base64::Engine;
use std::fmt;
use std::path::Path;
use std::sync::Mutex;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum ProxyParseError {
    #[error("missing port in proxy '{0}'")]
    MissingPort(String),
    #[error("invalid port in proxy '{0}'")]
    InvalidPort(String),
    #[error("missing password in proxy credentials '{0}'")]
    MissingPassword(String),
    #[error("empty host in proxy '{0}'")]
    EmptyHost(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyHealth {
    Healthy,
    Quarantined,
}

#[derive(Clone, PartialEq, Eq)]
pub struct ProxyCredentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for ProxyCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyCredentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// An outbound proxy as handed out by the pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyEndpoint {
    pub host: String,
    pub port: u16,
    pub credentials: Option<ProxyCredentials>,
    slot: usize,
}

impl ProxyEndpoint {
    /// Parse `username:password@host:port` or plain `host:port`
    pub fn parse(line: &str) -> Result<Self, ProxyParseError> {
        let line = line.trim();
        let (credentials, server) = match line.rsplit_once('@') {
            Some((auth, server)) => {
                let (username, password) = auth
                    .split_once(':')
                    .ok_or_else(|| ProxyParseError::MissingPassword(line.to_string()))?;
                (
                    Some(ProxyCredentials {
                        username: username.to_string(),
                        password: password.to_string(),
                    }),
                    server,
                )
            }
            None => (None, line),
        };

        let (host, port) = server
            .rsplit_once(':')
            .ok_or_else(|| ProxyParseError::MissingPort(line.to_string()))?;
        if host.is_empty() {
            return Err(ProxyParseError::EmptyHost(line.to_string()));
        }
        let port = port
            .parse::<u16>()
            .map_err(|_| ProxyParseError::InvalidPort(line.to_string()))?;

        Ok(Self {
            host: host.to_string(),
            port,
            credentials,
            slot: 0,
        })
    }

    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// URL form understood by HTTP clients (credentials are passed separately)
    pub fn url(&self) -> String {
        format!("http://{}", self.authority())
    }

    /// Value for a `Proxy-Authorization` header, if the proxy has credentials
    pub fn basic_auth(&self) -> Option<String> {
        self.credentials.as_ref().map(|c| {
            let raw = format!("{}:{}", c.username, c.password);
            format!(
                "Basic {}",
                base64::engine::general_purpose::STANDARD.encode(raw)
            )
        })
    }
}

impl fmt::Display for ProxyEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.credentials {
            Some(c) => write!(f, "{}:***@{}", c.username, self.authority()),
            None => f.write_str(&self.authority()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProxyStats {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
}

#[derive(Debug)]
struct Slot {
    endpoint: ProxyEndpoint,
    health: ProxyHealth,
    consecutive_failures: u32,
    stats: ProxyStats,
}

#[derive(Debug)]
struct PoolState {
    slots: Vec<Slot>,
    cursor: usize,
    /// Successful uses of the endpoint under the cursor since it became current
    streak: u32,
    degraded_logged: bool,
    /// Quarantined count at the last batch boundary
    reported_quarantined: usize,
}

impl PoolState {
    fn healthy_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| s.health == ProxyHealth::Healthy)
            .count()
    }

    /// Move the cursor to the next healthy slot after the current one.
    fn advance(&mut self) {
        self.streak = 0;
        let len = self.slots.len();
        for step in 1..=len {
            let candidate = (self.cursor + step) % len;
            if self.slots[candidate].health == ProxyHealth::Healthy {
                self.cursor = candidate;
                return;
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolSnapshot {
    pub total: usize,
    pub healthy: usize,
    pub quarantined: usize,
    pub stats: Vec<(String, ProxyHealth, ProxyStats)>,
}

/// Round-robin proxy rotation with permanent quarantine of failing endpoints.
///
/// All state lives behind one mutex; workers only ever hold it for the
/// duration of an acquire or report call.
#[derive(Debug)]
pub struct ProxyPool {
    state: Mutex<PoolState>,
    rotation_count: u32,
    failure_threshold: u32,
}

impl ProxyPool {
    pub fn new(endpoints: Vec<ProxyEndpoint>, config: &ProxyConfig) -> Self {
        let slots = endpoints
            .into_iter()
            .enumerate()
            .map(|(slot, mut endpoint)| {
                endpoint.slot = slot;
                Slot {
                    endpoint,
                    health: ProxyHealth::Healthy,
                    consecutive_failures: 0,
                    stats: ProxyStats::default(),
                }
            })
            .collect::<Vec<_>>();

        log::info!("Proxy pool initialized with {} proxies", slots.len());

        Self {
            state: Mutex::new(PoolState {
                slots,
                cursor: 0,
                streak: 0,
                degraded_logged: false,
                reported_quarantined: 0,
            }),
            rotation_count: config.rotation_count.max(1),
            failure_threshold: config.failure_threshold.max(1),
        }
    }

    pub fn empty(config: &ProxyConfig) -> Self {
        Self::new(Vec::new(), config)
    }

    /// Load `username:password@host:port` lines. A missing file yields an empty pool.
    pub fn from_file(path: &Path, config: &ProxyConfig) -> anyhow::Result<Self> {
        if !path.exists() {
            log::info!("No proxy file found at {}, using direct connections", path.display());
            return Ok(Self::empty(config));
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read proxy file: {}", path.display()))?;

        let mut endpoints = Vec::new();
        for (index, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            match ProxyEndpoint::parse(line) {
                Ok(endpoint) => endpoints.push(endpoint),
                Err(e) => log::warn!("Invalid proxy on line {}: {e}", index + 1),
            }
        }

        Ok(Self::new(endpoints, config))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PoolState> {
        // Counters stay usable after a worker panic
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Hand out the current endpoint, or `None` when running without proxies.
    pub fn acquire(&self) -> Option<ProxyEndpoint> {
        let mut state = self.lock();

        if state.slots.is_empty() {
            return None;
        }

        if state.healthy_count() == 0 {
            if !state.degraded_logged {
                log::warn!("All proxies quarantined, continuing with direct connections");
                state.degraded_logged = true;
            }
            return None;
        }

        if state.streak >= self.rotation_count
            || state.slots[state.cursor].health == ProxyHealth::Quarantined
        {
            let old = state.cursor;
            state.advance();
            log::debug!("Proxy rotated: {} -> {}", old, state.cursor);
        }

        let cursor = state.cursor;
        let slot = &mut state.slots[cursor];
        slot.stats.total_requests += 1;
        Some(slot.endpoint.clone())
    }

    pub fn report_success(&self, endpoint: &ProxyEndpoint) {
        let mut state = self.lock();
        let cursor = state.cursor;
        let Some(slot) = state.slots.get_mut(endpoint.slot) else {
            return;
        };
        slot.consecutive_failures = 0;
        slot.stats.successful_requests += 1;
        if endpoint.slot == cursor {
            state.streak += 1;
        }
    }

    pub fn report_failure(&self, endpoint: &ProxyEndpoint) {
        let mut state = self.lock();
        let cursor = state.cursor;
        let threshold = self.failure_threshold;
        let Some(slot) = state.slots.get_mut(endpoint.slot) else {
            return;
        };
        slot.stats.failed_requests += 1;
        if slot.health == ProxyHealth::Quarantined {
            return;
        }
        slot.consecutive_failures += 1;
        if slot.consecutive_failures >= threshold {
            slot.health = ProxyHealth::Quarantined;
            log::warn!(
                "Proxy quarantined after {} consecutive failures: {}",
                slot.consecutive_failures,
                slot.endpoint
            );
            if endpoint.slot == cursor {
                state.advance();
            }
        }
    }

    /// Batch-boundary health check. The current endpoint starts a fresh
    /// rotation quota and newly quarantined endpoints are reported once.
    pub fn on_batch_boundary(&self) {
        let mut state = self.lock();
        if state.slots.is_empty() {
            return;
        }
        state.streak = 0;

        let healthy = state.healthy_count();
        let quarantined = state.slots.len() - healthy;
        if quarantined > state.reported_quarantined {
            log::warn!(
                "Proxy health: {healthy} healthy, {quarantined} quarantined ({} new this batch)",
                quarantined - state.reported_quarantined
            );
            state.reported_quarantined = quarantined;
        } else {
            log::debug!("Proxy health: {healthy} healthy, {quarantined} quarantined");
        }
    }

    pub fn snapshot(&self) -> PoolSnapshot {
        let state = self.lock();
        let healthy = state.healthy_count();
        PoolSnapshot {
            total: state.slots.len(),
            healthy,
            quarantined: state.slots.len() - healthy,
            stats: state
                .slots
                .iter()
                .map(|s| (s.endpoint.to_string(), s.health, s.stats.clone()))
                .collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.lock().slots.is_empty()
    }
}

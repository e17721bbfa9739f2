// config.rs - Account configuration

use crate::auth::Credentials;
use crate::transaction::TransactionTimers;
use crate::transport::TransportProtocol;
use crate::{SipError, SipResult};
use serde::{Deserialize, Serialize};
use std::ops::RangeInclusive;
use std::path::Path;
use std::time::Duration;
use tracing::debug;

pub const DEFAULT_SIP_PORT: u16 = 5060;
pub const DEFAULT_REGISTER_EXPIRES: u32 = 900;

/// Timer settings, all in milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimerConfig {
    /// How often outstanding transactions are checked for resend/timeout
    pub resend_sweep_ms: u64,

    /// First resend of an unanswered UDP request
    pub resend_after_ms: u64,

    /// Unanswered UDP requests are abandoned after this long
    pub udp_give_up_ms: u64,

    /// Unanswered TCP requests are abandoned after this long
    pub tcp_give_up_ms: u64,

    /// Subscription, publication and re-registration sweep
    pub subscribe_sweep_ms: u64,

    /// Upper bound of the random delay added to the subscribe sweep
    pub subscribe_jitter_ms: u64,

    pub keepalive_ms: u64,
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            resend_sweep_ms: 2500,
            resend_after_ms: 2000,
            udp_give_up_ms: 5000,
            tcp_give_up_ms: 32_000,
            subscribe_sweep_ms: 10_000,
            subscribe_jitter_ms: 100,
            keepalive_ms: 30_000,
        }
    }
}

impl TimerConfig {
    pub fn resend_sweep(&self) -> Duration {
        Duration::from_millis(self.resend_sweep_ms)
    }

    pub fn subscribe_sweep(&self) -> Duration {
        Duration::from_millis(self.subscribe_sweep_ms)
    }

    pub fn keepalive(&self) -> Duration {
        Duration::from_millis(self.keepalive_ms)
    }

    /// Transaction timers for the chosen transport.
    pub fn transaction_timers(&self, protocol: TransportProtocol) -> TransactionTimers {
        match protocol {
            TransportProtocol::Udp => TransactionTimers {
                resend_after: Some(Duration::from_millis(self.resend_after_ms)),
                give_up_after: Duration::from_millis(self.udp_give_up_ms),
                ..TransactionTimers::unreliable()
            },
            TransportProtocol::Tcp => TransactionTimers {
                give_up_after: Duration::from_millis(self.tcp_give_up_ms),
                ..TransactionTimers::reliable()
            },
        }
    }
}

/// Account configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AccountConfig {
    /// `user@server`
    pub username: String,

    pub password: String,

    pub transport: TransportProtocol,

    /// Server port; 0 means take it from SRV or use 5060
    pub port: u16,

    /// Send everything to `proxy` instead of the server
    pub use_proxy: bool,

    pub proxy: Option<String>,

    /// Authentication user when it differs from the SIP user
    pub auth_user: Option<String>,

    /// NTLM domain
    pub auth_domain: Option<String>,

    /// PUBLISH our presence to the server
    pub publish: bool,

    pub register_expires: u32,

    pub user_agent: String,

    /// Buddies subscribed to after login
    pub roster: Vec<String>,

    /// Peers refused when they subscribe to our presence
    pub deny: Vec<String>,

    pub listen_port_min: u16,

    pub listen_port_max: u16,

    pub timers: TimerConfig,
}

impl Default for AccountConfig {
    fn default() -> Self {
        Self {
            username: String::new(),
            password: String::new(),
            transport: TransportProtocol::Tcp,
            port: 0,
            use_proxy: false,
            proxy: None,
            auth_user: None,
            auth_domain: None,
            publish: true,
            register_expires: DEFAULT_REGISTER_EXPIRES,
            user_agent: format!("{}/{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION")),
            roster: Vec::new(),
            deny: Vec::new(),
            listen_port_min: 5060,
            listen_port_max: 5160,
            timers: TimerConfig::default(),
        }
    }
}

impl AccountConfig {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            ..Self::default()
        }
    }

    pub fn from_json_str(json: &str) -> SipResult<Self> {
        serde_json::from_str(json).map_err(|e| SipError::Config(format!("Invalid config: {}", e)))
    }

    /// Reads a JSON file and applies environment overrides.
    pub fn from_file(path: impl AsRef<Path>) -> SipResult<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| {
            SipError::Config(format!("Unable to read {}: {}", path.display(), e))
        })?;
        let mut config = Self::from_json_str(&json)?;
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// `SIMPLE_USERNAME`, `SIMPLE_PASSWORD`, `SIMPLE_PROXY`, `SIMPLE_TRANSPORT`.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> SipResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(username) = lookup("SIMPLE_USERNAME") {
            self.username = username;
        }
        if let Some(password) = lookup("SIMPLE_PASSWORD") {
            self.password = password;
        }
        if let Some(proxy) = lookup("SIMPLE_PROXY") {
            debug!("Proxy {} taken from the environment", proxy);
            self.use_proxy = !proxy.is_empty();
            self.proxy = Some(proxy).filter(|proxy| !proxy.is_empty());
        }
        if let Some(transport) = lookup("SIMPLE_TRANSPORT") {
            self.transport = match transport.to_ascii_lowercase().as_str() {
                "udp" => TransportProtocol::Udp,
                "tcp" => TransportProtocol::Tcp,
                other => {
                    return Err(SipError::Config(format!("Unknown transport: {}", other)))
                }
            };
        }
        Ok(())
    }

    pub fn validate(&self) -> SipResult<()> {
        if self.username.chars().any(char::is_whitespace) {
            return Err(SipError::Config(
                "SIP usernames may not contain whitespaces or @ symbols".to_string(),
            ));
        }

        match self.username.split_once('@') {
            Some((user, server)) if !user.is_empty() && !server.is_empty() && !server.contains('@') => {}
            _ => {
                return Err(SipError::Config(
                    "SIP connect server not specified".to_string(),
                ))
            }
        }

        if self.use_proxy && self.proxy.as_deref().map_or(true, str::is_empty) {
            return Err(SipError::Config("Proxy enabled but not set".to_string()));
        }

        if self.listen_port_min > self.listen_port_max {
            return Err(SipError::Config(format!(
                "Empty listen port range {}-{}",
                self.listen_port_min, self.listen_port_max
            )));
        }

        Ok(())
    }

    /// Local part of the username.
    pub fn user(&self) -> &str {
        self.username
            .split_once('@')
            .map_or(self.username.as_str(), |(user, _)| user)
    }

    /// Domain part of the username.
    pub fn server(&self) -> &str {
        self.username
            .split_once('@')
            .map_or("", |(_, server)| server)
    }

    /// `sip:user@server`
    pub fn sip_uri(&self) -> String {
        format!("sip:{}@{}", self.user(), self.server())
    }

    /// Host the SRV lookup and connection fall back to.
    pub fn connect_host(&self) -> &str {
        match (&self.proxy, self.use_proxy) {
            (Some(proxy), true) => proxy,
            _ => self.server(),
        }
    }

    pub fn listen_ports(&self) -> RangeInclusive<u16> {
        self.listen_port_min..=self.listen_port_max
    }

    pub fn credentials(&self) -> Credentials {
        Credentials {
            username: self
                .auth_user
                .clone()
                .filter(|user| !user.is_empty())
                .unwrap_or_else(|| self.user().to_string()),
            password: self.password.clone(),
            domain: self.auth_domain.clone().unwrap_or_default(),
        }
    }
}

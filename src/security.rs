// security.rs - Inbound message hardening and presence privacy

use crate::{header_names_match, SipError, SipMessage, SipParseError, SipResult};
use ahash::{AHashMap, AHashSet};
use std::time::{Duration, Instant};
use tracing::warn;

/// Limits applied to inbound traffic before the session sees it
#[derive(Debug, Clone)]
pub struct SecurityConfig {
    /// Longest From/To/Contact value accepted
    pub max_address_header: usize,

    /// Longest Via value accepted
    pub max_via_header: usize,

    /// Rate limit window
    pub rate_limit_window: Duration,

    /// Maximum requests per peer per window
    pub max_requests_per_window: usize,

    /// Reject header values carrying CR or LF
    pub detect_header_injection: bool,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            max_address_header: 512,
            max_via_header: 256,
            rate_limit_window: Duration::from_secs(60),
            max_requests_per_window: 600,
            detect_header_injection: true,
        }
    }
}

/// Sliding-window request counter per remote party
#[derive(Debug)]
pub struct RateLimiter {
    requests: AHashMap<String, Vec<Instant>>,
    window: Duration,
    max_requests: usize,
}

impl RateLimiter {
    pub fn new(window: Duration, max_requests: usize) -> Self {
        Self {
            requests: AHashMap::new(),
            window,
            max_requests,
        }
    }

    pub fn check_rate_limit(&mut self, peer: &str, now: Instant) -> Result<(), SipParseError> {
        let window = self.window;
        let entries = self.requests.entry(peer.to_string()).or_default();

        entries.retain(|&time| now.saturating_duration_since(time) < window);

        if entries.len() >= self.max_requests {
            return Err(SipParseError::SecurityViolation(format!(
                "Rate limit exceeded for {}",
                peer
            )));
        }

        entries.push(now);
        Ok(())
    }

    pub fn cleanup_old_entries(&mut self, now: Instant) {
        let window = self.window;
        self.requests.retain(|_, entries| {
            entries.retain(|&time| now.saturating_duration_since(time) < window);
            !entries.is_empty()
        });
    }

    pub fn tracked_peers(&self) -> usize {
        self.requests.len()
    }
}

/// Validates every inbound message before it is dispatched
#[derive(Debug)]
pub struct InboundValidator {
    config: SecurityConfig,
    rate_limiter: RateLimiter,
}

impl InboundValidator {
    pub fn new(config: SecurityConfig) -> Self {
        let rate_limiter =
            RateLimiter::new(config.rate_limit_window, config.max_requests_per_window);
        Self {
            config,
            rate_limiter,
        }
    }

    /// Structural and content checks. Requests are also counted against
    /// the sender's rate limit, keyed by the From URI.
    pub fn validate_message(&mut self, message: &SipMessage, now: Instant) -> SipResult<()> {
        message.validate()?;

        for (name, value) in message.headers().iter() {
            self.validate_header_value(name, value)?;
        }

        if let SipMessage::Request(request) = message {
            if request.uri.contains('\0') || request.uri.chars().any(char::is_whitespace) {
                return Err(violation(format!("Invalid request URI: {:?}", request.uri)));
            }

            let peer = message
                .header("From")
                .and_then(crate::utils::parse_uri_from_header)
                .unwrap_or("unknown");
            self.rate_limiter.check_rate_limit(peer, now)?;
        }

        Ok(())
    }

    fn validate_header_value(&self, name: &str, value: &str) -> Result<(), SipParseError> {
        if value.contains('\0') {
            return Err(SipParseError::SecurityViolation(format!(
                "Null byte detected in header '{}'",
                name
            )));
        }

        if self.config.detect_header_injection && (value.contains('\r') || value.contains('\n')) {
            return Err(SipParseError::SecurityViolation(format!(
                "Line break injected into header '{}'",
                name
            )));
        }

        let limit = if ["From", "To", "Contact"]
            .iter()
            .any(|header| header_names_match(name, header))
        {
            Some(self.config.max_address_header)
        } else if header_names_match(name, "Via") {
            Some(self.config.max_via_header)
        } else {
            None
        };

        match limit {
            Some(limit) if value.len() > limit => {
                Err(SipParseError::HeaderTooLong(value.len(), limit))
            }
            _ => Ok(()),
        }
    }

    pub fn cleanup(&mut self, now: Instant) {
        self.rate_limiter.cleanup_old_entries(now);
    }
}

impl Default for InboundValidator {
    fn default() -> Self {
        Self::new(SecurityConfig::default())
    }
}

fn violation(reason: String) -> SipError {
    SipError::MalformedMessage(SipParseError::SecurityViolation(reason))
}

/// Decides who may watch our presence. Entries are compared as
/// normalized, case-insensitive SIP URIs.
#[derive(Debug, Clone, Default)]
pub struct PrivacyPolicy {
    denied: AHashSet<String>,
}

impl PrivacyPolicy {
    pub fn new<I, S>(denied: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            denied: denied
                .into_iter()
                .map(|name| Self::key(name.as_ref()))
                .collect(),
        }
    }

    fn key(name: &str) -> String {
        crate::utils::normalize_sip_uri(name).to_lowercase()
    }

    pub fn deny(&mut self, name: &str) {
        self.denied.insert(Self::key(name));
    }

    pub fn is_permitted(&self, peer: &str) -> bool {
        let permitted = !self.denied.contains(&Self::key(peer));
        if !permitted {
            warn!("Presence subscription from {} denied", peer);
        }
        permitted
    }
}

//! Challenge/response authentication for the registrar and outbound proxy.
//!
//! Each target gets its own [`AuthContext`]. A context moves through
//! `NoChallenge -> ChallengeReceived -> ResponseSent -> Accepted`, or ends
//! in `RetriesExhausted` once a server keeps rejecting our credentials.

use crate::ntlm::{self, Type2Challenge};
use crate::{SipError, SipMethod, SipResult};
use tracing::{debug, warn};

/// Challenges accepted per context before giving up.
pub const MAX_AUTH_RETRIES: u32 = 3;

/// Nonce-count value marking "type-2 received, answer with type-3".
const NTLM_TYPE2_RECEIVED: u32 = 3;

const NTLM_HOSTNAME: &str = env!("CARGO_PKG_NAME");

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthScheme {
    Digest,
    Ntlm,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    NoChallenge,
    ChallengeReceived,
    ResponseSent,
    Accepted,
    RetriesExhausted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
    pub domain: String,
}

#[derive(Debug, Clone)]
pub struct AuthContext {
    name: &'static str,
    state: AuthState,
    scheme: Option<AuthScheme>,
    realm: Option<String>,
    nonce: Option<String>,
    opaque: Option<String>,
    target: Option<String>,
    session_key: Option<String>,
    ntlm_challenge: Option<Type2Challenge>,
    nonce_count: u32,
    retries: u32,
}

/// Splits `key="value", key=value` challenge parameters. Keys are lowercased.
pub fn parse_auth_params(input: &str) -> Vec<(String, String)> {
    let mut params = Vec::new();
    let mut rest = input;

    loop {
        rest = rest.trim_start_matches(|c: char| c == ',' || c.is_whitespace());
        let Some(eq) = rest.find('=') else {
            break;
        };
        let key = rest[..eq].trim().to_ascii_lowercase();
        rest = rest[eq + 1..].trim_start();

        let value = if let Some(quoted) = rest.strip_prefix('"') {
            let mut value = String::new();
            let mut chars = quoted.char_indices();
            let mut consumed = quoted.len();
            while let Some((i, c)) = chars.next() {
                match c {
                    '\\' => {
                        if let Some((_, escaped)) = chars.next() {
                            value.push(escaped);
                        }
                    }
                    '"' => {
                        consumed = i + 1;
                        break;
                    }
                    c => value.push(c),
                }
            }
            rest = &quoted[consumed..];
            value
        } else {
            let end = rest.find(',').unwrap_or(rest.len());
            let value = rest[..end].trim().to_string();
            rest = &rest[end..];
            value
        };

        params.push((key, value));
    }

    params
}

fn param<'a>(params: &'a [(String, String)], key: &str) -> Option<&'a str> {
    params
        .iter()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.as_str())
}

fn md5_hex(input: &str) -> String {
    format!("{:x}", md5::compute(input.as_bytes()))
}

impl AuthContext {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            state: AuthState::NoChallenge,
            scheme: None,
            realm: None,
            nonce: None,
            opaque: None,
            target: None,
            session_key: None,
            ntlm_challenge: None,
            nonce_count: 0,
            retries: 0,
        }
    }

    pub fn state(&self) -> AuthState {
        self.state
    }

    pub fn scheme(&self) -> Option<AuthScheme> {
        self.scheme
    }

    /// Whether requests to this target should carry credentials.
    pub fn is_active(&self) -> bool {
        self.scheme.is_some() && self.state != AuthState::RetriesExhausted
    }

    pub fn nonce_count(&self) -> u32 {
        self.nonce_count
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    /// Handles a 401/407 challenge, counting it against the retry bound.
    pub fn on_challenge(&mut self, header: &str, credentials: &Credentials) -> SipResult<()> {
        if self.state == AuthState::RetriesExhausted {
            return Err(SipError::AuthenticationFailed("Wrong Password".to_string()));
        }

        self.retries += 1;
        if self.retries > MAX_AUTH_RETRIES {
            warn!(
                "{} rejected credentials {} times, giving up",
                self.name, self.retries
            );
            self.state = AuthState::RetriesExhausted;
            return Err(SipError::AuthenticationFailed("Wrong Password".to_string()));
        }

        self.parse_challenge(header, credentials)
    }

    /// Updates the context from a `WWW-Authenticate`/`Proxy-Authenticate` value.
    pub fn parse_challenge(&mut self, header: &str, credentials: &Credentials) -> SipResult<()> {
        let header = header.trim();
        let (scheme, rest) = header.split_once(' ').unwrap_or((header, ""));

        if scheme.eq_ignore_ascii_case("NTLM") {
            let params = parse_auth_params(rest);
            self.scheme = Some(AuthScheme::Ntlm);
            self.realm = param(&params, "realm").map(str::to_string);
            self.opaque = param(&params, "opaque").map(str::to_string);
            self.target = param(&params, "targetname").map(str::to_string);

            match param(&params, "gssapi-data").filter(|data| !data.is_empty()) {
                Some(data) => {
                    self.ntlm_challenge = Some(ntlm::parse_type2(data)?);
                    self.nonce = Some(data.to_string());
                    self.nonce_count = NTLM_TYPE2_RECEIVED;
                }
                None => {
                    self.ntlm_challenge = None;
                    self.nonce = None;
                    self.nonce_count = 1;
                }
            }
            debug!("{} sent NTLM challenge, realm {:?}", self.name, self.realm);
        } else if scheme.eq_ignore_ascii_case("Digest") {
            let params = parse_auth_params(rest);
            let nonce = param(&params, "nonce").map(str::to_string);

            // a fresh nonce restarts the count, a repeated one keeps counting
            if nonce != self.nonce || self.scheme != Some(AuthScheme::Digest) {
                self.nonce_count = 1;
            }
            self.scheme = Some(AuthScheme::Digest);
            self.nonce = nonce;
            self.realm = param(&params, "realm").map(str::to_string);
            self.opaque = param(&params, "opaque").map(str::to_string);
            self.session_key = self.realm.as_ref().map(|realm| {
                md5_hex(&format!(
                    "{}:{}:{}",
                    credentials.username, realm, credentials.password
                ))
            });
            debug!(
                "{} sent Digest challenge, realm {:?} nonce {:?}",
                self.name, self.realm, self.nonce
            );
        } else {
            return Err(SipError::AuthenticationFailed(format!(
                "Unsupported authentication scheme: {}",
                scheme
            )));
        }

        self.state = AuthState::ChallengeReceived;
        Ok(())
    }

    /// Builds the `Authorization`/`Proxy-Authorization` value for a request.
    pub fn build_auth_header(
        &mut self,
        method: &SipMethod,
        target: &str,
        credentials: &Credentials,
    ) -> SipResult<String> {
        let value = match self.scheme {
            Some(AuthScheme::Digest) => self.digest_header(method, target, credentials)?,
            Some(AuthScheme::Ntlm) => self.ntlm_header(credentials),
            None => {
                return Err(SipError::InvalidState(format!(
                    "no challenge received from {}",
                    self.name
                )))
            }
        };
        self.state = AuthState::ResponseSent;
        Ok(value)
    }

    fn digest_header(
        &mut self,
        method: &SipMethod,
        target: &str,
        credentials: &Credentials,
    ) -> SipResult<String> {
        let (Some(realm), Some(nonce), Some(session_key)) =
            (&self.realm, &self.nonce, &self.session_key)
        else {
            return Err(SipError::AuthenticationFailed(format!(
                "incomplete Digest challenge from {}",
                self.name
            )));
        };

        let ha2 = md5_hex(&format!("{}:{}", method, target));
        let response = md5_hex(&format!("{}:{}:{}", session_key, nonce, ha2));
        let value = format!(
            "Digest username=\"{}\", realm=\"{}\", nonce=\"{}\", uri=\"{}\", nc=\"{:08}\", response=\"{}\"",
            credentials.username, realm, nonce, target, self.nonce_count, response
        );
        self.nonce_count += 1;
        Ok(value)
    }

    fn ntlm_header(&self, credentials: &Credentials) -> String {
        let realm = self.realm.as_deref().unwrap_or_default();
        let target = self.target.as_deref().unwrap_or_default();

        match (&self.ntlm_challenge, self.nonce_count) {
            (Some(challenge), NTLM_TYPE2_RECEIVED) => {
                let type3 = ntlm::gen_type3(
                    &credentials.username,
                    &credentials.password,
                    NTLM_HOSTNAME,
                    &credentials.domain,
                    challenge,
                );
                format!(
                    "NTLM qop=\"auth\", opaque=\"{}\", realm=\"{}\", targetname=\"{}\", gssapi-data=\"{}\"",
                    self.opaque.as_deref().unwrap_or_default(),
                    realm,
                    target,
                    type3
                )
            }
            _ => format!(
                "NTLM qop=\"auth\", realm=\"{}\", targetname=\"{}\", gssapi-data=\"\"",
                realm, target
            ),
        }
    }

    /// A non-challenge final response arrived: the credentials were good.
    pub fn accept(&mut self) {
        self.retries = 0;
        if matches!(
            self.state,
            AuthState::ChallengeReceived | AuthState::ResponseSent
        ) {
            self.state = AuthState::Accepted;
        }
    }

    pub fn reset(&mut self) {
        *self = Self::new(self.name);
    }
}

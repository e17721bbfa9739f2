//! Session controller: login state machine, request construction, response
//! dispatch and the account-level operations.
//!
//! The session owns no sockets or timers of its own. A driver (see
//! [`crate::client`]) feeds it inbound messages and timer ticks and
//! receives [`AccountEvent`]s over a channel.

use crate::auth::{AuthContext, Credentials, MAX_AUTH_RETRIES};
use crate::config::AccountConfig;
use crate::presence::{
    self, RoamingContact, CONTENT_TYPE_ISCOMPOSING, CONTENT_TYPE_PIDF,
    CONTENT_TYPE_ROAMING_CONTACTS, CONTENT_TYPE_XPIDF,
};
use crate::registry::{Dialog, SubscriptionRegistry, DEFAULT_WATCHER_EXPIRES, SUBSCRIBE_EXPIRES};
use crate::security::{InboundValidator, PrivacyPolicy};
use crate::transaction::{Intent, ResponseDisposition, Transaction, TransactionTable};
use crate::transport::{Transport, TransportProtocol};
use crate::utils::{
    build_response_from_request, extract_expires_param, extract_tag, format_host_port,
    format_via_address, generate_branch, generate_call_id, generate_tag, list_contains,
    normalize_sip_uri, parse_uri_from_header, HeaderBuilder,
};
use crate::{Headers, SipError, SipMessage, SipMethod, SipRequest, SipResponse, SipResult};
use bytes::Bytes;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, error, info, warn};

const EPID: &str = "1234567890";
const MAX_FORWARDS: u32 = 10;
const REREGISTER_MARGIN_SECS: u64 = 50;
const REREGISTER_FALLBACK_SECS: u64 = 600;
const PUBLISH_EXPIRES: u32 = 600;
const REPUBLISH_AFTER: Duration = Duration::from_secs(500);
const ROAMING_CONTACTS_EXPIRES: u32 = 300;
/// Unanswered REGISTERs tolerated before the first registration.
pub const MAX_REGISTER_ATTEMPTS: u32 = 3;
const CONTACT_METHODS: &str = "MESSAGE, SUBSCRIBE, NOTIFY";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Resolving,
    Connecting,
    Registering,
    Active,
    /// Final: logged out or failed.
    Closed,
}

/// Notifications delivered to the account layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccountEvent {
    Connected,
    /// Fatal; sent at most once per session.
    ConnectionError { reason: String },
    IncomingMessage { peer: String, text: String },
    Typing { peer: String, typing: bool },
    StatusText { peer: String, status: String },
    RosterImported { contacts: Vec<RoamingContact> },
    /// A request went unanswered. The session carries on.
    OperationTimedOut { method: String, target: String },
    Disconnected,
}

/// The account layer's side of the session: the roster to subscribe to
/// after login and the privacy decision for peers watching us.
pub trait AccountDirectory: Send {
    fn roster(&self) -> Vec<String>;

    fn is_permitted(&self, peer: &str) -> bool;
}

/// Directory backed by the account configuration.
#[derive(Debug, Clone, Default)]
pub struct StaticDirectory {
    roster: Vec<String>,
    privacy: PrivacyPolicy,
}

impl StaticDirectory {
    pub fn new(roster: Vec<String>, privacy: PrivacyPolicy) -> Self {
        Self { roster, privacy }
    }

    pub fn from_config(config: &AccountConfig) -> Self {
        Self::new(config.roster.clone(), PrivacyPolicy::new(&config.deny))
    }
}

impl AccountDirectory for StaticDirectory {
    fn roster(&self) -> Vec<String> {
        self.roster.clone()
    }

    fn is_permitted(&self, peer: &str) -> bool {
        self.privacy.is_permitted(peer)
    }
}

/// When our presence is next published.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishSchedule {
    NotStarted,
    Due(Instant),
    /// A PUBLISH was refused; never retried in this session.
    Disabled,
}

#[derive(Debug, Clone, Copy)]
enum AuthTarget {
    Registrar,
    Proxy,
}

pub struct SipSession {
    config: AccountConfig,
    credentials: Credentials,
    state: SessionState,
    protocol: TransportProtocol,
    transport: Option<Box<dyn Transport>>,
    server_addr: Option<SocketAddr>,
    contact_addr: Option<SocketAddr>,
    events: UnboundedSender<AccountEvent>,
    directory: Box<dyn AccountDirectory>,
    transactions: TransactionTable,
    registry: SubscriptionRegistry,
    registrar: AuthContext,
    proxy: AuthContext,
    validator: InboundValidator,
    cseq: u32,
    register_call_id: String,
    registered: bool,
    register_attempts: u32,
    reregister_at: Option<Instant>,
    publish: PublishSchedule,
    status_note: String,
}

impl SipSession {
    pub fn new(
        config: AccountConfig,
        directory: Box<dyn AccountDirectory>,
        events: UnboundedSender<AccountEvent>,
    ) -> SipResult<Self> {
        config.validate()?;

        Ok(Self {
            credentials: config.credentials(),
            state: SessionState::Disconnected,
            protocol: config.transport,
            transport: None,
            server_addr: None,
            contact_addr: None,
            events,
            directory,
            transactions: TransactionTable::new(config.timers.transaction_timers(config.transport)),
            registry: SubscriptionRegistry::new(),
            registrar: AuthContext::new("registrar"),
            proxy: AuthContext::new("proxy"),
            validator: InboundValidator::default(),
            cseq: 0,
            register_call_id: generate_call_id(config.server()),
            registered: false,
            register_attempts: 0,
            reregister_at: None,
            publish: PublishSchedule::NotStarted,
            status_note: "available".to_string(),
            config,
        })
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn config(&self) -> &AccountConfig {
        &self.config
    }

    pub fn registry(&self) -> &SubscriptionRegistry {
        &self.registry
    }

    pub fn transactions(&self) -> &TransactionTable {
        &self.transactions
    }

    pub fn publish_schedule(&self) -> PublishSchedule {
        self.publish
    }

    pub fn reregister_at(&self) -> Option<Instant> {
        self.reregister_at
    }

    pub fn server_addr(&self) -> Option<SocketAddr> {
        self.server_addr
    }

    pub fn wants_write(&self) -> bool {
        self.transport.as_ref().is_some_and(|t| t.wants_write())
    }

    /// Mutable access for the driver's readiness wait.
    pub fn transport_mut(&mut self) -> Option<&mut (dyn Transport + 'static)> {
        self.transport.as_deref_mut()
    }

    fn expect_state(&self, expected: SessionState, operation: &str) -> SipResult<()> {
        if self.state != expected {
            return Err(SipError::InvalidState(format!(
                "{} while {:?}",
                operation, self.state
            )));
        }
        Ok(())
    }

    pub fn begin_resolving(&mut self) -> SipResult<()> {
        self.expect_state(SessionState::Disconnected, "login")?;
        info!("Logging in as {}", self.config.sip_uri());
        self.state = SessionState::Resolving;
        Ok(())
    }

    pub fn begin_connecting(&mut self, server: SocketAddr) -> SipResult<()> {
        self.expect_state(SessionState::Resolving, "connect")?;
        debug!("Connecting to {} over {}", server, self.protocol);
        self.server_addr = Some(server);
        self.state = SessionState::Connecting;
        Ok(())
    }

    /// Takes ownership of the transport and starts registering.
    /// `contact_addr` is the address peers and the server reach us on.
    pub fn attach_transport(
        &mut self,
        transport: Box<dyn Transport>,
        contact_addr: SocketAddr,
        now: Instant,
    ) -> SipResult<()> {
        self.expect_state(SessionState::Connecting, "attach transport")?;

        self.protocol = transport.protocol();
        self.transactions
            .set_timers(self.config.timers.transaction_timers(self.protocol));
        self.transport = Some(transport);
        self.contact_addr = Some(contact_addr);
        self.state = SessionState::Registering;

        let result = self.send_register(self.config.register_expires, now);
        self.guard(result)
    }

    /// Ends the session after a fatal error. Reported once.
    pub fn fail(&mut self, err: &SipError) {
        if self.state == SessionState::Closed {
            debug!("Ignoring error after close: {}", err);
            return;
        }
        error!("Session failed: {}", err);
        self.emit(AccountEvent::ConnectionError {
            reason: err.to_string(),
        });
        self.teardown();
    }

    /// Unregisters and releases everything. Calling it again does nothing.
    pub fn logout(&mut self) {
        if self.state == SessionState::Closed {
            debug!("Already logged out");
            return;
        }

        if self.transport.is_some()
            && matches!(
                self.state,
                SessionState::Registering | SessionState::Active
            )
        {
            if let Err(e) = self.send_unregister() {
                warn!("Unable to unregister: {}", e);
            }
        }

        info!("Logged out");
        self.teardown();
        self.emit(AccountEvent::Disconnected);
    }

    fn teardown(&mut self) {
        let dropped = self.transactions.clear();
        if dropped > 0 {
            debug!("Discarded {} pending transactions", dropped);
        }
        self.registry.clear();
        self.registrar.reset();
        self.proxy.reset();
        if let Some(mut transport) = self.transport.take() {
            transport.close();
        }
        self.reregister_at = None;
        self.publish = PublishSchedule::NotStarted;
        self.state = SessionState::Closed;
    }

    fn guard<T>(&mut self, result: SipResult<T>) -> SipResult<T> {
        if let Err(e) = &result {
            if e.is_fatal() {
                self.fail(e);
            }
        }
        result
    }

    fn emit(&self, event: AccountEvent) {
        if self.events.send(event).is_err() {
            debug!("Account layer is no longer listening");
        }
    }

    fn require_connection(&self, operation: &str) -> SipResult<()> {
        match self.state {
            SessionState::Registering | SessionState::Active => Ok(()),
            state => Err(SipError::InvalidState(format!(
                "{} while {:?}",
                operation, state
            ))),
        }
    }

    // Account operations

    pub fn send_message(&mut self, peer: &str, text: &str) -> SipResult<()> {
        self.require_connection("send message")?;
        let to = normalize_sip_uri(peer);
        let mut extra = Headers::new();
        extra.push("Content-Type", "text/plain");

        let result = self.send_request(
            SipMethod::Message,
            &to,
            &to,
            extra,
            Bytes::copy_from_slice(text.as_bytes()),
            None,
            Intent::Message { peer: to.clone() },
            Instant::now(),
        );
        self.guard(result).map(|_| ())
    }

    pub fn set_typing(&mut self, peer: &str, typing: bool) -> SipResult<()> {
        self.require_connection("send typing notification")?;
        let to = normalize_sip_uri(peer);
        let body = presence::is_composing_document(typing)?;
        let mut extra = Headers::new();
        extra.push("Content-Type", CONTENT_TYPE_ISCOMPOSING);

        let result = self.send_request(
            SipMethod::Message,
            &to,
            &to,
            extra,
            Bytes::from(body),
            None,
            Intent::Message { peer: to.clone() },
            Instant::now(),
        );
        self.guard(result).map(|_| ())
    }

    /// Changes our status note, tells every watcher and publishes when due.
    pub fn set_status(&mut self, note: &str) -> SipResult<()> {
        self.status_note = note.to_string();
        if self.state != SessionState::Active {
            return Ok(());
        }

        let now = Instant::now();
        let mut result = self.notify_all_watchers(now);
        if result.is_ok() && self.publish_due(now) {
            result = self.send_publish(now);
        }
        self.guard(result)
    }

    pub fn add_buddy(&mut self, name: &str) -> SipResult<()> {
        let name = normalize_sip_uri(name);
        if !self.registry.add_buddy(&name) {
            debug!("{} is already a buddy", name);
            return Ok(());
        }
        if self.state == SessionState::Active {
            let result = self.subscribe_buddy(&name, Instant::now());
            return self.guard(result);
        }
        Ok(())
    }

    pub fn remove_buddy(&mut self, name: &str) {
        if self.registry.remove_buddy(&normalize_sip_uri(name)).is_none() {
            debug!("{} was not a buddy", name);
        }
    }

    // Inbound processing

    /// Parses and dispatches one datagram. Unparseable input is dropped.
    pub fn receive_datagram(&mut self, data: &[u8], now: Instant) {
        match crate::parse_sip_message(data) {
            Ok(message) => self.process_incoming(message, now),
            Err(e) => warn!("Dropping unparseable message: {}", e),
        }
    }

    pub fn process_incoming(&mut self, message: SipMessage, now: Instant) {
        if self.state == SessionState::Closed {
            debug!("Dropping {} received after close", message);
            return;
        }
        if let Err(e) = self.validator.validate_message(&message, now) {
            warn!("Dropping {}: {}", message, e);
            return;
        }
        debug!("Processing {}", message);

        let result = match message {
            SipMessage::Request(request) => self.handle_request(request, now),
            SipMessage::Response(response) => self.handle_response(response, now),
        };
        if let Err(e) = self.guard(result) {
            if !e.is_fatal() {
                warn!("Error while processing message: {}", e);
            }
        }
    }

    /// Drains everything the transport has received, then flushes output.
    pub fn drive_io(&mut self, now: Instant) {
        loop {
            let next = match self.transport.as_mut() {
                Some(transport) => transport.try_recv(),
                None => return,
            };
            match next {
                Ok(Some(message)) => self.process_incoming(message, now),
                Ok(None) => break,
                Err(e) => {
                    self.fail(&e);
                    return;
                }
            }
        }

        if let Some(transport) = self.transport.as_mut() {
            if let Err(e) = transport.flush() {
                self.fail(&e);
            }
        }
    }

    fn handle_request(&mut self, request: SipRequest, now: Instant) -> SipResult<()> {
        match request.method {
            SipMethod::Message => self.on_incoming_message(&request),
            SipMethod::Notify => self.on_incoming_notify(&request),
            SipMethod::Subscribe => self.on_incoming_subscribe(&request, now),
            _ => {
                debug!("Unsupported request {}", request.method);
                self.respond(&request, 501, "Not implemented", None, Headers::new())
            }
        }
    }

    fn respond(
        &mut self,
        request: &SipRequest,
        status_code: u16,
        reason: &str,
        local_tag: Option<&str>,
        extra: Headers,
    ) -> SipResult<()> {
        let mut response = build_response_from_request(request, status_code, reason, local_tag);
        for (name, value) in extra.iter() {
            response.headers.push(name, value);
        }
        self.transmit(&SipMessage::Response(response))
    }

    fn sender(request: &SipRequest) -> SipResult<String> {
        request
            .headers
            .get("From")
            .and_then(parse_uri_from_header)
            .map(str::to_string)
            .ok_or_else(|| {
                SipError::MalformedMessage(crate::SipParseError::MalformedHeader(
                    "From without a URI".to_string(),
                ))
            })
    }

    fn on_incoming_message(&mut self, request: &SipRequest) -> SipResult<()> {
        let peer = Self::sender(request)?;
        let content_type = request
            .headers
            .get("Content-Type")
            .and_then(|value| value.split(';').next())
            .map(|value| value.trim().to_ascii_lowercase());

        match content_type.as_deref() {
            None | Some("text/plain") | Some("text/html") => {
                let text = String::from_utf8_lossy(&request.body).into_owned();
                self.emit(AccountEvent::IncomingMessage { peer, text });
                self.respond(request, 200, "OK", None, Headers::new())
            }
            Some(CONTENT_TYPE_ISCOMPOSING) => {
                let body = String::from_utf8_lossy(&request.body);
                let typing = presence::parse_is_composing(&body)?;
                self.emit(AccountEvent::Typing { peer, typing });
                self.respond(request, 200, "OK", None, Headers::new())
            }
            Some(other) => {
                let err = SipError::UnsupportedContentType(other.to_string());
                warn!("MESSAGE from {}: {}", peer, err);
                self.respond(request, 415, "Unsupported media type", None, Headers::new())
            }
        }
    }

    fn on_incoming_notify(&mut self, request: &SipRequest) -> SipResult<()> {
        let peer = Self::sender(request)?;
        let body = String::from_utf8_lossy(&request.body);
        let info = presence::parse_pidf(&body)?;
        debug!("{} is {}", peer, info.status_text());
        self.emit(AccountEvent::StatusText {
            peer,
            status: info.status_text().to_string(),
        });
        self.respond(request, 200, "OK", None, Headers::new())
    }

    fn on_incoming_subscribe(&mut self, request: &SipRequest, now: Instant) -> SipResult<()> {
        let peer = Self::sender(request)?;
        if !self.directory.is_permitted(&peer) {
            return self.respond(request, 202, "Accepted", None, Headers::new());
        }

        let needs_xpidf = request.headers.get("Accept").is_some_and(|accept| {
            list_contains(accept, CONTENT_TYPE_XPIDF) && !list_contains(accept, CONTENT_TYPE_PIDF)
        });
        let call_id = request.headers.get("Call-ID").unwrap_or_default().to_string();
        let their_tag = request.headers.get("From").and_then(extract_tag);
        let our_tag = request
            .headers
            .get("To")
            .and_then(extract_tag)
            .unwrap_or_else(generate_tag);
        let expires = request
            .headers
            .get("Expires")
            .and_then(|value| value.trim().parse::<u32>().ok())
            .unwrap_or(DEFAULT_WATCHER_EXPIRES);

        let local_tag = self
            .registry
            .create_watcher(
                &peer,
                &call_id,
                &our_tag,
                their_tag.as_deref(),
                needs_xpidf,
                now + Duration::from_secs(u64::from(expires)),
            )
            .dialog
            .local_tag
            .clone();

        let mut extra = Headers::new();
        extra.push("Contact", self.contact_header()?);
        extra.push("Expires", expires.to_string());
        self.respond(request, 200, "OK", Some(&local_tag), extra)?;

        if expires == 0 {
            debug!("{} stopped watching", peer);
            let result = self.send_notify(&peer, true, now);
            self.registry.remove_watcher(&peer);
            return result;
        }
        self.send_notify(&peer, false, now)
    }

    fn handle_response(&mut self, response: SipResponse, now: Instant) -> SipResult<()> {
        match self.transactions.classify(&response) {
            ResponseDisposition::Unmatched => {
                debug!(
                    "Response {} {} matches no transaction",
                    response.status_code, response.reason_phrase
                );
                Ok(())
            }
            ResponseDisposition::Provisional => Ok(()),
            ResponseDisposition::Challenged { cseq } => {
                self.handle_challenge(cseq, &response, now)
            }
            ResponseDisposition::Completed(transaction) => {
                if (200..300).contains(&response.status_code) {
                    let headers = &transaction.request.headers;
                    if headers.contains("Authorization") {
                        self.registrar.accept();
                    }
                    if headers.contains("Proxy-Authorization") {
                        self.proxy.accept();
                    }
                }
                self.complete(transaction, &response, now)
            }
        }
    }

    fn handle_challenge(&mut self, cseq: u32, response: &SipResponse, now: Instant) -> SipResult<()> {
        let Some(transaction) = self.transactions.find_by_cseq(cseq) else {
            return Ok(());
        };
        let is_register = *transaction.method() == SipMethod::Register;
        let auth_attempts = transaction.auth_attempts;
        let register_expires = match transaction.intent {
            Intent::Register { expires } => expires,
            _ => self.config.register_expires,
        };

        let (target, challenge_header) = match response.status_code {
            407 => (AuthTarget::Proxy, "Proxy-Authenticate"),
            _ => (AuthTarget::Registrar, "WWW-Authenticate"),
        };
        let challenge = response.headers.get(challenge_header).ok_or_else(|| {
            SipError::AuthenticationFailed(format!(
                "{} without {}",
                response.status_code, challenge_header
            ))
        })?;

        let credentials = &self.credentials;
        let context = match target {
            AuthTarget::Registrar => &mut self.registrar,
            AuthTarget::Proxy => &mut self.proxy,
        };

        if is_register {
            context.on_challenge(challenge, credentials)?;
            if response.status_code == 401 {
                debug!("Registrar challenged REGISTER, registering again");
                self.transactions.remove(cseq);
                return self.send_register(register_expires, now);
            }
            return self.resend_authenticated(cseq, target, now);
        }

        // a rejected request is dropped, the session stays up
        if auth_attempts >= MAX_AUTH_RETRIES {
            warn!(
                "Credentials rejected {} times for CSeq {}, dropping the request",
                auth_attempts, cseq
            );
            self.transactions.remove(cseq);
            return Ok(());
        }
        context.parse_challenge(challenge, credentials)?;
        self.resend_authenticated(cseq, target, now)
    }

    /// Resends a challenged request with credentials, keeping its CSeq.
    fn resend_authenticated(&mut self, cseq: u32, target: AuthTarget, now: Instant) -> SipResult<()> {
        let Some(transaction) = self.transactions.find_by_cseq_mut(cseq) else {
            return Ok(());
        };

        let (context, header_name) = match target {
            AuthTarget::Registrar => (&mut self.registrar, "Authorization"),
            AuthTarget::Proxy => (&mut self.proxy, "Proxy-Authorization"),
        };
        let value = context.build_auth_header(
            &transaction.request.method,
            &transaction.request.uri,
            &self.credentials,
        )?;
        transaction.request.headers.set(header_name, value);
        transaction.auth_attempts += 1;
        transaction.restart(now);

        let message = SipMessage::Request(transaction.request.clone());
        debug!("Resending {} (CSeq {}) with {}", message, cseq, header_name);
        self.transmit(&message)
    }

    fn complete(&mut self, transaction: Transaction, response: &SipResponse, now: Instant) -> SipResult<()> {
        let success = (200..300).contains(&response.status_code);
        match transaction.intent {
            Intent::Register { expires } => self.on_register_response(expires, response, now),
            Intent::Subscribe { buddy } => {
                if !success {
                    debug!(
                        "Subscription to {} refused with {}",
                        buddy, response.status_code
                    );
                    self.emit(AccountEvent::StatusText {
                        peer: buddy,
                        status: "offline".to_string(),
                    });
                }
                Ok(())
            }
            Intent::RoamingContacts => {
                if success {
                    self.import_roaming_contacts(response)
                } else {
                    Ok(())
                }
            }
            Intent::Publish => {
                if response.status_code != 200 && response.status_code != 408 {
                    warn!(
                        "PUBLISH refused with {}, not publishing again",
                        response.status_code
                    );
                    self.publish = PublishSchedule::Disabled;
                }
                Ok(())
            }
            Intent::Message { peer } => {
                if !success {
                    warn!(
                        "Message to {} failed: {} {}",
                        peer, response.status_code, response.reason_phrase
                    );
                }
                Ok(())
            }
            Intent::Notify { watcher } => {
                if !success {
                    debug!("NOTIFY to {} answered {}", watcher, response.status_code);
                }
                Ok(())
            }
        }
    }

    fn on_register_response(&mut self, expires: u32, response: &SipResponse, now: Instant) -> SipResult<()> {
        if expires == 0 {
            debug!("Unregistered with {}", response.status_code);
            return Ok(());
        }

        if response.status_code != 200 {
            if self.registered {
                warn!(
                    "Re-registration refused: {} {}",
                    response.status_code, response.reason_phrase
                );
                return Ok(());
            }
            return Err(SipError::ConnectionError(format!(
                "Registration failed: {} {}",
                response.status_code, response.reason_phrase
            )));
        }

        let granted = response
            .headers
            .get("Expires")
            .and_then(|value| value.trim().parse::<u32>().ok())
            .or_else(|| response.headers.get("Contact").and_then(extract_expires_param))
            .unwrap_or(expires);
        self.reregister_at = Some(now + reregister_delay(granted));
        self.register_attempts = 0;

        if self.registered {
            debug!("Registration refreshed for {}s", granted);
            return Ok(());
        }
        self.registered = true;
        info!("Registered as {} for {}s", self.config.sip_uri(), granted);

        if self.publish_due(now) {
            self.send_publish(now)?;
        }

        self.state = SessionState::Active;
        self.emit(AccountEvent::Connected);

        for name in self.directory.roster() {
            let name = normalize_sip_uri(&name);
            self.registry.add_buddy(&name);
        }
        let mut buddies: Vec<String> = self.registry.buddies().map(|b| b.name.clone()).collect();
        buddies.sort();
        for buddy in buddies {
            self.subscribe_buddy(&buddy, now)?;
        }

        if response
            .headers
            .get_all("Allow-Events")
            .any(|events| events.contains("vnd-microsoft-provisioning"))
        {
            self.subscribe_roaming_contacts(now)?;
        }
        Ok(())
    }

    fn import_roaming_contacts(&mut self, response: &SipResponse) -> SipResult<()> {
        if response.body.is_empty() {
            return Ok(());
        }
        let body = String::from_utf8_lossy(&response.body);
        let contacts: Vec<RoamingContact> = presence::parse_roaming_contacts(&body)?
            .into_iter()
            .map(|contact| RoamingContact {
                uri: normalize_sip_uri(&contact.uri),
                ..contact
            })
            .collect();

        for contact in &contacts {
            if self.registry.add_buddy(&contact.uri) {
                debug!("Imported buddy {}", contact.uri);
            }
        }
        info!("Imported {} contacts from the server", contacts.len());
        self.emit(AccountEvent::RosterImported { contacts });
        Ok(())
    }

    // Timers

    /// Retransmission sweep.
    pub fn on_resend_timer(&mut self, now: Instant) {
        if self.transport.is_none() {
            return;
        }
        self.validator.cleanup(now);

        let outcome = self.transactions.sweep(now);
        let mut fatal = None;
        for request in outcome.resend {
            if let Err(e) = self.transmit(&SipMessage::Request(request)) {
                if e.is_fatal() {
                    fatal = Some(e);
                    break;
                }
                warn!("Resend failed: {}", e);
            }
        }

        for transaction in outcome.timed_out {
            let initial_register = matches!(transaction.intent, Intent::Register { expires } if expires > 0)
                && !self.registered;
            self.emit(AccountEvent::OperationTimedOut {
                method: transaction.request.method.to_string(),
                target: transaction.request.uri,
            });
            if initial_register && fatal.is_none() {
                self.register_attempts += 1;
                if self.register_attempts >= MAX_REGISTER_ATTEMPTS {
                    fatal = Some(SipError::ConnectionError(format!(
                        "No answer to REGISTER after {} attempts",
                        self.register_attempts
                    )));
                } else {
                    // retry on the next subscribe sweep
                    self.reregister_at = Some(now);
                }
            }
        }

        if let Some(e) = fatal {
            self.fail(&e);
        }
    }

    /// Re-registration, republication and subscription refresh.
    pub fn on_subscribe_timer(&mut self, now: Instant) {
        let result = self.subscribe_sweep(now);
        if let Err(e) = self.guard(result) {
            if !e.is_fatal() {
                warn!("Subscribe sweep: {}", e);
            }
        }
    }

    fn subscribe_sweep(&mut self, now: Instant) -> SipResult<()> {
        if !matches!(
            self.state,
            SessionState::Registering | SessionState::Active
        ) {
            return Ok(());
        }

        if self.reregister_at.is_some_and(|at| at <= now) {
            self.send_register(self.config.register_expires, now)?;
        }

        if self.state != SessionState::Active {
            return Ok(());
        }

        if matches!(self.publish, PublishSchedule::Due(_)) && self.publish_due(now) {
            self.send_publish(now)?;
        }

        let plan = self.registry.resubscribe_sweep(now);
        for buddy in plan.resubscribe {
            self.subscribe_buddy(&buddy, now)?;
        }
        Ok(())
    }

    pub fn on_keepalive(&mut self) {
        if let Some(transport) = self.transport.as_mut() {
            if let Err(e) = transport.keepalive() {
                warn!("Keepalive failed: {}", e);
            }
        }
    }

    // Outbound requests

    fn transmit(&mut self, message: &SipMessage) -> SipResult<()> {
        let transport = self
            .transport
            .as_mut()
            .ok_or_else(|| SipError::InvalidState("no transport attached".to_string()))?;
        debug!("Sending {}", message);
        transport.send(&message.to_bytes())
    }

    fn contact_header(&self) -> SipResult<String> {
        let addr = self
            .contact_addr
            .ok_or_else(|| SipError::InvalidState("no transport attached".to_string()))?;
        Ok(format!(
            "<sip:{}@{};transport={}>;methods=\"{}\"",
            self.config.user(),
            format_host_port(&addr),
            self.protocol.uri_param(),
            CONTACT_METHODS
        ))
    }

    fn auth_header_for(&mut self, method: &SipMethod, uri: &str) -> SipResult<Option<(&'static str, String)>> {
        if *method == SipMethod::Register {
            if self.registrar.is_active() {
                let value = self
                    .registrar
                    .build_auth_header(method, uri, &self.credentials)?;
                return Ok(Some(("Authorization", value)));
            }
        } else if self.proxy.is_active() {
            let value = self.proxy.build_auth_header(method, uri, &self.credentials)?;
            return Ok(Some(("Proxy-Authorization", value)));
        }
        Ok(None)
    }

    fn build_request(
        &mut self,
        method: SipMethod,
        uri: &str,
        to: &str,
        extra: Headers,
        body: Bytes,
        dialog: Option<Dialog>,
    ) -> SipResult<SipRequest> {
        let contact_addr = self
            .contact_addr
            .ok_or_else(|| SipError::InvalidState("no transport attached".to_string()))?;

        self.cseq += 1;
        let via = format_via_address(&contact_addr, self.protocol.via_token(), &generate_branch());
        let (from_tag, to_tag, call_id) = match dialog {
            Some(dialog) => (dialog.local_tag, dialog.remote_tag, dialog.call_id),
            None if method == SipMethod::Register => {
                (generate_tag(), None, self.register_call_id.clone())
            }
            None => (generate_tag(), None, generate_call_id(self.config.server())),
        };

        let mut builder = HeaderBuilder::new()
            .via(&via)
            .from(&self.config.sip_uri(), &from_tag, Some(EPID))
            .to(to, to_tag.as_deref())
            .max_forwards(MAX_FORWARDS)
            .cseq(self.cseq, &method)
            .user_agent(&self.config.user_agent)
            .call_id(&call_id);
        if let Some((name, value)) = self.auth_header_for(&method, uri)? {
            builder = builder.header(name, &value);
        }

        let mut request = SipRequest::new(method, uri);
        request.headers = builder.headers(&extra).build();
        request.body = body;
        Ok(request)
    }

    #[allow(clippy::too_many_arguments)]
    fn send_request(
        &mut self,
        method: SipMethod,
        uri: &str,
        to: &str,
        extra: Headers,
        body: Bytes,
        dialog: Option<Dialog>,
        intent: Intent,
        now: Instant,
    ) -> SipResult<u32> {
        let request = self.build_request(method, uri, to, extra, body, dialog)?;
        self.transmit(&SipMessage::Request(request.clone()))?;
        self.transactions.register(request, intent, now)
    }

    fn register_headers(&self, expires: u32) -> SipResult<Headers> {
        let mut extra = Headers::new();
        extra.push("Contact", self.contact_header()?);
        extra.push("Expires", expires.to_string());
        Ok(extra)
    }

    fn send_register(&mut self, expires: u32, now: Instant) -> SipResult<()> {
        let uri = format!("sip:{}", self.config.server());
        let to = self.config.sip_uri();
        let extra = self.register_headers(expires)?;

        self.reregister_at = Some(now + reregister_delay(expires));
        self.send_request(
            SipMethod::Register,
            &uri,
            &to,
            extra,
            Bytes::new(),
            None,
            Intent::Register { expires },
            now,
        )?;
        Ok(())
    }

    fn send_unregister(&mut self) -> SipResult<()> {
        let uri = format!("sip:{}", self.config.server());
        let to = self.config.sip_uri();
        let extra = self.register_headers(0)?;
        let request = self.build_request(SipMethod::Register, &uri, &to, extra, Bytes::new(), None)?;
        self.transmit(&SipMessage::Request(request))?;
        if let Some(transport) = self.transport.as_mut() {
            transport.flush()?;
        }
        Ok(())
    }

    fn subscribe_buddy(&mut self, buddy: &str, now: Instant) -> SipResult<()> {
        let mut extra = Headers::new();
        extra.push("Expires", SUBSCRIBE_EXPIRES.to_string());
        extra.push(
            "Accept",
            format!("{}, {}", CONTENT_TYPE_PIDF, CONTENT_TYPE_XPIDF),
        );
        extra.push("Event", "presence");
        extra.push("Contact", self.contact_header()?);

        self.send_request(
            SipMethod::Subscribe,
            buddy,
            buddy,
            extra,
            Bytes::new(),
            None,
            Intent::Subscribe {
                buddy: buddy.to_string(),
            },
            now,
        )?;
        self.registry.schedule_resubscribe(buddy, now);
        Ok(())
    }

    fn subscribe_roaming_contacts(&mut self, now: Instant) -> SipResult<()> {
        let to = self.config.sip_uri();
        let mut extra = Headers::new();
        extra.push("Expires", ROAMING_CONTACTS_EXPIRES.to_string());
        extra.push("Accept", CONTENT_TYPE_ROAMING_CONTACTS);
        extra.push("Supported", "com.microsoft.autoextend");
        extra.push("Event", "vnd-microsoft-roaming-contacts");
        extra.push("Contact", self.contact_header()?);

        debug!("Server offers roaming contacts, subscribing");
        self.send_request(
            SipMethod::Subscribe,
            &to,
            &to,
            extra,
            Bytes::new(),
            None,
            Intent::RoamingContacts,
            now,
        )?;
        Ok(())
    }

    fn publish_due(&self, now: Instant) -> bool {
        self.config.publish
            && match self.publish {
                PublishSchedule::NotStarted => true,
                PublishSchedule::Due(at) => at <= now,
                PublishSchedule::Disabled => false,
            }
    }

    fn send_publish(&mut self, now: Instant) -> SipResult<()> {
        let uri = self.config.sip_uri();
        let body = presence::pidf_document(&uri, &self.status_note)?;
        let mut extra = Headers::new();
        extra.push("Expires", PUBLISH_EXPIRES.to_string());
        extra.push("Event", "presence");
        extra.push("Content-Type", CONTENT_TYPE_PIDF);

        self.send_request(
            SipMethod::Publish,
            &uri,
            &uri,
            extra,
            Bytes::from(body),
            None,
            Intent::Publish,
            now,
        )?;
        self.publish = PublishSchedule::Due(now + REPUBLISH_AFTER);
        Ok(())
    }

    fn send_notify(&mut self, name: &str, terminated: bool, now: Instant) -> SipResult<()> {
        let Some(watcher) = self.registry.watcher(name) else {
            return Ok(());
        };
        let dialog = watcher.dialog.clone();
        let needs_xpidf = watcher.needs_xpidf;
        let remaining = watcher.expires_at.saturating_duration_since(now).as_secs();

        let entity = self.config.sip_uri();
        let (content_type, body) = if needs_xpidf {
            (
                CONTENT_TYPE_XPIDF,
                presence::xpidf_document(&entity, &self.status_note)?,
            )
        } else {
            (
                CONTENT_TYPE_PIDF,
                presence::pidf_document(&entity, &self.status_note)?,
            )
        };

        let mut extra = Headers::new();
        extra.push("Event", "presence");
        extra.push(
            "Subscription-State",
            if terminated {
                "terminated".to_string()
            } else {
                format!("active;expires={}", remaining)
            },
        );
        extra.push("Content-Type", content_type);
        extra.push("Contact", self.contact_header()?);

        self.send_request(
            SipMethod::Notify,
            name,
            name,
            extra,
            Bytes::from(body),
            Some(dialog),
            Intent::Notify {
                watcher: name.to_string(),
            },
            now,
        )?;
        Ok(())
    }

    fn notify_all_watchers(&mut self, now: Instant) -> SipResult<()> {
        let mut names: Vec<String> = self.registry.watchers().map(|w| w.name.clone()).collect();
        names.sort();
        for name in names {
            self.send_notify(&name, false, now)?;
        }
        Ok(())
    }
}

/// Re-register this long after a grant of `expires` seconds.
fn reregister_delay(expires: u32) -> Duration {
    if expires == 0 {
        return Duration::from_secs(REREGISTER_FALLBACK_SECS);
    }
    Duration::from_secs(
        u64::from(expires)
            .saturating_sub(REREGISTER_MARGIN_SECS)
            .max(1),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory::{MemoryTransport, Wire};
    use crate::utils::user_part;
    use tokio::sync::mpsc::{self, UnboundedReceiver};

    const CONTACT: &str = "10.0.0.2:5062";

    struct Harness {
        session: SipSession,
        wire: Wire,
        events: UnboundedReceiver<AccountEvent>,
    }

    impl Harness {
        fn new(config: AccountConfig) -> Self {
            let (tx, events) = mpsc::unbounded_channel();
            let directory = StaticDirectory::from_config(&config);
            let mut session = SipSession::new(config, Box::new(directory), tx).unwrap();
            session.begin_resolving().unwrap();
            session
                .begin_connecting("10.0.0.1:5060".parse().unwrap())
                .unwrap();
            let (transport, wire) = MemoryTransport::new(TransportProtocol::Udp);
            session
                .attach_transport(Box::new(transport), CONTACT.parse().unwrap(), Instant::now())
                .unwrap();
            Self {
                session,
                wire,
                events,
            }
        }

        fn registering() -> Self {
            Self::new(config())
        }

        /// Registered session with the setup traffic drained.
        fn active(config: AccountConfig) -> Self {
            let mut harness = Self::new(config);
            let register = harness.last_sent(SipMethod::Register);
            harness.feed(reply(&register, 200, "OK"));
            assert_eq!(harness.session.state(), SessionState::Active);
            if let Some(publish) = harness.sent_requests(SipMethod::Publish).pop() {
                harness.feed(reply(&publish, 200, "OK"));
            }
            assert!(harness.session.transactions().is_empty());
            harness.wire.take_sent();
            harness.drain_events();
            harness
        }

        fn feed(&mut self, message: impl Into<Bytes>) {
            let data: Bytes = message.into();
            self.session.receive_datagram(&data, Instant::now());
        }

        fn feed_response(&mut self, response: SipResponse) {
            self.feed(SipMessage::Response(response).to_bytes());
        }

        fn sent_requests(&self, method: SipMethod) -> Vec<SipRequest> {
            self.wire
                .sent_messages()
                .into_iter()
                .filter_map(|message| match message {
                    SipMessage::Request(request) if request.method == method => Some(request),
                    _ => None,
                })
                .collect()
        }

        fn sent_responses(&self) -> Vec<SipResponse> {
            self.wire
                .sent_messages()
                .into_iter()
                .filter_map(|message| match message {
                    SipMessage::Response(response) => Some(response),
                    _ => None,
                })
                .collect()
        }

        fn last_sent(&self, method: SipMethod) -> SipRequest {
            self.sent_requests(method).pop().unwrap()
        }

        fn drain_events(&mut self) -> Vec<AccountEvent> {
            let mut events = Vec::new();
            while let Ok(event) = self.events.try_recv() {
                events.push(event);
            }
            events
        }
    }

    fn config() -> AccountConfig {
        let mut config = AccountConfig::new("bob@x", "secret");
        config.transport = TransportProtocol::Udp;
        config
    }

    fn reply(request: &SipRequest, status: u16, reason: &str) -> Bytes {
        SipMessage::Response(build_response_from_request(request, status, reason, Some("srv")))
            .to_bytes()
    }

    fn challenge(request: &SipRequest, status: u16, header: &str, value: &str) -> SipResponse {
        let mut response = build_response_from_request(request, status, "Unauthorized", Some("srv"));
        response.headers.push(header, value);
        response
    }

    fn incoming(method: &str, from: &str, call_id: &str, extra: &str, body: &str) -> Bytes {
        Bytes::from(format!(
            "{method} sip:bob@x SIP/2.0\r\nVia: SIP/2.0/UDP 10.0.0.9:5060;branch=z9hG4bKpeer\r\nFrom: <{from}>;tag=peer-{call_id}\r\nTo: <sip:bob@x>\r\nCall-ID: {call_id}\r\nCSeq: 1 {method}\r\n{extra}Content-Length: {}\r\n\r\n{body}",
            body.len()
        ))
    }

    fn watch(harness: &mut Harness, peer: &str, accept: &str) {
        let extra = format!("Event: presence\r\nAccept: {}\r\nExpires: 600\r\n", accept);
        harness.feed(incoming("SUBSCRIBE", peer, &format!("sub-{}", peer), &extra, ""));
    }

    #[test]
    fn test_incoming_instant_message() {
        let mut harness = Harness::active(config());
        harness.feed(Bytes::from_static(
            b"MESSAGE sip:bob@x SIP/2.0\r\nFrom: <sip:alice@x>;tag=1\r\nTo: <sip:bob@x>\r\nCSeq: 1 MESSAGE\r\nCall-ID: abc\r\nContent-Type: text/plain\r\nContent-Length: 5\r\n\r\nhello",
        ));

        let events = harness.drain_events();
        assert_eq!(
            events,
            vec![AccountEvent::IncomingMessage {
                peer: "sip:alice@x".to_string(),
                text: "hello".to_string()
            }]
        );
        if let AccountEvent::IncomingMessage { peer, .. } = &events[0] {
            assert_eq!(user_part(peer), "alice");
        }

        let responses = harness.sent_responses();
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].status_code, 200);
        assert_eq!(responses[0].headers.get("CSeq"), Some("1 MESSAGE"));
        assert_eq!(responses[0].headers.get("Call-ID"), Some("abc"));
    }

    #[test]
    fn test_register_request_shape() {
        let harness = Harness::registering();
        assert_eq!(harness.session.state(), SessionState::Registering);

        let register = harness.last_sent(SipMethod::Register);
        assert_eq!(register.uri, "sip:x");
        let names: Vec<&str> = register.headers.iter().map(|(name, _)| name).collect();
        assert_eq!(
            names,
            vec![
                "Via",
                "From",
                "To",
                "Max-Forwards",
                "CSeq",
                "User-Agent",
                "Call-ID",
                "Contact",
                "Expires",
                "Content-Length"
            ]
        );
        assert!(register
            .headers
            .get("Via")
            .unwrap()
            .starts_with("SIP/2.0/UDP 10.0.0.2:5062;branch=z9hG4bK"));
        let from = register.headers.get("From").unwrap();
        assert!(from.starts_with("<sip:bob@x>;tag="));
        assert!(from.ends_with(";epid=1234567890"));
        assert_eq!(register.headers.get("Max-Forwards"), Some("10"));
        assert_eq!(
            register.headers.get("Contact"),
            Some("<sip:bob@10.0.0.2:5062;transport=udp>;methods=\"MESSAGE, SUBSCRIBE, NOTIFY\"")
        );
        assert_eq!(register.headers.get("Expires"), Some("900"));
    }

    #[test]
    fn test_register_digest_challenge() {
        let mut harness = Harness::registering();
        let first = harness.last_sent(SipMethod::Register);
        harness.wire.take_sent();

        harness.feed_response(challenge(
            &first,
            401,
            "WWW-Authenticate",
            r#"Digest realm="x", nonce="n1""#,
        ));
        let resent = harness.wire.take_sent();
        assert_eq!(resent.len(), 1);
        let SipMessage::Request(second) = &resent[0] else {
            panic!("expected a request");
        };
        assert_eq!(second.method, SipMethod::Register);
        let auth = second.headers.get("Authorization").unwrap();
        assert!(auth.starts_with("Digest "));
        assert!(auth.contains("nonce=\"n1\""));
        assert!(auth.contains("nc=\"00000001\""));
        assert_eq!(second.headers.get("Call-ID"), first.headers.get("Call-ID"));
        assert_ne!(second.headers.get("CSeq"), first.headers.get("CSeq"));

        harness.feed_response(challenge(
            second,
            401,
            "WWW-Authenticate",
            r#"Digest realm="x", nonce="n1""#,
        ));
        let resent = harness.wire.take_sent();
        assert_eq!(resent.len(), 1);
        let auth = resent[0].header("Authorization").unwrap();
        assert!(auth.contains("nc=\"00000002\""));
    }

    #[test]
    fn test_register_retry_bound_fails_session() {
        let mut harness = Harness::registering();
        for _ in 0..=MAX_AUTH_RETRIES {
            let register = harness.last_sent(SipMethod::Register);
            harness.feed_response(challenge(
                &register,
                401,
                "WWW-Authenticate",
                r#"Digest realm="x", nonce="n1""#,
            ));
        }

        assert_eq!(harness.session.state(), SessionState::Closed);
        let events = harness.drain_events();
        let errors: Vec<&AccountEvent> = events
            .iter()
            .filter(|event| matches!(event, AccountEvent::ConnectionError { .. }))
            .collect();
        assert_eq!(errors.len(), 1);
        if let AccountEvent::ConnectionError { reason } = errors[0] {
            assert!(reason.contains("Wrong Password"));
        }
        assert!(*harness.wire.closed.lock());
        assert!(harness.session.transactions().is_empty());
    }

    #[test]
    fn test_first_registration_activates_session() {
        let mut config = config();
        config.roster = vec!["carol@x".to_string()];
        let mut harness = Harness::new(config);
        let register = harness.last_sent(SipMethod::Register);
        let mut ok = build_response_from_request(&register, 200, "OK", Some("srv"));
        ok.headers.push("Expires", "300");
        let before = Instant::now();
        harness.feed_response(ok);

        assert_eq!(harness.session.state(), SessionState::Active);
        assert_eq!(harness.drain_events(), vec![AccountEvent::Connected]);

        let publish = harness.last_sent(SipMethod::Publish);
        assert_eq!(publish.headers.get("Expires"), Some("600"));
        assert_eq!(publish.headers.get("Content-Type"), Some(CONTENT_TYPE_PIDF));
        assert!(matches!(
            harness.session.publish_schedule(),
            PublishSchedule::Due(_)
        ));

        let subscribe = harness.last_sent(SipMethod::Subscribe);
        assert_eq!(subscribe.uri, "sip:carol@x");
        assert_eq!(subscribe.headers.get("Expires"), Some("1200"));
        assert_eq!(subscribe.headers.get("Event"), Some("presence"));
        assert_eq!(
            subscribe.headers.get("Accept"),
            Some("application/pidf+xml, application/xpidf+xml")
        );
        assert!(harness.session.registry().buddy("sip:carol@x").is_some());

        let deadline = harness.session.reregister_at().unwrap();
        assert!(deadline >= before + Duration::from_secs(250));
        assert!(deadline <= Instant::now() + Duration::from_secs(250));
    }

    #[test]
    fn test_reregistration_on_subscribe_sweep() {
        let mut harness = Harness::active(config());
        let deadline = harness.session.reregister_at().unwrap();

        harness.session.on_subscribe_timer(deadline - Duration::from_secs(1));
        assert!(harness.sent_requests(SipMethod::Register).is_empty());

        harness.session.on_subscribe_timer(deadline);
        let register = harness.last_sent(SipMethod::Register);
        assert_eq!(register.headers.get("Expires"), Some("900"));
    }

    #[test]
    fn test_roaming_contacts_import() {
        let mut harness = Harness::new(config());
        let register = harness.last_sent(SipMethod::Register);
        let mut ok = build_response_from_request(&register, 200, "OK", Some("srv"));
        ok.headers
            .push("Allow-Events", "presence, vnd-microsoft-provisioning");
        harness.feed_response(ok);

        let subscribe = harness.last_sent(SipMethod::Subscribe);
        assert_eq!(
            subscribe.headers.get("Event"),
            Some("vnd-microsoft-roaming-contacts")
        );
        assert_eq!(subscribe.uri, "sip:bob@x");

        let mut contacts = build_response_from_request(&subscribe, 200, "OK", Some("srv"));
        contacts
            .headers
            .push("Content-Type", CONTENT_TYPE_ROAMING_CONTACTS);
        contacts.body = Bytes::from_static(
            br#"<contactList><group id="1" name="~"/><contact uri="dave@x" name="Dave" groups="1"/></contactList>"#,
        );
        harness.drain_events();
        harness.feed_response(contacts);

        let events = harness.drain_events();
        assert_eq!(events.len(), 1);
        let AccountEvent::RosterImported { contacts } = &events[0] else {
            panic!("expected a roster import");
        };
        assert_eq!(contacts[0].uri, "sip:dave@x");
        assert_eq!(contacts[0].groups, vec!["~".to_string()]);
        assert!(harness.session.registry().buddy("sip:dave@x").is_some());

        // imported buddies are subscribed by the next sweep
        harness.wire.take_sent();
        harness.session.on_subscribe_timer(Instant::now());
        let subscribe = harness.last_sent(SipMethod::Subscribe);
        assert_eq!(subscribe.uri, "sip:dave@x");
    }

    #[test]
    fn test_status_change_notifies_every_watcher() {
        let mut harness = Harness::active(config());
        watch(&mut harness, "sip:alice@x", "application/pidf+xml");
        watch(&mut harness, "sip:carol@x", "application/pidf+xml");
        assert_eq!(harness.session.registry().watcher_count(), 2);
        harness.wire.take_sent();

        harness.session.set_status("busy").unwrap();
        let notifies = harness.sent_requests(SipMethod::Notify);
        assert_eq!(notifies.len(), 2);

        for notify in &notifies {
            let watcher = harness.session.registry().watcher(&notify.uri).unwrap();
            assert_eq!(notify.headers.get("Call-ID"), Some(watcher.dialog.call_id.as_str()));
            let to = notify.headers.get("To").unwrap();
            assert_eq!(
                extract_tag(to).as_deref(),
                watcher.dialog.remote_tag.as_deref()
            );
            let from = notify.headers.get("From").unwrap();
            assert_eq!(extract_tag(from), Some(watcher.dialog.local_tag.clone()));
            assert_eq!(notify.headers.get("Content-Type"), Some(CONTENT_TYPE_PIDF));

            let body = String::from_utf8_lossy(&notify.body);
            assert!(body.contains("<basic>open</basic>"));
            assert!(body.contains("<note>busy</note>"));
        }
        let mut targets: Vec<&str> = notifies.iter().map(|n| n.uri.as_str()).collect();
        targets.sort();
        assert_eq!(targets, vec!["sip:alice@x", "sip:carol@x"]);
    }

    #[test]
    fn test_incoming_subscribe_creates_watcher() {
        let mut harness = Harness::active(config());
        watch(&mut harness, "sip:alice@x", "application/pidf+xml");

        let responses = harness.sent_responses();
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].status_code, 200);
        let watcher = harness.session.registry().watcher("sip:alice@x").unwrap();
        assert_eq!(
            extract_tag(responses[0].headers.get("To").unwrap()),
            Some(watcher.dialog.local_tag.clone())
        );
        assert!(responses[0].headers.get("Contact").is_some());
        assert!(!watcher.needs_xpidf);

        let notify = harness.last_sent(SipMethod::Notify);
        assert_eq!(
            notify.headers.get("Subscription-State"),
            Some("active;expires=600")
        );

        // a refresh in the same dialog does not add a second watcher
        watch(&mut harness, "sip:alice@x", "application/pidf+xml");
        assert_eq!(harness.session.registry().watcher_count(), 1);
    }

    #[test]
    fn test_legacy_watcher_gets_xpidf() {
        let mut harness = Harness::active(config());
        watch(&mut harness, "sip:legacy@x", "application/xpidf+xml");

        assert!(harness.session.registry().watcher("sip:legacy@x").unwrap().needs_xpidf);
        let notify = harness.last_sent(SipMethod::Notify);
        assert_eq!(notify.headers.get("Content-Type"), Some(CONTENT_TYPE_XPIDF));
        assert!(String::from_utf8_lossy(&notify.body).contains("<presentity"));
    }

    #[test]
    fn test_unsubscribe_sends_final_notify() {
        let mut harness = Harness::active(config());
        watch(&mut harness, "sip:alice@x", "application/pidf+xml");
        harness.wire.take_sent();

        harness.feed(incoming(
            "SUBSCRIBE",
            "sip:alice@x",
            "sub-sip:alice@x",
            "Event: presence\r\nExpires: 0\r\n",
            "",
        ));
        let notify = harness.last_sent(SipMethod::Notify);
        assert_eq!(notify.headers.get("Subscription-State"), Some("terminated"));
        assert_eq!(harness.session.registry().watcher_count(), 0);
    }

    #[test]
    fn test_privacy_refusal() {
        let mut config = config();
        config.deny = vec!["mallory@x".to_string()];
        let mut harness = Harness::active(config);
        watch(&mut harness, "sip:mallory@x", "application/pidf+xml");

        let responses = harness.sent_responses();
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].status_code, 202);
        assert_eq!(harness.session.registry().watcher_count(), 0);
        assert!(harness.sent_requests(SipMethod::Notify).is_empty());
    }

    #[test]
    fn test_unsupported_content_type() {
        let mut harness = Harness::active(config());
        harness.feed(incoming(
            "MESSAGE",
            "sip:alice@x",
            "m1",
            "Content-Type: application/octet-stream\r\n",
            "xx",
        ));

        let responses = harness.sent_responses();
        assert_eq!(responses[0].status_code, 415);
        assert_eq!(responses[0].reason_phrase, "Unsupported media type");
        assert!(harness.drain_events().is_empty());
        assert_eq!(harness.session.state(), SessionState::Active);
    }

    #[test]
    fn test_unknown_request_not_implemented() {
        let mut harness = Harness::active(config());
        harness.feed(incoming("OPTIONS", "sip:alice@x", "o1", "", ""));
        let responses = harness.sent_responses();
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].status_code, 501);
        assert_eq!(responses[0].reason_phrase, "Not implemented");
    }

    #[test]
    fn test_typing_indicator() {
        let mut harness = Harness::active(config());
        let body = presence::is_composing_document(true).unwrap();
        harness.feed(incoming(
            "MESSAGE",
            "sip:alice@x",
            "t1",
            "Content-Type: application/im-iscomposing+xml\r\n",
            &body,
        ));

        assert_eq!(
            harness.drain_events(),
            vec![AccountEvent::Typing {
                peer: "sip:alice@x".to_string(),
                typing: true
            }]
        );
        assert_eq!(harness.sent_responses()[0].status_code, 200);

        harness.wire.take_sent();
        harness.session.set_typing("alice@x", false).unwrap();
        let message = harness.last_sent(SipMethod::Message);
        assert_eq!(
            message.headers.get("Content-Type"),
            Some(CONTENT_TYPE_ISCOMPOSING)
        );
        assert!(String::from_utf8_lossy(&message.body).contains("<state>idle</state>"));
    }

    #[test]
    fn test_incoming_notify_updates_status() {
        let mut harness = Harness::active(config());
        let body = presence::pidf_document("sip:alice@x", "around").unwrap();
        harness.feed(incoming(
            "NOTIFY",
            "sip:alice@x",
            "n1",
            "Event: presence\r\nContent-Type: application/pidf+xml\r\n",
            &body,
        ));
        assert_eq!(
            harness.drain_events(),
            vec![AccountEvent::StatusText {
                peer: "sip:alice@x".to_string(),
                status: "available".to_string()
            }]
        );
        assert_eq!(harness.sent_responses()[0].status_code, 200);

        // a body without presence status gets no answer
        harness.wire.take_sent();
        harness.feed(incoming("NOTIFY", "sip:alice@x", "n2", "", "<presence/>"));
        assert!(harness.wire.sent_messages().is_empty());
        assert!(harness.drain_events().is_empty());
    }

    #[test]
    fn test_proxy_challenge_resends_same_cseq() {
        let mut harness = Harness::active(config());
        harness.session.send_message("alice@x", "hi").unwrap();
        let message = harness.last_sent(SipMethod::Message);
        assert_eq!(message.uri, "sip:alice@x");
        assert_eq!(message.headers.get("Content-Type"), Some("text/plain"));
        harness.wire.take_sent();

        harness.feed_response(challenge(
            &message,
            407,
            "Proxy-Authenticate",
            r#"Digest realm="proxy", nonce="p1""#,
        ));
        let resent = harness.last_sent(SipMethod::Message);
        assert_eq!(resent.headers.get("CSeq"), message.headers.get("CSeq"));
        assert!(resent
            .headers
            .get("Proxy-Authorization")
            .unwrap()
            .contains("nonce=\"p1\""));
        assert_eq!(harness.session.transactions().len(), 1);

        harness.feed(reply(&resent, 200, "OK"));
        assert!(harness.session.transactions().is_empty());

        // later requests carry credentials up front
        harness.wire.take_sent();
        harness.session.send_message("alice@x", "again").unwrap();
        assert!(harness
            .last_sent(SipMethod::Message)
            .headers
            .contains("Proxy-Authorization"));
    }

    #[test]
    fn test_resend_then_timeout() {
        let mut harness = Harness::active(config());
        let start = Instant::now();
        harness.session.send_message("alice@x", "anyone there").unwrap();
        harness.wire.take_sent();

        harness.session.on_resend_timer(start + Duration::from_secs(3));
        assert_eq!(harness.sent_requests(SipMethod::Message).len(), 1);

        harness.session.on_resend_timer(start + Duration::from_secs(8));
        let events = harness.drain_events();
        assert_eq!(
            events,
            vec![AccountEvent::OperationTimedOut {
                method: "MESSAGE".to_string(),
                target: "sip:alice@x".to_string()
            }]
        );
        assert_eq!(harness.session.state(), SessionState::Active);
    }

    #[test]
    fn test_challenged_messages_keep_session_up() {
        let mut harness = Harness::active(config());
        for round in 0..MAX_AUTH_RETRIES + 2 {
            harness
                .session
                .send_message("alice@x", &format!("note {}", round))
                .unwrap();
            let message = harness.last_sent(SipMethod::Message);
            harness.feed_response(challenge(
                &message,
                401,
                "WWW-Authenticate",
                r#"Digest realm="x", nonce="m1""#,
            ));

            let resent = harness.last_sent(SipMethod::Message);
            assert_eq!(resent.headers.get("CSeq"), message.headers.get("CSeq"));
            assert!(resent.headers.contains("Authorization"));
            harness.feed(reply(&resent, 200, "OK"));
            assert!(harness.session.transactions().is_empty());
        }

        assert_eq!(harness.session.state(), SessionState::Active);
        assert!(!harness
            .drain_events()
            .iter()
            .any(|event| matches!(event, AccountEvent::ConnectionError { .. })));
    }

    #[test]
    fn test_rejected_message_credentials_drop_only_the_request() {
        let mut harness = Harness::active(config());
        harness.session.send_message("alice@x", "let me in").unwrap();
        let mut latest = harness.last_sent(SipMethod::Message);
        harness.wire.take_sent();

        for _ in 0..=MAX_AUTH_RETRIES {
            harness.feed_response(challenge(
                &latest,
                401,
                "WWW-Authenticate",
                r#"Digest realm="x", nonce="m1""#,
            ));
            if let Some(resent) = harness.sent_requests(SipMethod::Message).pop() {
                latest = resent;
            }
        }

        assert_eq!(
            harness.sent_requests(SipMethod::Message).len(),
            MAX_AUTH_RETRIES as usize
        );
        assert!(harness.session.transactions().is_empty());
        assert_eq!(harness.session.state(), SessionState::Active);
        assert!(harness.drain_events().is_empty());
    }

    #[test]
    fn test_unanswered_register_gives_up() {
        let mut harness = Harness::registering();
        let start = Instant::now();
        for tick in 1..=50u64 {
            let now = start + Duration::from_secs(10 * tick);
            harness.session.on_resend_timer(now);
            harness.session.on_subscribe_timer(now);
        }

        assert_eq!(harness.session.state(), SessionState::Closed);
        let mut cseqs: Vec<String> = harness
            .sent_requests(SipMethod::Register)
            .iter()
            .filter_map(|register| register.headers.get("CSeq").map(str::to_string))
            .collect();
        cseqs.dedup();
        assert_eq!(cseqs.len(), MAX_REGISTER_ATTEMPTS as usize);

        let events = harness.drain_events();
        let timeouts = events
            .iter()
            .filter(|event| matches!(event, AccountEvent::OperationTimedOut { .. }))
            .count();
        assert_eq!(timeouts, MAX_REGISTER_ATTEMPTS as usize);
        assert!(matches!(
            events.last(),
            Some(AccountEvent::ConnectionError { reason }) if reason.contains("REGISTER")
        ));
    }

    #[test]
    fn test_failed_resend_still_reports_timeouts() {
        let mut harness = Harness::active(config());
        let start = Instant::now();
        harness.session.send_message("alice@x", "first").unwrap();
        harness.session.on_resend_timer(start + Duration::from_secs(3));
        harness.session.send_message("carol@x", "second").unwrap();

        *harness.wire.broken.lock() = true;
        harness.session.on_resend_timer(start + Duration::from_secs(8));

        let events = harness.drain_events();
        assert_eq!(events.len(), 2);
        assert_eq!(
            events[0],
            AccountEvent::OperationTimedOut {
                method: "MESSAGE".to_string(),
                target: "sip:alice@x".to_string()
            }
        );
        assert!(matches!(events[1], AccountEvent::ConnectionError { .. }));
        assert_eq!(harness.session.state(), SessionState::Closed);
    }

    #[test]
    fn test_unrelated_success_keeps_proxy_retry_count() {
        let mut harness = Harness::registering();
        harness.session.send_message("alice@x", "early").unwrap();
        let early = harness.last_sent(SipMethod::Message);
        assert!(!early.headers.contains("Proxy-Authorization"));

        for round in 0..=MAX_AUTH_RETRIES {
            if round == 2 {
                harness.feed(reply(&early, 200, "OK"));
            }
            let register = harness.last_sent(SipMethod::Register);
            harness.feed_response(challenge(
                &register,
                407,
                "Proxy-Authenticate",
                r#"Digest realm="proxy", nonce="p1""#,
            ));
        }

        assert_eq!(harness.session.state(), SessionState::Closed);
        assert!(harness.drain_events().iter().any(|event| matches!(
            event,
            AccountEvent::ConnectionError { reason } if reason.contains("Wrong Password")
        )));
    }

    #[test]
    fn test_refused_subscription_reports_offline() {
        let mut harness = Harness::active(config());
        harness.session.add_buddy("dave@x").unwrap();
        let subscribe = harness.last_sent(SipMethod::Subscribe);
        assert_eq!(subscribe.uri, "sip:dave@x");

        harness.feed(reply(&subscribe, 404, "Not Found"));
        assert_eq!(
            harness.drain_events(),
            vec![AccountEvent::StatusText {
                peer: "sip:dave@x".to_string(),
                status: "offline".to_string()
            }]
        );

        harness.session.remove_buddy("dave@x");
        assert!(harness.session.registry().buddy("sip:dave@x").is_none());
    }

    #[test]
    fn test_refused_publish_disables_publication() {
        let mut harness = Harness::new(config());
        let register = harness.last_sent(SipMethod::Register);
        harness.feed(reply(&register, 200, "OK"));
        let publish = harness.last_sent(SipMethod::Publish);

        harness.feed(reply(&publish, 403, "Forbidden"));
        assert_eq!(
            harness.session.publish_schedule(),
            PublishSchedule::Disabled
        );

        harness.wire.take_sent();
        harness.session.set_status("away").unwrap();
        assert!(harness.sent_requests(SipMethod::Publish).is_empty());
    }

    #[test]
    fn test_logout_is_idempotent() {
        let mut harness = Harness::active(config());
        harness.session.send_message("alice@x", "bye").unwrap();
        harness.wire.take_sent();

        harness.session.logout();
        assert_eq!(harness.session.state(), SessionState::Closed);
        let unregister = harness.last_sent(SipMethod::Register);
        assert_eq!(unregister.headers.get("Expires"), Some("0"));
        assert!(harness.session.transactions().is_empty());
        assert_eq!(harness.session.registry().watcher_count(), 0);
        assert!(*harness.wire.closed.lock());

        harness.session.logout();
        assert_eq!(harness.wire.sent_messages().len(), 1);
        assert_eq!(harness.drain_events(), vec![AccountEvent::Disconnected]);
    }

    #[test]
    fn test_nothing_is_processed_after_close() {
        let mut harness = Harness::active(config());
        harness.session.logout();
        harness.wire.take_sent();

        harness.feed(incoming(
            "MESSAGE",
            "sip:alice@x",
            "late",
            "Content-Type: text/plain\r\n",
            "late",
        ));
        assert!(harness.wire.sent_messages().is_empty());
        assert_eq!(harness.drain_events(), vec![AccountEvent::Disconnected]);
        assert!(harness.session.send_message("alice@x", "x").is_err());
    }

    #[test]
    fn test_keepalive_reaches_transport() {
        let mut harness = Harness::active(config());
        harness.session.on_keepalive();
        assert_eq!(*harness.wire.keepalives.lock(), 1);
    }

    #[test]
    fn test_state_transitions_are_checked() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let config = config();
        let directory = StaticDirectory::from_config(&config);
        let mut session = SipSession::new(config, Box::new(directory), tx).unwrap();
        assert!(session
            .begin_connecting("10.0.0.1:5060".parse().unwrap())
            .is_err());
        session.begin_resolving().unwrap();
        assert!(session.begin_resolving().is_err());
        assert_eq!(session.state(), SessionState::Resolving);
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let config = AccountConfig::new("nobody", "pw");
        let directory = StaticDirectory::from_config(&config);
        assert!(matches!(
            SipSession::new(config, Box::new(directory), tx),
            Err(SipError::Config(_))
        ));
    }
}

//! Connection configuration.

use std::sync::Arc;

use crate::certificate::{CertVerifier, Credential, ParseOnlyVerifier};
use crate::session::{SessionCache, TicketKey};
use crate::suites;
use crate::types::{NamedGroup, Version};
use crate::Error;

/// Server policy towards client certificates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientAuthPolicy {
    /// Never send CertificateRequest.
    None,
    /// Request a certificate but accept its absence.
    Request,
    /// Request a certificate and fail the handshake without one.
    Require,
}

/// Deliberately anomalous behaviors for negative testing. Everything here
/// defaults to off; nothing in this block is consulted on the happy path
/// unless the test asks for it.
#[derive(Debug, Clone, Copy, Default)]
pub struct TestKnobs {
    /// Server: send HelloRetryRequest even when the client's key share is
    /// usable.
    pub force_hello_retry_request: bool,
    /// Server: after a completed retry, send a second HelloRetryRequest
    /// (a protocol violation the peer should reject).
    pub force_second_hello_retry: bool,
    /// Remap outgoing record sequence numbers on both directions.
    pub sequence_number_mapping: Option<fn(u64) -> u64>,
    /// DTLS: pack ChangeCipherSpec into the same datagram as the adjacent
    /// handshake records instead of flushing it alone.
    pub pack_change_cipher_spec: bool,
    /// Server: accept early data even when the ALPN check fails.
    pub accept_any_early_data: bool,
    /// DTLS: cap handshake fragments below the MTU-derived default.
    pub max_fragment_len: Option<usize>,
    /// Server: plant the TLS 1.3 downgrade sentinel in ServerHello.random
    /// regardless of our actual version ceiling.
    pub send_downgrade_sentinel: bool,
}

/// Configuration shared by client and server connections.
#[derive(Clone)]
pub struct Config {
    min_version: Version,
    max_version: Version,
    cipher_suites: Vec<u16>,
    groups: Vec<NamedGroup>,
    credentials: Vec<Arc<Credential>>,
    client_auth: ClientAuthPolicy,
    verifier: Arc<dyn CertVerifier>,
    alpn_protocols: Vec<Vec<u8>>,
    server_name: Option<String>,
    session_cache: Option<Arc<SessionCache>>,
    ticket_key: TicketKey,
    session_tickets: bool,
    early_data: bool,
    early_data_payload: Vec<u8>,
    mtu: usize,
    knobs: TestKnobs,
}

impl Config {
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder {
            min_version: Version::TLS1_0,
            max_version: Version::TLS1_3,
            cipher_suites: suites::DEFAULT_SUITES.to_vec(),
            groups: NamedGroup::supported().to_vec(),
            credentials: Vec::new(),
            client_auth: ClientAuthPolicy::None,
            verifier: Arc::new(ParseOnlyVerifier),
            alpn_protocols: Vec::new(),
            server_name: None,
            session_cache: None,
            ticket_key: None,
            session_tickets: true,
            early_data: false,
            early_data_payload: Vec::new(),
            mtu: 1400,
            knobs: TestKnobs::default(),
        }
    }

    #[inline(always)]
    pub fn min_version(&self) -> Version {
        self.min_version
    }

    #[inline(always)]
    pub fn max_version(&self) -> Version {
        self.max_version
    }

    /// Cipher-suite preference list, filtered to the suites usable at some
    /// version in `[min_version, max]`.
    pub fn suites_for(&self, max: Version, is_dtls: bool) -> Vec<u16> {
        self.cipher_suites
            .iter()
            .copied()
            .filter(|id| {
                suites::suite_by_id(*id).is_some_and(|s| {
                    Version::all()
                        .iter()
                        .any(|v| *v >= self.min_version && *v <= max && s.supports_version(*v, is_dtls))
                })
            })
            .collect()
    }

    #[inline(always)]
    pub fn cipher_suites(&self) -> &[u16] {
        &self.cipher_suites
    }

    #[inline(always)]
    pub fn groups(&self) -> &[NamedGroup] {
        &self.groups
    }

    #[inline(always)]
    pub fn credentials(&self) -> &[Arc<Credential>] {
        &self.credentials
    }

    #[inline(always)]
    pub fn client_auth(&self) -> ClientAuthPolicy {
        self.client_auth
    }

    #[inline(always)]
    pub fn verifier(&self) -> &Arc<dyn CertVerifier> {
        &self.verifier
    }

    #[inline(always)]
    pub fn alpn_protocols(&self) -> &[Vec<u8>] {
        &self.alpn_protocols
    }

    #[inline(always)]
    pub fn server_name(&self) -> Option<&str> {
        self.server_name.as_deref()
    }

    #[inline(always)]
    pub fn session_cache(&self) -> Option<&Arc<SessionCache>> {
        self.session_cache.as_ref()
    }

    #[inline(always)]
    pub fn ticket_key(&self) -> &TicketKey {
        &self.ticket_key
    }

    #[inline(always)]
    pub fn session_tickets(&self) -> bool {
        self.session_tickets
    }

    #[inline(always)]
    pub fn early_data(&self) -> bool {
        self.early_data
    }

    /// Application bytes a client sends as 0-RTT data during the handshake.
    #[inline(always)]
    pub fn early_data_payload(&self) -> &[u8] {
        &self.early_data_payload
    }

    #[inline(always)]
    pub fn mtu(&self) -> usize {
        self.mtu
    }

    #[inline(always)]
    pub fn knobs(&self) -> &TestKnobs {
        &self.knobs
    }
}

/// Builder for [`Config`].
pub struct ConfigBuilder {
    min_version: Version,
    max_version: Version,
    cipher_suites: Vec<u16>,
    groups: Vec<NamedGroup>,
    credentials: Vec<Arc<Credential>>,
    client_auth: ClientAuthPolicy,
    verifier: Arc<dyn CertVerifier>,
    alpn_protocols: Vec<Vec<u8>>,
    server_name: Option<String>,
    session_cache: Option<Arc<SessionCache>>,
    ticket_key: Option<TicketKey>,
    session_tickets: bool,
    early_data: bool,
    early_data_payload: Vec<u8>,
    mtu: usize,
    knobs: TestKnobs,
}

impl ConfigBuilder {
    /// Supported version range. Defaults to TLS 1.0 through TLS 1.3.
    pub fn versions(mut self, min: Version, max: Version) -> Self {
        self.min_version = min;
        self.max_version = max;
        self
    }

    /// Cipher-suite preference list. Defaults to every suite the engine
    /// speaks, newest first.
    pub fn cipher_suites(mut self, suites: Vec<u16>) -> Self {
        self.cipher_suites = suites;
        self
    }

    /// Key-exchange group preference list.
    pub fn groups(mut self, groups: Vec<NamedGroup>) -> Self {
        self.groups = groups;
        self
    }

    /// Add a credential. Servers iterate these in order during selection;
    /// clients use the first that satisfies a CertificateRequest.
    pub fn credential(mut self, credential: Credential) -> Self {
        self.credentials.push(Arc::new(credential));
        self
    }

    /// Client-certificate policy for servers. Defaults to `None`.
    pub fn client_auth(mut self, policy: ClientAuthPolicy) -> Self {
        self.client_auth = policy;
        self
    }

    /// Peer-chain verifier. Defaults to parse-only.
    pub fn verifier(mut self, verifier: Arc<dyn CertVerifier>) -> Self {
        self.verifier = verifier;
        self
    }

    pub fn alpn_protocols(mut self, protocols: Vec<Vec<u8>>) -> Self {
        self.alpn_protocols = protocols;
        self
    }

    /// SNI name sent by clients, and the session-cache key for resumption.
    pub fn server_name(mut self, name: &str) -> Self {
        self.server_name = Some(name.to_string());
        self
    }

    /// Session cache, shared across connections.
    pub fn session_cache(mut self, cache: Arc<SessionCache>) -> Self {
        self.session_cache = Some(cache);
        self
    }

    /// Ticket encryption key. Random per config when unset, which still
    /// allows resumption against the same config.
    pub fn ticket_key(mut self, key: TicketKey) -> Self {
        self.ticket_key = Some(key);
        self
    }

    /// Whether to issue/accept session tickets. Defaults to true.
    pub fn session_tickets(mut self, enabled: bool) -> Self {
        self.session_tickets = enabled;
        self
    }

    /// Enable 0-RTT (offer as client, accept as server).
    pub fn early_data(mut self, enabled: bool) -> Self {
        self.early_data = enabled;
        self
    }

    /// 0-RTT application payload a client writes during the handshake.
    pub fn early_data_payload(mut self, payload: Vec<u8>) -> Self {
        self.early_data_payload = payload;
        self
    }

    /// Datagram MTU for DTLS packet packing. Defaults to 1400.
    pub fn mtu(mut self, mtu: usize) -> Self {
        self.mtu = mtu;
        self
    }

    pub fn knobs(mut self, knobs: TestKnobs) -> Self {
        self.knobs = knobs;
        self
    }

    pub fn build(self) -> Result<Config, Error> {
        if self.min_version > self.max_version {
            return Err(Error::Config("min_version above max_version".to_string()));
        }
        if self.cipher_suites.is_empty() {
            return Err(Error::Config("empty cipher suite list".to_string()));
        }
        for id in &self.cipher_suites {
            if suites::suite_by_id(*id).is_none() {
                return Err(Error::Config(format!("unknown cipher suite {:04x}", id)));
            }
        }
        if self.groups.is_empty() {
            return Err(Error::Config("empty group list".to_string()));
        }
        Ok(Config {
            min_version: self.min_version,
            max_version: self.max_version,
            cipher_suites: self.cipher_suites,
            groups: self.groups,
            credentials: self.credentials,
            client_auth: self.client_auth,
            verifier: self.verifier,
            alpn_protocols: self.alpn_protocols,
            server_name: self.server_name,
            session_cache: self.session_cache,
            ticket_key: self.ticket_key.unwrap_or_else(TicketKey::random),
            session_tickets: self.session_tickets,
            early_data: self.early_data,
            early_data_payload: self.early_data_payload,
            mtu: self.mtu,
            knobs: self.knobs,
        })
    }
}

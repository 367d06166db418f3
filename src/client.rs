//! Client handshake state machine.

use std::time::SystemTime;

use log::{debug, trace};
use rand::rngs::OsRng;
use rand::RngCore;

use crate::certificate::{leaf_public_key, Credential};
use crate::codec::parse_all;
use crate::config::Config;
use crate::conn::Conn;
use crate::crypto::hkdf::{self, KeySchedule};
use crate::crypto::kx::{rsa_encrypt_premaster, rsa_premaster, EcdheOffer};
use crate::crypto::signing::{tls13_signature_message, PeerPublicKey};
use crate::crypto::{constant_time_eq, prf};
use crate::message::{
    Certificate12, Certificate13, CertificateRequest12, CertificateRequest13, CertificateVerify,
    ClientHello, ClientKeyExchange, EncryptedExtensions, Extension, Finished, HandshakeMessage,
    HelloVerifyRequest, KeyShareEntry, NewSessionTicket12, PskIdentity, PskOffer, ServerHello,
    ServerKeyExchange, DOWNGRADE_TLS12, DOWNGRADE_TLS13, PSK_MODE_DHE_KE,
};
use crate::message::extensions::{
    serialize_alpn_list, serialize_named_group_list, serialize_psk_modes, serialize_server_name,
    serialize_supported_versions_list, serialize_u16_list,
};
use crate::record::CipherState;
use crate::session::Session;
use crate::suites::{suite_by_id, CipherSuite, KeyExchangeAlgorithm};
use crate::transcript::Transcript;
use crate::types::{
    CompressionMethod, ExtensionType, HandshakeType, HashAlgorithm, NamedGroup, SignatureScheme,
    Version,
};
use crate::Error;

/// The protocol allows a single retry; a second HelloRetryRequest is an
/// abort. The counter bounds the loop explicitly rather than trusting the
/// abort path.
const MAX_HELLO_RETRIES: usize = 2;

pub(crate) fn handshake(conn: &mut Conn) -> Result<(), Error> {
    ClientHandshake::new(conn).run()
}

/// Wait states of the client machine. The TLS ≤ 1.2 and TLS 1.3 flows
/// share the front (hello exchange) and then diverge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ClientState {
    // TLS ≤ 1.2 full handshake.
    WaitCertificate,
    WaitServerKeyExchange,
    WaitCertRequestOrDone,
    WaitServerHelloDone,
    // TLS 1.3.
    WaitEncryptedExtensions,
    WaitCertOrCertRequest,
    WaitCertificate13,
    WaitCertificateVerify,
    WaitFinished13,
}

struct ClientHandshake<'a> {
    conn: &'a mut Conn,
    transcript: Transcript,
    hello: ClientHello,
    ecdhe: Option<EcdheOffer>,
    session: Option<Session>,
    psk_offered: bool,
    offered_schemes: Vec<SignatureScheme>,
    sent_early_data: bool,
}

impl<'a> ClientHandshake<'a> {
    fn new(conn: &'a mut Conn) -> ClientHandshake<'a> {
        ClientHandshake {
            conn,
            transcript: Transcript::new(),
            hello: ClientHello {
                client_version: 0,
                random: [0; 32],
                session_id: Vec::new(),
                cookie: None,
                cipher_suites: Vec::new(),
                compression_methods: vec![CompressionMethod::Null],
                extensions: Vec::new(),
            },
            ecdhe: None,
            session: None,
            psk_offered: false,
            offered_schemes: Vec::new(),
            sent_early_data: false,
        }
    }

    fn config(&self) -> &Config {
        &self.conn.config
    }

    fn run(mut self) -> Result<(), Error> {
        self.session = self.lookup_session();
        let group = self.config().groups()[0];
        self.ecdhe = Some(EcdheOffer::generate(group)?);

        self.build_hello()?;
        self.send_hello()?;

        if self.config().early_data() {
            self.maybe_send_early_data()?;
        }

        let mut retries = 0;
        let server_hello = loop {
            let msg = self.conn.next_handshake_message()?;
            match msg.typ {
                HandshakeType::HelloVerifyRequest if self.conn.is_dtls => {
                    if retries > 0 || self.hello.cookie.as_deref().is_some_and(|c| !c.is_empty()) {
                        return Err(Error::UnexpectedMessage(
                            "repeated HelloVerifyRequest".to_string(),
                        ));
                    }
                    let hvr = parse_all(&msg.body, HelloVerifyRequest::parse)?;
                    debug!("HelloVerifyRequest, {} byte cookie", hvr.cookie.len());
                    // Neither the first hello nor the request enters the
                    // transcript (RFC 6347 section 4.2.1).
                    self.transcript = Transcript::new();
                    self.hello.cookie = Some(hvr.cookie);
                    self.send_hello()?;
                }
                HandshakeType::ServerHello => {
                    let hello = parse_all(&msg.body, ServerHello::parse)?;
                    if hello.is_hello_retry_request() {
                        retries += 1;
                        // One retry is the protocol's allowance; anything
                        // beyond is an abort, not another loop turn.
                        if retries >= MAX_HELLO_RETRIES {
                            return Err(Error::UnexpectedMessage(
                                "second HelloRetryRequest".to_string(),
                            ));
                        }
                        self.process_hello_retry(&hello, &msg)?;
                    } else {
                        break (hello, msg);
                    }
                }
                other => {
                    return Err(Error::UnexpectedMessage(format!(
                        "{:?} while waiting for ServerHello",
                        other
                    )))
                }
            }
        };

        let (server_hello, sh_msg) = server_hello;
        let version = self.negotiated_version(&server_hello)?;
        self.conn.vers = Some(version);
        self.check_downgrade(&server_hello, version)?;
        self.conn.server_random = server_hello.random;

        let suite = suite_by_id(server_hello.cipher_suite)
            .filter(|s| self.hello.cipher_suites.contains(&s.id))
            .filter(|s| s.supports_version(version, self.conn.is_dtls))
            .ok_or(Error::NoSharedCipher)?;
        self.conn.suite = Some(suite);
        debug!("negotiated {} with {}", version, suite.name);

        if version >= Version::TLS1_3 {
            self.do_tls13(server_hello, sh_msg, suite)
        } else {
            self.do_tls12(server_hello, sh_msg, suite)
        }
    }

    // ------------------------------------------------------------------
    // Hello construction
    // ------------------------------------------------------------------

    fn lookup_session(&self) -> Option<Session> {
        let cache = self.config().session_cache()?;
        let key = self.conn.cache_key();
        let session = cache.get(&key, SystemTime::now())?;
        let suite = suite_by_id(session.cipher_suite)?;
        if session.version > self.config().max_version()
            || session.version < self.config().min_version()
            || !self.config().cipher_suites().contains(&suite.id)
        {
            return None;
        }
        trace!("offering resumption of {} session", session.version);
        Some(session)
    }

    fn build_hello(&mut self) -> Result<(), Error> {
        let config = self.conn.config.clone();
        let max = config.max_version();
        let is_dtls = self.conn.is_dtls;

        let mut random = [0u8; 32];
        OsRng.fill_bytes(&mut random);
        self.conn.client_random = random;

        // Legacy version field caps at 1.2; 1.3 rides supported_versions.
        let legacy_max = if max > Version::TLS1_2 { Version::TLS1_2 } else { max };
        let client_version = legacy_max.to_wire(is_dtls);

        // Resumption intent is explicit, never inferred from an empty-but-
        // present session ID.
        let mut session_id = Vec::new();
        if let Some(session) = &self.session {
            if session.version < Version::TLS1_3 && !session.session_id.is_empty() {
                session_id = session.session_id.clone();
            }
        }
        if session_id.is_empty() && max >= Version::TLS1_3 && !is_dtls {
            // Middlebox-compatibility session ID.
            let mut id = vec![0u8; 32];
            OsRng.fill_bytes(&mut id);
            session_id = id;
        }

        let mut extensions = Vec::new();
        if let Some(name) = config.server_name() {
            let mut data = Vec::new();
            serialize_server_name(name.as_bytes(), &mut data);
            extensions.push(Extension::new(ExtensionType::ServerName, data));
        }
        {
            let mut data = Vec::new();
            serialize_named_group_list(config.groups(), &mut data);
            extensions.push(Extension::new(ExtensionType::SupportedGroups, data));
            // Uncompressed points only.
            extensions.push(Extension::new(ExtensionType::EcPointFormats, vec![1, 0]));
        }
        {
            self.offered_schemes = default_signature_schemes();
            let ids: Vec<u16> = self.offered_schemes.iter().map(|s| s.as_u16()).collect();
            let mut data = Vec::new();
            serialize_u16_list(&ids, &mut data);
            extensions.push(Extension::new(ExtensionType::SignatureAlgorithms, data));
        }
        if !config.alpn_protocols().is_empty() {
            let mut data = Vec::new();
            serialize_alpn_list(config.alpn_protocols(), &mut data);
            extensions.push(Extension::new(ExtensionType::Alpn, data));
        }
        extensions.push(Extension::new(ExtensionType::ExtendedMasterSecret, Vec::new()));
        if config.session_tickets() && max < Version::TLS1_3 {
            // Offer a stored ticket, or an empty extension to request one.
            let ticket = self
                .session
                .as_ref()
                .filter(|s| s.version < Version::TLS1_3)
                .map(|s| s.ticket.clone())
                .unwrap_or_default();
            extensions.push(Extension::new(ExtensionType::SessionTicket, ticket));
        }
        if max >= Version::TLS1_3 {
            let mut versions = Vec::new();
            for v in Version::all() {
                if *v >= config.min_version() && *v <= max && !(is_dtls && *v == Version::TLS1_0) {
                    versions.push(v.to_wire(is_dtls));
                }
            }
            let mut data = Vec::new();
            serialize_supported_versions_list(&versions, &mut data);
            extensions.push(Extension::new(ExtensionType::SupportedVersions, data));

            let offer = self.ecdhe.as_ref().expect("offer created in run");
            let entry = KeyShareEntry {
                group: offer.group(),
                key_exchange: offer.public().to_vec(),
            };
            let mut data = Vec::new();
            KeyShareEntry::serialize_list(&[entry], &mut data);
            extensions.push(Extension::new(ExtensionType::KeyShare, data));

            let mut data = Vec::new();
            serialize_psk_modes(&[PSK_MODE_DHE_KE], &mut data);
            extensions.push(Extension::new(ExtensionType::PskKeyExchangeModes, data));

            // 0-RTT is offered on stream transports only; the datagram
            // model here has no epoch for early data.
            let offering_early = config.early_data()
                && !is_dtls
                && self
                    .session
                    .as_ref()
                    .is_some_and(|s| s.version == Version::TLS1_3 && s.max_early_data > 0);
            if offering_early {
                extensions.push(Extension::new(ExtensionType::EarlyData, Vec::new()));
            }
        }

        self.hello = ClientHello {
            client_version,
            random,
            session_id,
            cookie: if is_dtls { Some(Vec::new()) } else { None },
            cipher_suites: config.suites_for(max, is_dtls),
            compression_methods: vec![CompressionMethod::Null],
            extensions,
        };
        if self.hello.cipher_suites.is_empty() {
            return Err(Error::Config("no cipher suites for version range".to_string()));
        }

        // The PSK offer must be the last extension; it is (re)attached at
        // send time so binders can cover the final encoding.
        Ok(())
    }

    /// Attach/replace the pre_shared_key extension with valid binders.
    fn attach_psk(&mut self) -> Result<(), Error> {
        self.hello
            .extensions
            .retain(|e| e.typ != ExtensionType::PreSharedKey);
        self.psk_offered = false;

        let Some(session) = &self.session else {
            return Ok(());
        };
        if session.version != Version::TLS1_3
            || self.config().max_version() < Version::TLS1_3
        {
            return Ok(());
        }
        let Some(suite) = suite_by_id(session.cipher_suite) else {
            return Ok(());
        };

        let binder_len = suite.hash.output_len();
        let offer = PskOffer {
            identities: vec![PskIdentity {
                identity: session.ticket.clone(),
                obfuscated_ticket_age: session.obfuscated_age(SystemTime::now()),
            }],
            binders: vec![vec![0u8; binder_len]],
        };
        let mut data = Vec::new();
        offer.serialize(&mut data);
        self.hello
            .extensions
            .push(Extension::new(ExtensionType::PreSharedKey, data));

        // Binder: MAC over the transcript so far plus the hello truncated
        // before the binder list.
        let truncated = self
            .hello
            .truncated_for_binders()
            .ok_or_else(|| Error::Internal("psk offer missing".to_string()))?;
        let mut binder_transcript = self.transcript.raw().to_vec();
        let mut framed = Vec::with_capacity(4 + truncated.len());
        framed.push(HandshakeType::ClientHello.as_u8());
        let full_len = truncated.len() + PskOffer::binders_wire_len(&[binder_len]);
        framed.extend_from_slice(&(full_len as u32).to_be_bytes()[1..]);
        framed.extend_from_slice(&truncated);
        binder_transcript.extend_from_slice(&framed);

        // After a HelloRetryRequest the incremental transcript already
        // runs on this hash; otherwise digest the buffered bytes.
        let binder_hash = if self.transcript.algorithm() == Some(suite.hash) {
            self.transcript.hash_given(&framed)
        } else {
            crate::crypto::digest(suite.hash, &binder_transcript)
        };
        let schedule = KeySchedule::new(suite.hash, self.conn.is_dtls, Some(&session.secret))?;
        let binder_key = schedule.binder_key(false)?;
        let binder = hkdf::finished_mac(suite.hash, &binder_key, &binder_hash, self.conn.is_dtls)?;

        let offer = PskOffer {
            binders: vec![binder],
            ..offer
        };
        let mut data = Vec::new();
        offer.serialize(&mut data);
        let last = self
            .hello
            .extensions
            .last_mut()
            .expect("psk extension just pushed");
        last.data = data;
        self.psk_offered = true;
        Ok(())
    }

    fn send_hello(&mut self) -> Result<(), Error> {
        self.attach_psk()?;
        let mut body = Vec::new();
        self.hello.serialize(&mut body);
        let framed = self
            .conn
            .write_handshake_msg(HandshakeType::ClientHello, &body)?;
        self.transcript.add(&framed);
        self.conn.flush()?;
        self.conn.finish_flight();
        Ok(())
    }

    fn maybe_send_early_data(&mut self) -> Result<(), Error> {
        if self.conn.is_dtls {
            return Ok(());
        }
        let Some(session) = &self.session else {
            return Ok(());
        };
        if !self.psk_offered || session.max_early_data == 0 {
            return Ok(());
        }
        let suite = suite_by_id(session.cipher_suite).ok_or(Error::NoSharedCipher)?;
        let secret = session.secret.clone();

        if !self.conn.is_dtls {
            // Compatibility CCS goes out before any encrypted record.
            self.conn.send_compat_ccs()?;
        }

        let schedule = KeySchedule::new(suite.hash, self.conn.is_dtls, Some(&secret))?;
        let early_secret =
            schedule.derive(b"c e traffic", &self.transcript.hash_with(suite.hash))?;
        self.conn
            .out
            .use_traffic_secret(Version::TLS1_3, suite, &early_secret)?;
        self.sent_early_data = true;
        debug!("0-RTT keys installed for early write");

        let payload = self.conn.config.early_data_payload().to_vec();
        if !payload.is_empty() {
            let wire = Version::TLS1_3.record_wire(self.conn.is_dtls);
            for chunk in payload.chunks(crate::record::MAX_PLAINTEXT) {
                let record = self.conn.out.seal_record(
                    crate::types::ContentType::ApplicationData,
                    wire,
                    chunk,
                )?;
                self.conn.write_record_raw(&record)?;
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // ServerHello processing
    // ------------------------------------------------------------------

    fn negotiated_version(&self, hello: &ServerHello) -> Result<Version, Error> {
        let is_dtls = self.conn.is_dtls;
        let version = match hello.selected_version() {
            Some(wire) => {
                let v = Version::from_wire(wire, is_dtls).ok_or_else(|| {
                    Error::ProtocolVersion(format!("unknown selected version {:04x}", wire))
                })?;
                if v < Version::TLS1_3 {
                    return Err(Error::IllegalParameter(
                        "supported_versions selected a legacy version".to_string(),
                    ));
                }
                v
            }
            None => Version::from_wire(hello.server_version, is_dtls).ok_or_else(|| {
                Error::ProtocolVersion(format!(
                    "unknown server version {:04x}",
                    hello.server_version
                ))
            })?,
        };
        if version > self.config().max_version() || version < self.config().min_version() {
            return Err(Error::ProtocolVersion(format!(
                "server chose {} outside our range",
                version
            )));
        }
        if version >= Version::TLS1_3 && hello.selected_version().is_none() {
            return Err(Error::IllegalParameter(
                "TLS 1.3 without supported_versions".to_string(),
            ));
        }
        Ok(version)
    }

    /// Downgrade sentinels (RFC 8446 section 4.1.3): a server capping us
    /// below our best version announces it in the random tail; seeing the
    /// sentinel when we expected better is fatal.
    fn check_downgrade(&self, hello: &ServerHello, version: Version) -> Result<(), Error> {
        let tail: &[u8; 8] = hello.random[24..].try_into().expect("8-byte tail");
        let max = self.config().max_version();
        if max >= Version::TLS1_3 && version < Version::TLS1_3 && *tail == DOWNGRADE_TLS13 {
            return Err(Error::IllegalParameter(
                "TLS 1.3 downgrade sentinel in ServerHello.random".to_string(),
            ));
        }
        if max >= Version::TLS1_2 && version < Version::TLS1_2 && *tail == DOWNGRADE_TLS12 {
            return Err(Error::IllegalParameter(
                "TLS 1.2 downgrade sentinel in ServerHello.random".to_string(),
            ));
        }
        Ok(())
    }

    fn process_hello_retry(
        &mut self,
        retry: &ServerHello,
        msg: &HandshakeMessage,
    ) -> Result<(), Error> {
        let suite = suite_by_id(retry.cipher_suite)
            .filter(|s| self.hello.cipher_suites.contains(&s.id) && s.is_tls13())
            .ok_or(Error::NoSharedCipher)?;

        // Any 0-RTT keys are void; the retry hello goes out in the clear.
        if self.sent_early_data {
            self.conn.out.reset_cipher();
        }

        // Transcript rule: everything so far collapses into message_hash.
        if self.transcript.algorithm().is_none() {
            self.transcript.start_hash(suite.hash);
        }
        self.transcript.rollup_for_hrr();
        self.transcript.add(&msg.tls_encoding());

        match retry.retry_group().map(NamedGroup::from_u16) {
            Some(group) => {
                if !self.config().groups().contains(&group) {
                    return Err(Error::IllegalParameter(format!(
                        "HelloRetryRequest for unoffered group {:?}",
                        group
                    )));
                }
                if self.ecdhe.as_ref().map(|o| o.group()) == Some(group) {
                    return Err(Error::IllegalParameter(
                        "HelloRetryRequest for a group we already sent".to_string(),
                    ));
                }
                debug!("HelloRetryRequest: regenerating key share on {:?}", group);
                self.ecdhe = Some(EcdheOffer::generate(group)?);

                let offer = self.ecdhe.as_ref().expect("just generated");
                let entry = KeyShareEntry {
                    group,
                    key_exchange: offer.public().to_vec(),
                };
                let mut data = Vec::new();
                KeyShareEntry::serialize_list(&[entry], &mut data);
                set_extension(&mut self.hello.extensions, ExtensionType::KeyShare, data);
            }
            None => {
                // Cookie-only retry; the hello must still change somehow.
                if retry.cookie().is_none() {
                    return Err(Error::IllegalParameter(
                        "HelloRetryRequest changed nothing".to_string(),
                    ));
                }
            }
        }

        if let Some(cookie) = retry.cookie() {
            let mut data = Vec::new();
            let mark = crate::codec::LengthPrefix::u16(&mut data);
            data.extend_from_slice(&cookie);
            mark.finish(&mut data);
            set_extension(&mut self.hello.extensions, ExtensionType::Cookie, data);
        }

        // Early data cannot survive a retry.
        self.hello
            .extensions
            .retain(|e| e.typ != ExtensionType::EarlyData);
        self.sent_early_data = false;

        self.send_hello()
    }

    // ------------------------------------------------------------------
    // TLS 1.3
    // ------------------------------------------------------------------

    fn do_tls13(
        mut self,
        server_hello: ServerHello,
        sh_msg: HandshakeMessage,
        suite: &'static CipherSuite,
    ) -> Result<(), Error> {
        if self.transcript.algorithm().is_none() {
            self.transcript.start_hash(suite.hash);
        } else if self.transcript.algorithm() != Some(suite.hash) {
            return Err(Error::IllegalParameter(
                "cipher suite hash changed after HelloRetryRequest".to_string(),
            ));
        }
        self.transcript.add(&sh_msg.tls_encoding());

        if !server_hello.session_id.is_empty()
            && server_hello.session_id != self.hello.session_id
        {
            return Err(Error::IllegalParameter(
                "ServerHello echoed a different legacy session id".to_string(),
            ));
        }

        // PSK acceptance.
        let mut psk: Option<Vec<u8>> = None;
        if let Some(index) = server_hello.selected_psk() {
            if !self.psk_offered || index != 0 {
                return Err(Error::IllegalParameter(
                    "server accepted an unoffered PSK".to_string(),
                ));
            }
            let session = self.session.as_ref().expect("psk offered");
            if session.cipher_suite != suite.id
                && suite_by_id(session.cipher_suite).map(|s| s.hash) != Some(suite.hash)
            {
                return Err(Error::IllegalParameter(
                    "PSK accepted with an incompatible hash".to_string(),
                ));
            }
            psk = Some(session.secret.clone());
            self.conn.did_resume = true;
        }

        // Key exchange.
        let share = server_hello
            .key_share()
            .ok_or_else(|| Error::IllegalParameter("ServerHello without key_share".to_string()))?;
        let offer = self
            .ecdhe
            .take()
            .ok_or_else(|| Error::Internal("key share consumed twice".to_string()))?;
        if share.group != offer.group() {
            return Err(Error::IllegalParameter(format!(
                "server key share on unoffered group {:?}",
                share.group
            )));
        }
        let shared = offer.finish(&share.key_exchange)?;

        let mut schedule = KeySchedule::new(suite.hash, self.conn.is_dtls, psk.as_deref())?;
        schedule.advance(Some(&shared))?;
        let hs_hash = self.transcript.current_hash();
        let client_hs = schedule.derive(b"c hs traffic", &hs_hash)?;
        let server_hs = schedule.derive(b"s hs traffic", &hs_hash)?;

        // Read keys switch before EncryptedExtensions arrives.
        self.conn
            .use_in_traffic_secret(Version::TLS1_3, suite, &server_hs)?;

        let mut state = ClientState::WaitEncryptedExtensions;
        let mut cert_request: Option<CertificateRequest13> = None;
        let mut server_finished_hash = None;

        loop {
            let msg = self.conn.next_handshake_message()?;
            match (state, msg.typ) {
                (ClientState::WaitEncryptedExtensions, HandshakeType::EncryptedExtensions) => {
                    let ee = parse_all(&msg.body, EncryptedExtensions::parse)?;
                    self.process_encrypted_extensions(&ee)?;
                    self.transcript.add(&msg.tls_encoding());
                    state = if self.conn.did_resume {
                        ClientState::WaitFinished13
                    } else {
                        ClientState::WaitCertOrCertRequest
                    };
                }
                (ClientState::WaitCertOrCertRequest, HandshakeType::CertificateRequest) => {
                    let cr = parse_all(&msg.body, CertificateRequest13::parse)?;
                    self.transcript.add(&msg.tls_encoding());
                    cert_request = Some(cr);
                    state = ClientState::WaitCertificate13;
                }
                (
                    ClientState::WaitCertOrCertRequest | ClientState::WaitCertificate13,
                    HandshakeType::Certificate,
                ) => {
                    let certificate = parse_all(&msg.body, Certificate13::parse)?;
                    if certificate.entries.is_empty() {
                        return Err(Error::BadCertificate(
                            "server sent an empty certificate list".to_string(),
                        ));
                    }
                    let chain = certificate.chain();
                    self.config().verifier().verify(&chain)?;
                    self.conn.peer_certificates = chain;
                    self.transcript.add(&msg.tls_encoding());
                    state = ClientState::WaitCertificateVerify;
                }
                (ClientState::WaitCertificateVerify, HandshakeType::CertificateVerify) => {
                    let cv = parse_all(&msg.body, |i| CertificateVerify::parse(i, Version::TLS1_3))?;
                    let scheme = cv
                        .scheme
                        .filter(|s| s.valid_for_version(Version::TLS1_3))
                        .ok_or_else(|| {
                            Error::IllegalParameter("bad CertificateVerify scheme".to_string())
                        })?;
                    if !self.offered_schemes.contains(&scheme) {
                        return Err(Error::IllegalParameter(format!(
                            "CertificateVerify with unoffered scheme {:?}",
                            scheme
                        )));
                    }
                    let signed =
                        tls13_signature_message(&self.transcript.current_hash(), true);
                    leaf_public_key(&self.conn.peer_certificates)?
                        .verify(scheme, &signed, &cv.signature)?;
                    self.transcript.add(&msg.tls_encoding());
                    state = ClientState::WaitFinished13;
                }
                (ClientState::WaitFinished13, HandshakeType::Finished) => {
                    let finished = Finished::parse_body(&msg.body);
                    let expected = hkdf::finished_mac(
                        suite.hash,
                        &server_hs,
                        &self.transcript.current_hash(),
                        self.conn.is_dtls,
                    )?;
                    if !constant_time_eq(&finished.verify_data, &expected) {
                        return Err(Error::BadRecordMac);
                    }
                    if self.conn.first_finished.is_empty() {
                        self.conn.first_finished = finished.verify_data.clone();
                    }
                    self.transcript.add(&msg.tls_encoding());
                    server_finished_hash = Some(self.transcript.current_hash());
                    break;
                }
                (_, other) => {
                    return Err(Error::UnexpectedMessage(format!(
                        "{:?} in state {:?}",
                        other, state
                    )))
                }
            }
        }

        // Application secrets exist from the server Finished onward.
        schedule.advance(None)?;
        let fin_hash = server_finished_hash.expect("set at Finished");
        let client_app = schedule.derive(b"c ap traffic", &fin_hash)?;
        let server_app = schedule.derive(b"s ap traffic", &fin_hash)?;
        self.conn.exporter_secret = schedule.derive(b"exp master", &fin_hash)?;
        self.conn
            .use_in_traffic_secret(Version::TLS1_3, suite, &server_app)?;

        // End of early data, then our handshake-encrypted flight.
        if self.conn.early_data_accepted {
            let framed = self
                .conn
                .write_handshake_msg(HandshakeType::EndOfEarlyData, &[])?;
            self.transcript.add(&framed);
        } else if !self.sent_early_data && !self.conn.is_dtls {
            self.conn.send_compat_ccs()?;
        }
        self.conn
            .use_out_traffic_secret(Version::TLS1_3, suite, &client_hs)?;

        if let Some(cr) = &cert_request {
            self.send_client_certificate13(cr)?;
        }

        let verify_data = hkdf::finished_mac(
            suite.hash,
            &client_hs,
            &self.transcript.current_hash(),
            self.conn.is_dtls,
        )?;
        let mut body = Vec::new();
        Finished {
            verify_data: verify_data.clone(),
        }
        .serialize(&mut body);
        let framed = self.conn.write_handshake_msg(HandshakeType::Finished, &body)?;
        self.transcript.add(&framed);
        if self.conn.first_finished.is_empty() {
            self.conn.first_finished = verify_data;
        }

        self.conn.resumption_secret =
            schedule.derive(b"res master", &self.transcript.current_hash())?;
        self.conn
            .use_out_traffic_secret(Version::TLS1_3, suite, &client_app)?;

        self.conn.flush()?;
        self.conn.finish_flight();
        Ok(())
    }

    fn process_encrypted_extensions(&mut self, ee: &EncryptedExtensions) -> Result<(), Error> {
        for ext in &ee.extensions {
            match ext.typ {
                ExtensionType::Alpn => {
                    let (_, mut protocols) =
                        crate::message::extensions::parse_alpn_list(&ext.data)
                            .map_err(|_| Error::Decode("bad ALPN extension".to_string()))?;
                    if protocols.len() != 1
                        || !self.config().alpn_protocols().contains(&protocols[0])
                    {
                        return Err(Error::IllegalParameter(
                            "server selected an unoffered ALPN protocol".to_string(),
                        ));
                    }
                    self.conn.alpn_protocol = Some(protocols.remove(0));
                }
                ExtensionType::EarlyData => {
                    if !self.sent_early_data {
                        return Err(Error::IllegalParameter(
                            "early_data accepted but never offered".to_string(),
                        ));
                    }
                    self.conn.early_data_accepted = true;
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn send_client_certificate13(&mut self, request: &CertificateRequest13) -> Result<(), Error> {
        let schemes = request.signature_schemes();
        let credential = self.pick_credential(&schemes, Version::TLS1_3);

        let certificate = match &credential {
            Some(cred) => Certificate13::from_chain(&cred.chain),
            None => Certificate13::default(),
        };
        let mut body = Vec::new();
        certificate.serialize(&mut body);
        let framed = self.conn.write_handshake_msg(HandshakeType::Certificate, &body)?;
        self.transcript.add(&framed);

        let Some(credential) = credential else {
            debug!("certificate requested but no usable credential; sending empty list");
            return Ok(());
        };
        let scheme = credential
            .supported_schemes(Version::TLS1_3)
            .into_iter()
            .find(|s| schemes.contains(s))
            .expect("checked in pick_credential");

        let signed = tls13_signature_message(&self.transcript.current_hash(), false);
        let signature = credential.key.sign(scheme, &signed)?;
        let mut body = Vec::new();
        CertificateVerify {
            scheme: Some(scheme),
            signature,
        }
        .serialize(&mut body);
        let framed = self
            .conn
            .write_handshake_msg(HandshakeType::CertificateVerify, &body)?;
        self.transcript.add(&framed);
        Ok(())
    }

    fn pick_credential(
        &self,
        peer_schemes: &[SignatureScheme],
        version: Version,
    ) -> Option<std::sync::Arc<Credential>> {
        self.config()
            .credentials()
            .iter()
            .find(|cred| {
                cred.supported_schemes(version)
                    .iter()
                    .any(|s| peer_schemes.contains(s))
            })
            .cloned()
    }

    // ------------------------------------------------------------------
    // TLS ≤ 1.2
    // ------------------------------------------------------------------

    fn do_tls12(
        mut self,
        server_hello: ServerHello,
        sh_msg: HandshakeMessage,
        suite: &'static CipherSuite,
    ) -> Result<(), Error> {
        let version = self.conn.vers.expect("set in run");
        if self.sent_early_data {
            return Err(Error::HandshakeFailure(
                "server negotiated a legacy version after a 0-RTT offer".to_string(),
            ));
        }
        let hash = transcript_hash_for(version, suite);
        self.transcript.start_hash(hash);
        self.transcript.add(&sh_msg.tls_encoding());
        self.conn.server_session_id = server_hello.session_id.clone();

        self.conn.extended_master_secret = server_hello.extended_master_secret();

        // Session-ID resumption: the server echoes the exact ID we offered.
        let offered_id = self
            .session
            .as_ref()
            .filter(|s| s.version < Version::TLS1_3 && !s.session_id.is_empty())
            .map(|s| s.session_id.clone());
        let resumed_by_id = offered_id
            .as_deref()
            .is_some_and(|id| !server_hello.session_id.is_empty() && server_hello.session_id == id);

        // Ticket resumption is signaled the same way: the server takes the
        // abbreviated path after accepting our ticket.
        let offered_ticket = self
            .session
            .as_ref()
            .is_some_and(|s| s.version < Version::TLS1_3 && !s.ticket.is_empty());

        if resumed_by_id || offered_ticket {
            let session = self.session.as_ref().expect("checked above");
            if resumed_by_id && session.cipher_suite != suite.id {
                return Err(Error::IllegalParameter(
                    "resumed session with a different cipher suite".to_string(),
                ));
            }
        }

        let expecting_ticket = server_hello.offers_session_ticket();

        if resumed_by_id {
            debug!("session-ID resumption accepted");
            self.conn.did_resume = true;
            let master = self.session.as_ref().expect("resumed").secret.clone();
            return self.finish_tls12_resumption(suite, version, master, expecting_ticket);
        }

        // Full (or ticket-based; the server tells us by skipping
        // Certificate) handshake.
        let mut state = ClientState::WaitCertificate;
        let mut server_kx: Option<ServerKeyExchange> = None;
        let mut cert_request: Option<CertificateRequest12> = None;

        loop {
            let msg = self.conn.next_handshake_message()?;
            // Ticket resumption: server jumps straight to its Finished
            // flight; the first thing we see is NewSessionTicket or the
            // CCS-protected Finished. A Finished here means the record
            // layer already saw CCS, which read_change_cipher_spec guards,
            // so the signal is NewSessionTicket/absence of Certificate.
            match (state, msg.typ) {
                (ClientState::WaitCertificate, HandshakeType::NewSessionTicket)
                    if offered_ticket =>
                {
                    debug!("ticket resumption accepted (ticket refresh)");
                    self.conn.did_resume = true;
                    let ticket = parse_all(&msg.body, NewSessionTicket12::parse)?;
                    self.transcript.add(&msg.tls_encoding());
                    let master = self.session.as_ref().expect("offered").secret.clone();
                    if let Some(session) = self.session.as_mut() {
                        session.ticket = ticket.ticket;
                    }
                    return self.finish_tls12_resumption(suite, version, master, false);
                }
                (ClientState::WaitCertificate, HandshakeType::Certificate) => {
                    let certificate = parse_all(&msg.body, Certificate12::parse)?;
                    if certificate.chain.is_empty() {
                        return Err(Error::BadCertificate(
                            "server sent an empty certificate list".to_string(),
                        ));
                    }
                    self.config().verifier().verify(&certificate.chain)?;
                    self.conn.peer_certificates = certificate.chain;
                    self.transcript.add(&msg.tls_encoding());
                    state = if suite.is_ecdhe() {
                        ClientState::WaitServerKeyExchange
                    } else {
                        ClientState::WaitCertRequestOrDone
                    };
                }
                (ClientState::WaitServerKeyExchange, HandshakeType::ServerKeyExchange) => {
                    let skx = parse_all(&msg.body, |i| ServerKeyExchange::parse(i, version))?;
                    self.verify_server_kx(&skx, version)?;
                    self.transcript.add(&msg.tls_encoding());
                    server_kx = Some(skx);
                    state = ClientState::WaitCertRequestOrDone;
                }
                (ClientState::WaitCertRequestOrDone, HandshakeType::CertificateRequest) => {
                    let cr = parse_all(&msg.body, |i| CertificateRequest12::parse(i, version))?;
                    self.transcript.add(&msg.tls_encoding());
                    cert_request = Some(cr);
                    state = ClientState::WaitServerHelloDone;
                }
                (
                    ClientState::WaitCertRequestOrDone | ClientState::WaitServerHelloDone,
                    HandshakeType::ServerHelloDone,
                ) => {
                    if !msg.body.is_empty() {
                        return Err(Error::Decode("ServerHelloDone with a body".to_string()));
                    }
                    self.transcript.add(&msg.tls_encoding());
                    break;
                }
                (_, other) => {
                    return Err(Error::UnexpectedMessage(format!(
                        "{:?} in state {:?}",
                        other, state
                    )))
                }
            }
        }

        self.finish_tls12_full(suite, version, server_kx, cert_request, expecting_ticket)
    }

    fn verify_server_kx(&self, skx: &ServerKeyExchange, version: Version) -> Result<(), Error> {
        if !self.config().groups().contains(&skx.params.group) {
            return Err(Error::IllegalParameter(format!(
                "ServerKeyExchange on unoffered curve {:?}",
                skx.params.group
            )));
        }
        let blob = ServerKeyExchange::signed_blob(
            &self.conn.client_random,
            &self.conn.server_random,
            &skx.params_raw,
        );
        let key = leaf_public_key(&self.conn.peer_certificates)?;
        match (version >= Version::TLS1_2, skx.scheme) {
            (true, Some(scheme)) => {
                if !self.offered_schemes.contains(&scheme) {
                    return Err(Error::IllegalParameter(format!(
                        "ServerKeyExchange signed with unoffered {:?}",
                        scheme
                    )));
                }
                key.verify(scheme, &blob, &skx.signature)
            }
            (false, None) => key.verify_legacy(&blob, &skx.signature),
            _ => Err(Error::Decode(
                "signature algorithm mismatch with version".to_string(),
            )),
        }
    }

    fn finish_tls12_full(
        mut self,
        suite: &'static CipherSuite,
        version: Version,
        server_kx: Option<ServerKeyExchange>,
        cert_request: Option<CertificateRequest12>,
        expecting_ticket: bool,
    ) -> Result<(), Error> {
        // Client certificate (before ClientKeyExchange).
        let mut client_credential = None;
        if let Some(request) = &cert_request {
            let schemes = if version >= Version::TLS1_2 {
                request.signature_schemes.clone()
            } else {
                default_signature_schemes()
            };
            client_credential = self.pick_credential(&schemes, version);
            let chain = client_credential
                .as_ref()
                .map(|c| c.chain.clone())
                .unwrap_or_default();
            let mut body = Vec::new();
            Certificate12 { chain }.serialize(&mut body);
            let framed = self.conn.write_handshake_msg(HandshakeType::Certificate, &body)?;
            self.transcript.add(&framed);
        }

        // Key exchange.
        let premaster: Vec<u8>;
        let ckx = match suite.kx {
            KeyExchangeAlgorithm::EcdheRsa | KeyExchangeAlgorithm::EcdheEcdsa => {
                let skx = server_kx.ok_or_else(|| {
                    Error::UnexpectedMessage("missing ServerKeyExchange".to_string())
                })?;
                let offer = EcdheOffer::generate(skx.params.group)?;
                let public = offer.public().to_vec();
                premaster = offer.finish(&skx.params.public)?.to_vec();
                ClientKeyExchange::Ecdhe { public }
            }
            KeyExchangeAlgorithm::Rsa => {
                let pm = rsa_premaster(self.hello.client_version);
                let key = leaf_public_key(&self.conn.peer_certificates)?;
                let rsa_key = match key {
                    PeerPublicKey::Rsa(k) => k,
                    _ => {
                        return Err(Error::UnknownCertificateType);
                    }
                };
                let encrypted = rsa_encrypt_premaster(&rsa_key, &pm)?;
                premaster = pm.to_vec();
                ClientKeyExchange::Rsa {
                    encrypted_premaster: encrypted,
                }
            }
            KeyExchangeAlgorithm::Tls13 => unreachable!("TLS 1.3 suite in 1.2 path"),
        };
        let mut body = Vec::new();
        ckx.serialize(&mut body);
        let framed = self
            .conn
            .write_handshake_msg(HandshakeType::ClientKeyExchange, &body)?;
        self.transcript.add(&framed);

        // Master secret; EMS binds it to the session hash at this point.
        let master = if self.conn.extended_master_secret {
            let session_hash = self.transcript.current_hash();
            prf::extended_master_secret(version, suite.hash, &premaster, &session_hash)?
        } else {
            prf::master_secret(
                version,
                suite.hash,
                &premaster,
                &self.conn.client_random,
                &self.conn.server_random,
            )?
        };

        // CertificateVerify proves possession of the client key.
        if let Some(credential) = &client_credential {
            let request = cert_request.as_ref().expect("credential implies request");
            let (scheme, signature) = if version >= Version::TLS1_2 {
                let scheme = credential
                    .supported_schemes(version)
                    .into_iter()
                    .find(|s| request.signature_schemes.contains(s))
                    .ok_or(Error::NoCommonSignatureAlgorithms)?;
                (Some(scheme), credential.key.sign(scheme, self.transcript.raw())?)
            } else {
                (None, credential.key.sign_legacy(self.transcript.raw())?)
            };
            let mut body = Vec::new();
            CertificateVerify { scheme, signature }.serialize(&mut body);
            let framed = self
                .conn
                .write_handshake_msg(HandshakeType::CertificateVerify, &body)?;
            self.transcript.add(&framed);
        }

        self.install_tls12_keys(suite, version, &master, true)?;

        let verify_data = prf::finished_verify_data(
            version,
            suite.hash,
            &master,
            &self.transcript.current_hash(),
            true,
        )?;
        let mut body = Vec::new();
        Finished {
            verify_data: verify_data.clone(),
        }
        .serialize(&mut body);
        let framed = self.conn.write_handshake_msg(HandshakeType::Finished, &body)?;
        self.transcript.add(&framed);
        self.conn.first_finished = verify_data;
        self.conn.flush()?;
        self.conn.finish_flight();

        // Server's ticket (optional), CCS, Finished.
        let new_ticket = if expecting_ticket {
            let msg = self.conn.next_handshake_message()?;
            if msg.typ != HandshakeType::NewSessionTicket {
                return Err(Error::UnexpectedMessage(format!(
                    "{:?} while expecting NewSessionTicket",
                    msg.typ
                )));
            }
            let ticket = parse_all(&msg.body, NewSessionTicket12::parse)?;
            self.transcript.add(&msg.tls_encoding());
            Some(ticket.ticket)
        } else {
            None
        };

        self.conn.read_change_cipher_spec()?;
        self.read_server_finished12(suite, version, &master)?;

        self.store_tls12_session(&master, new_ticket);
        self.conn.master_secret = master;
        Ok(())
    }

    /// Abbreviated handshake tail: server Finished first, then ours.
    fn finish_tls12_resumption(
        mut self,
        suite: &'static CipherSuite,
        version: Version,
        master: Vec<u8>,
        expecting_ticket: bool,
    ) -> Result<(), Error> {
        self.install_tls12_keys(suite, version, &master, false)?;

        if expecting_ticket {
            let msg = self.conn.next_handshake_message()?;
            if msg.typ != HandshakeType::NewSessionTicket {
                return Err(Error::UnexpectedMessage(format!(
                    "{:?} while expecting NewSessionTicket",
                    msg.typ
                )));
            }
            let ticket = parse_all(&msg.body, NewSessionTicket12::parse)?;
            self.transcript.add(&msg.tls_encoding());
            if let Some(session) = self.session.as_mut() {
                session.ticket = ticket.ticket;
            }
        }

        self.conn.read_change_cipher_spec()?;
        let server_verify = self.read_server_finished12(suite, version, &master)?;
        self.conn.first_finished = server_verify;

        self.conn.send_change_cipher_spec()?;
        self.conn.out.change_cipher_spec()?;
        let verify_data = prf::finished_verify_data(
            version,
            suite.hash,
            &master,
            &self.transcript.current_hash(),
            true,
        )?;
        let mut body = Vec::new();
        Finished {
            verify_data: verify_data.clone(),
        }
        .serialize(&mut body);
        let framed = self.conn.write_handshake_msg(HandshakeType::Finished, &body)?;
        self.transcript.add(&framed);
        self.conn.flush()?;
        self.conn.finish_flight();

        self.store_tls12_session(&master, None);
        self.conn.master_secret = master;
        Ok(())
    }

    /// Derive the ≤1.2 key block and stage both directions. When
    /// `send_ccs_now` the client's CCS+commit happens here (full
    /// handshake order); resumption sends it later.
    fn install_tls12_keys(
        &mut self,
        suite: &'static CipherSuite,
        version: Version,
        master: &[u8],
        send_ccs_now: bool,
    ) -> Result<(), Error> {
        let material = 2 * (suite.mac_len + suite.key_len + suite.fixed_iv_len);
        let key_block = prf::key_block(
            version,
            suite.hash,
            master,
            &self.conn.client_random,
            &self.conn.server_random,
            material,
        )?;
        let keys = split_key_block(&key_block, suite);

        let is_dtls = self.conn.is_dtls;
        let client_state = CipherState::for_suite(
            suite, version, is_dtls, keys.client_key, keys.client_mac, keys.client_iv,
        )?;
        let server_state = CipherState::for_suite(
            suite, version, is_dtls, keys.server_key, keys.server_mac, keys.server_iv,
        )?;
        self.conn.out.prepare_cipher_spec(version, client_state);
        self.conn.r#in.prepare_cipher_spec(version, server_state);

        if send_ccs_now {
            self.conn.send_change_cipher_spec()?;
            self.conn.out.change_cipher_spec()?;
        }
        Ok(())
    }

    fn read_server_finished12(
        &mut self,
        suite: &'static CipherSuite,
        version: Version,
        master: &[u8],
    ) -> Result<Vec<u8>, Error> {
        let msg = self.conn.next_handshake_message()?;
        if msg.typ != HandshakeType::Finished {
            return Err(Error::UnexpectedMessage(format!(
                "{:?} while expecting Finished",
                msg.typ
            )));
        }
        let finished = Finished::parse_body(&msg.body);
        let expected = prf::finished_verify_data(
            version,
            suite.hash,
            master,
            &self.transcript.current_hash(),
            false,
        )?;
        if !constant_time_eq(&finished.verify_data, &expected) {
            return Err(Error::BadRecordMac);
        }
        self.transcript.add(&msg.tls_encoding());
        Ok(finished.verify_data)
    }

    fn store_tls12_session(&mut self, master: &[u8], new_ticket: Option<Vec<u8>>) {
        let Some(cache) = self.config().session_cache() else {
            return;
        };
        let suite = self.conn.suite.expect("negotiated");
        let version = self.conn.vers.expect("negotiated");
        // The ID the server assigned is what it will recognize later.
        let session_id = self.conn.server_session_id.clone();
        let ticket = new_ticket
            .or_else(|| self.session.as_ref().map(|s| s.ticket.clone()))
            .unwrap_or_default();
        if session_id.is_empty() && ticket.is_empty() {
            return;
        }
        let session = Session {
            version,
            cipher_suite: suite.id,
            secret: master.to_vec(),
            session_id,
            ticket,
            peer_certificates: self.conn.peer_certificates.clone(),
            alpn_protocol: self.conn.alpn_protocol.clone(),
            extended_master_secret: self.conn.extended_master_secret,
            ticket_age_add: 0,
            max_early_data: 0,
            created_unix: SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
            lifetime_secs: crate::session::DEFAULT_TICKET_LIFETIME.as_secs() as u32,
        };
        cache.put(&self.conn.cache_key(), session);
    }

}

struct KeyBlock<'a> {
    client_mac: &'a [u8],
    server_mac: &'a [u8],
    client_key: &'a [u8],
    server_key: &'a [u8],
    client_iv: &'a [u8],
    server_iv: &'a [u8],
}

fn split_key_block<'a>(block: &'a [u8], suite: &CipherSuite) -> KeyBlock<'a> {
    let (macs, rest) = block.split_at(2 * suite.mac_len);
    let (keys, ivs) = rest.split_at(2 * suite.key_len);
    KeyBlock {
        client_mac: &macs[..suite.mac_len],
        server_mac: &macs[suite.mac_len..],
        client_key: &keys[..suite.key_len],
        server_key: &keys[suite.key_len..],
        client_iv: &ivs[..suite.fixed_iv_len],
        server_iv: &ivs[suite.fixed_iv_len..],
    }
}

fn transcript_hash_for(version: Version, suite: &CipherSuite) -> HashAlgorithm {
    if version >= Version::TLS1_2 {
        suite.hash
    } else {
        HashAlgorithm::MD5SHA1
    }
}

fn default_signature_schemes() -> Vec<SignatureScheme> {
    vec![
        SignatureScheme::ECDSA_SECP256R1_SHA256,
        SignatureScheme::ECDSA_SECP384R1_SHA384,
        SignatureScheme::RSA_PSS_RSAE_SHA256,
        SignatureScheme::RSA_PSS_RSAE_SHA384,
        SignatureScheme::RSA_PKCS1_SHA256,
        SignatureScheme::RSA_PKCS1_SHA384,
        SignatureScheme::RSA_PKCS1_SHA1,
        SignatureScheme::ECDSA_SHA1,
    ]
}

fn set_extension(extensions: &mut Vec<Extension>, typ: ExtensionType, data: Vec<u8>) {
    match extensions.iter_mut().find(|e| e.typ == typ) {
        Some(ext) => ext.data = data,
        None => extensions.push(Extension::new(typ, data)),
    }
}


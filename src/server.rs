//! Server handshake state machine: version and cipher selection,
//! credential matching, HelloRetryRequest issuance, resumption decisions
//! and both key-schedule models.

use std::sync::Arc;
use std::time::SystemTime;

use log::{debug, trace};
use rand::rngs::OsRng;
use rand::RngCore;

use crate::certificate::{leaf_public_key, Credential};
use crate::codec::parse_all;
use crate::config::{ClientAuthPolicy, Config};
use crate::conn::Conn;
use crate::crypto::hkdf::{self, KeySchedule};
use crate::crypto::kx::{rsa_decrypt_premaster, EcdheOffer};
use crate::crypto::signing::{tls13_signature_message, KeyType};
use crate::crypto::{constant_time_eq, prf};
use crate::message::certificate_request::default_certificate_types;
use crate::message::extensions::serialize_alpn_list;
use crate::message::{
    Certificate12, Certificate13, CertificateRequest12, CertificateRequest13, CertificateVerify,
    ClientHello, ClientKeyExchange, EncryptedExtensions, Extension, Finished, HandshakeMessage,
    KeyShareEntry, NewSessionTicket12, NewSessionTicket13, PskOffer, ServerEcdheParams,
    ServerHello, ServerKeyExchange, DOWNGRADE_TLS12, DOWNGRADE_TLS13,
    HELLO_RETRY_REQUEST_RANDOM, PSK_MODE_DHE_KE,
};
use crate::record::CipherState;
use crate::session::{decrypt_ticket, encrypt_ticket, Session, DEFAULT_TICKET_LIFETIME};
use crate::suites::{suite_by_id, CipherSuite, KeyExchangeAlgorithm};
use crate::transcript::Transcript;
use crate::types::{
    CompressionMethod, ExtensionType, HandshakeType, HashAlgorithm, NamedGroup, SignatureScheme,
    Version,
};
use crate::Error;

pub(crate) fn handshake(conn: &mut Conn) -> Result<(), Error> {
    ServerHandshake::new(conn).run()
}

/// States of the pre-1.3 client-flight reader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ClientFlightState {
    WaitCertificateOrKeyExchange,
    WaitClientKeyExchange,
    WaitCertificateVerify,
    Done,
}

struct ServerHandshake<'a> {
    conn: &'a mut Conn,
    transcript: Transcript,
    client_hello: ClientHello,
    offered_session: Option<Session>,
}

impl<'a> ServerHandshake<'a> {
    fn new(conn: &'a mut Conn) -> ServerHandshake<'a> {
        ServerHandshake {
            conn,
            transcript: Transcript::new(),
            client_hello: ClientHello {
                client_version: 0,
                random: [0; 32],
                session_id: Vec::new(),
                cookie: None,
                cipher_suites: Vec::new(),
                compression_methods: Vec::new(),
                extensions: Vec::new(),
            },
            offered_session: None,
        }
    }

    fn config(&self) -> &Config {
        &self.conn.config
    }

    fn run(mut self) -> Result<(), Error> {
        let msg = self.conn.next_handshake_message()?;
        if msg.typ != HandshakeType::ClientHello {
            return Err(Error::UnexpectedMessage(format!(
                "{:?} instead of ClientHello",
                msg.typ
            )));
        }
        let is_dtls = self.conn.is_dtls;
        let hello = parse_all(&msg.body, |i| ClientHello::parse(i, is_dtls))?;
        if !hello
            .compression_methods
            .contains(&CompressionMethod::Null)
        {
            return Err(Error::IllegalParameter(
                "client did not offer null compression".to_string(),
            ));
        }
        self.transcript.add(&msg.tls_encoding());
        self.conn.client_random = hello.random;
        self.client_hello = hello;

        let version = self.select_version()?;
        self.conn.vers = Some(version);
        debug!("selected {}", version);

        if version >= Version::TLS1_3 {
            self.do_tls13()
        } else {
            self.do_tls12(version)
        }
    }

    /// Version selection: supported_versions wins when present; otherwise
    /// clamp the legacy version to at most TLS 1.2.
    fn select_version(&self) -> Result<Version, Error> {
        let config = self.config();
        let is_dtls = self.conn.is_dtls;
        let offered = self.client_hello.supported_versions();
        if !offered.is_empty() {
            for v in Version::all() {
                if *v < config.min_version() || *v > config.max_version() {
                    continue;
                }
                if is_dtls && *v == Version::TLS1_0 {
                    continue;
                }
                if offered.contains(&v.to_wire(is_dtls)) {
                    return Ok(*v);
                }
            }
            return Err(Error::ProtocolVersion(
                "no mutually supported version in supported_versions".to_string(),
            ));
        }

        let client_max = legacy_version_floor(self.client_hello.client_version, is_dtls)
            .ok_or_else(|| {
                Error::ProtocolVersion(format!(
                    "unintelligible client version {:04x}",
                    self.client_hello.client_version
                ))
            })?;
        let our_max = Version::min(config.max_version(), Version::TLS1_2);
        let version = Version::min(client_max, our_max);
        if version < config.min_version() || (is_dtls && version == Version::TLS1_0) {
            return Err(Error::ProtocolVersion(format!(
                "client version {} below our minimum",
                version
            )));
        }
        Ok(version)
    }

    // ------------------------------------------------------------------
    // TLS 1.3
    // ------------------------------------------------------------------

    fn do_tls13(mut self) -> Result<(), Error> {
        let is_dtls = self.conn.is_dtls;
        let suite = self.select_tls13_suite()?;
        self.conn.suite = Some(suite);
        self.transcript.start_hash(suite.hash);
        debug!("selected {}", suite.name);

        // Group selection ignores nothing: the group must be in both lists.
        let client_groups = self.client_hello.supported_groups();
        let group = self
            .config()
            .groups()
            .iter()
            .copied()
            .find(|g| client_groups.contains(g))
            .ok_or(Error::NoSharedGroup)?;

        let mut hello_retries = 0;
        let mut sent_cookie: Option<Vec<u8>> = None;
        let wanted_retries = if self.config().knobs().force_second_hello_retry {
            2
        } else if self.config().knobs().force_hello_retry_request {
            1
        } else {
            0
        };

        loop {
            let have_share = self
                .client_hello
                .key_shares()
                .iter()
                .any(|e| e.group == group);
            let need_retry = !have_share || hello_retries < wanted_retries;
            if !need_retry {
                break;
            }
            if hello_retries >= 2 {
                return Err(Error::IllegalParameter(
                    "client never supplied a usable key share".to_string(),
                ));
            }
            hello_retries += 1;
            // A forced retry when the share is already usable carries only
            // a cookie; requesting a group the client already sent would
            // itself be a protocol violation.
            self.send_hello_retry(suite, group, !have_share, &mut sent_cookie)?;
            self.read_retry_hello(group, &sent_cookie)?;
        }

        // Resumption decision.
        let mut psk: Option<Vec<u8>> = None;
        let mut resumed_session: Option<Session> = None;
        if let Some(offer) = self.client_hello.psk_offer() {
            if let Some(session) = self.check_tls13_resumption(&offer, suite)? {
                psk = Some(session.secret.clone());
                resumed_session = Some(session);
                self.conn.did_resume = true;
                debug!("TLS 1.3 PSK resumption accepted");
            }
        }

        // ALPN.
        let alpn = self.select_alpn()?;
        self.conn.alpn_protocol = alpn.clone();

        // 0-RTT decision.
        let knobs = *self.config().knobs();
        let accept_early = self.client_hello.offers_early_data()
            && hello_retries == 0
            && self.conn.did_resume
            && self.config().early_data()
            && (knobs.accept_any_early_data
                || resumed_session
                    .as_ref()
                    .is_some_and(|s| s.alpn_protocol == alpn && s.max_early_data > 0));
        if self.client_hello.offers_early_data() && !accept_early {
            // Reject by skipping over whatever the client already sent.
            self.conn.skip_early_data = true;
        }

        // Key exchange.
        let client_share = self
            .client_hello
            .key_shares()
            .into_iter()
            .find(|e| e.group == group)
            .expect("retry loop guarantees a share");
        let offer = EcdheOffer::generate(group)?;
        let server_public = offer.public().to_vec();
        let shared = offer.finish(&client_share.key_exchange)?;

        // Hash of the ClientHello alone, the context for the early traffic
        // secret.
        let ch_hash = self.transcript.current_hash();

        // ServerHello.
        let mut random = [0u8; 32];
        OsRng.fill_bytes(&mut random);
        self.conn.server_random = random;
        let mut extensions = vec![Extension::new(
            ExtensionType::SupportedVersions,
            Version::TLS1_3.to_wire(is_dtls).to_be_bytes().to_vec(),
        )];
        {
            let entry = KeyShareEntry {
                group,
                key_exchange: server_public,
            };
            let mut data = Vec::new();
            entry.serialize(&mut data);
            extensions.push(Extension::new(ExtensionType::KeyShare, data));
        }
        if self.conn.did_resume {
            extensions.push(Extension::new(
                ExtensionType::PreSharedKey,
                0u16.to_be_bytes().to_vec(),
            ));
        }
        let server_hello = ServerHello {
            server_version: Version::TLS1_2.to_wire(is_dtls),
            random,
            session_id: self.client_hello.session_id.clone(),
            cipher_suite: suite.id,
            compression_method: CompressionMethod::Null,
            extensions,
        };
        let mut body = Vec::new();
        server_hello.serialize(&mut body);
        let framed = self.conn.write_handshake_msg(HandshakeType::ServerHello, &body)?;
        self.transcript.add(&framed);
        if !is_dtls {
            self.conn.send_compat_ccs()?;
        }

        // Key schedule through the handshake secrets.
        let mut schedule = KeySchedule::new(suite.hash, is_dtls, psk.as_deref())?;
        let early_traffic_secret = if accept_early {
            // Early keys are bound to the ClientHello alone.
            Some(schedule.derive(b"c e traffic", &ch_hash)?)
        } else {
            None
        };
        schedule.advance(Some(&shared))?;
        let hs_hash = self.transcript.current_hash();
        let client_hs = schedule.derive(b"c hs traffic", &hs_hash)?;
        let server_hs = schedule.derive(b"s hs traffic", &hs_hash)?;
        self.conn
            .use_out_traffic_secret(Version::TLS1_3, suite, &server_hs)?;

        // EncryptedExtensions.
        let mut ee = EncryptedExtensions::default();
        if let Some(protocol) = &alpn {
            let mut data = Vec::new();
            serialize_alpn_list(std::slice::from_ref(protocol), &mut data);
            ee.extensions.push(Extension::new(ExtensionType::Alpn, data));
        }
        if accept_early {
            ee.extensions
                .push(Extension::new(ExtensionType::EarlyData, Vec::new()));
            self.conn.early_data_accepted = true;
        }
        let mut body = Vec::new();
        ee.serialize(&mut body);
        let framed = self
            .conn
            .write_handshake_msg(HandshakeType::EncryptedExtensions, &body)?;
        self.transcript.add(&framed);

        // Certificate flight, unless resuming.
        let mut requested_client_cert = false;
        if !self.conn.did_resume {
            if self.config().client_auth() != ClientAuthPolicy::None {
                let request =
                    CertificateRequest13::with_signature_schemes(&supported_verify_schemes());
                let mut body = Vec::new();
                request.serialize(&mut body);
                let framed = self
                    .conn
                    .write_handshake_msg(HandshakeType::CertificateRequest, &body)?;
                self.transcript.add(&framed);
                requested_client_cert = true;
            }

            let (credential, scheme) = self.select_credential_tls13()?;
            let certificate = Certificate13::from_chain(&credential.chain);
            let mut body = Vec::new();
            certificate.serialize(&mut body);
            let framed = self.conn.write_handshake_msg(HandshakeType::Certificate, &body)?;
            self.transcript.add(&framed);

            let signed = tls13_signature_message(&self.transcript.current_hash(), true);
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
        }

        // Server Finished.
        let verify_data = hkdf::finished_mac(
            suite.hash,
            &server_hs,
            &self.transcript.current_hash(),
            is_dtls,
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

        // Application write keys exist from our Finished onward.
        schedule.advance(None)?;
        let fin_hash = self.transcript.current_hash();
        let client_app = schedule.derive(b"c ap traffic", &fin_hash)?;
        let server_app = schedule.derive(b"s ap traffic", &fin_hash)?;
        self.conn.exporter_secret = schedule.derive(b"exp master", &fin_hash)?;
        self.conn
            .use_out_traffic_secret(Version::TLS1_3, suite, &server_app)?;

        // Inbound: early data, then the client's handshake flight.
        if let Some(early_secret) = &early_traffic_secret {
            self.conn
                .use_in_traffic_secret(Version::TLS1_3, suite, early_secret)?;
            let max = resumed_session
                .as_ref()
                .map(|s| s.max_early_data as usize)
                .unwrap_or(usize::MAX);
            let eoed = self.conn.read_early_data_until_eoed(max)?;
            if eoed.typ != HandshakeType::EndOfEarlyData {
                return Err(Error::UnexpectedMessage(format!(
                    "{:?} while expecting EndOfEarlyData",
                    eoed.typ
                )));
            }
            debug!(
                "accepted {} bytes of early data",
                self.conn.early_data_received.len()
            );
            self.transcript.add(&eoed.tls_encoding());
        }
        self.conn
            .use_in_traffic_secret(Version::TLS1_3, suite, &client_hs)?;

        // Client certificate flight.
        if requested_client_cert {
            let msg = self.conn.next_handshake_message()?;
            if msg.typ != HandshakeType::Certificate {
                return Err(Error::UnexpectedMessage(format!(
                    "{:?} while expecting client Certificate",
                    msg.typ
                )));
            }
            let certificate = parse_all(&msg.body, Certificate13::parse)?;
            self.transcript.add(&msg.tls_encoding());
            if certificate.entries.is_empty() {
                if self.config().client_auth() == ClientAuthPolicy::Require {
                    return Err(Error::CertificateRequired);
                }
            } else {
                let chain = certificate.chain();
                self.config().verifier().verify(&chain)?;
                self.conn.peer_certificates = chain;

                let msg = self.conn.next_handshake_message()?;
                if msg.typ != HandshakeType::CertificateVerify {
                    return Err(Error::UnexpectedMessage(format!(
                        "{:?} while expecting CertificateVerify",
                        msg.typ
                    )));
                }
                let cv = parse_all(&msg.body, |i| CertificateVerify::parse(i, Version::TLS1_3))?;
                let scheme = cv
                    .scheme
                    .filter(|s| s.valid_for_version(Version::TLS1_3))
                    .ok_or_else(|| {
                        Error::IllegalParameter("bad CertificateVerify scheme".to_string())
                    })?;
                let signed = tls13_signature_message(&self.transcript.current_hash(), false);
                leaf_public_key(&self.conn.peer_certificates)?
                    .verify(scheme, &signed, &cv.signature)?;
                self.transcript.add(&msg.tls_encoding());
            }
        }

        // Client Finished.
        let msg = self.conn.next_handshake_message()?;
        if msg.typ != HandshakeType::Finished {
            return Err(Error::UnexpectedMessage(format!(
                "{:?} while expecting client Finished",
                msg.typ
            )));
        }
        let finished = Finished::parse_body(&msg.body);
        let expected = hkdf::finished_mac(
            suite.hash,
            &client_hs,
            &self.transcript.current_hash(),
            is_dtls,
        )?;
        if !constant_time_eq(&finished.verify_data, &expected) {
            return Err(Error::BadRecordMac);
        }
        self.transcript.add(&msg.tls_encoding());

        self.conn.resumption_secret =
            schedule.derive(b"res master", &self.transcript.current_hash())?;
        self.conn
            .use_in_traffic_secret(Version::TLS1_3, suite, &client_app)?;

        self.send_tls13_ticket(suite)?;
        Ok(())
    }

    fn select_tls13_suite(&self) -> Result<&'static CipherSuite, Error> {
        self.config()
            .cipher_suites()
            .iter()
            .filter_map(|id| suite_by_id(*id))
            .find(|s| s.is_tls13() && self.client_hello.cipher_suites.contains(&s.id))
            .ok_or(Error::NoSharedCipher)
    }

    fn send_hello_retry(
        &mut self,
        suite: &'static CipherSuite,
        group: NamedGroup,
        include_key_share: bool,
        sent_cookie: &mut Option<Vec<u8>>,
    ) -> Result<(), Error> {
        debug!("sending HelloRetryRequest for {:?}", group);
        self.transcript.rollup_for_hrr();

        let mut cookie = vec![0u8; 32];
        OsRng.fill_bytes(&mut cookie);
        *sent_cookie = Some(cookie.clone());

        let mut extensions = vec![Extension::new(
            ExtensionType::SupportedVersions,
            Version::TLS1_3
                .to_wire(self.conn.is_dtls)
                .to_be_bytes()
                .to_vec(),
        )];
        if include_key_share {
            extensions.push(Extension::new(
                ExtensionType::KeyShare,
                group.as_u16().to_be_bytes().to_vec(),
            ));
        }
        {
            let mut data = Vec::new();
            let mark = crate::codec::LengthPrefix::u16(&mut data);
            data.extend_from_slice(&cookie);
            mark.finish(&mut data);
            extensions.push(Extension::new(ExtensionType::Cookie, data));
        }

        let retry = ServerHello {
            server_version: Version::TLS1_2.to_wire(self.conn.is_dtls),
            random: HELLO_RETRY_REQUEST_RANDOM,
            session_id: self.client_hello.session_id.clone(),
            cipher_suite: suite.id,
            compression_method: CompressionMethod::Null,
            extensions,
        };
        let mut body = Vec::new();
        retry.serialize(&mut body);
        let framed = self.conn.write_handshake_msg(HandshakeType::ServerHello, &body)?;
        self.transcript.add(&framed);
        if !self.conn.is_dtls {
            self.conn.send_compat_ccs()?;
        }
        self.conn.flush()?;
        self.conn.finish_flight();
        Ok(())
    }

    /// Read the retry ClientHello and enforce the byte-diff rule: only the
    /// cookie, key_share and PSK fields may change.
    fn read_retry_hello(
        &mut self,
        group: NamedGroup,
        sent_cookie: &Option<Vec<u8>>,
    ) -> Result<(), Error> {
        let msg = self.conn.next_handshake_message()?;
        if msg.typ != HandshakeType::ClientHello {
            return Err(Error::UnexpectedMessage(format!(
                "{:?} while expecting the retry ClientHello",
                msg.typ
            )));
        }
        let is_dtls = self.conn.is_dtls;
        let retry = parse_all(&msg.body, |i| ClientHello::parse(i, is_dtls))?;

        if let Some(field) = self.client_hello.illegal_retry_difference(&retry) {
            return Err(Error::IllegalParameter(format!(
                "retry ClientHello changed {}",
                field
            )));
        }
        if let Some(cookie) = sent_cookie {
            if retry.cookie_extension().as_deref() != Some(cookie.as_slice()) {
                return Err(Error::IllegalParameter(
                    "retry ClientHello did not echo the cookie".to_string(),
                ));
            }
        }
        if !retry.key_shares().iter().any(|e| e.group == group) {
            return Err(Error::IllegalParameter(
                "retry ClientHello missing the requested key share".to_string(),
            ));
        }

        self.transcript.add(&msg.tls_encoding());
        self.client_hello = retry;
        Ok(())
    }

    fn check_tls13_resumption(
        &mut self,
        offer: &PskOffer,
        suite: &'static CipherSuite,
    ) -> Result<Option<Session>, Error> {
        if !self.client_hello.psk_modes().contains(&PSK_MODE_DHE_KE) {
            return Ok(None);
        }
        if offer.identities.len() != offer.binders.len() || offer.identities.is_empty() {
            return Err(Error::IllegalParameter(
                "PSK identity/binder count mismatch".to_string(),
            ));
        }
        // Only the first identity is considered.
        let identity = &offer.identities[0];
        let Some(session) = decrypt_ticket(self.config().ticket_key(), &identity.identity) else {
            trace!("PSK ticket did not decrypt; continuing without resumption");
            return Ok(None);
        };
        if session.expired(SystemTime::now()) {
            return Ok(None);
        }
        if session.version != Version::TLS1_3 {
            return Ok(None);
        }
        // The cipher suite may change across resumption, but its hash may
        // not.
        if suite_by_id(session.cipher_suite).map(|s| s.hash) != Some(suite.hash) {
            return Ok(None);
        }
        if self.config().client_auth() == ClientAuthPolicy::Require
            && session.peer_certificates.is_empty()
        {
            return Ok(None);
        }

        // Binder check over the transcript with the binder list removed.
        let binder_lens: Vec<usize> = offer.binders.iter().map(|b| b.len()).collect();
        let binders_len = PskOffer::binders_wire_len(&binder_lens);
        let raw = self.transcript.raw();
        if raw.len() < binders_len {
            return Err(Error::Decode("transcript shorter than binders".to_string()));
        }
        let truncated = &raw[..raw.len() - binders_len];
        let schedule = KeySchedule::new(suite.hash, self.conn.is_dtls, Some(&session.secret))?;
        let binder_key = schedule.binder_key(false)?;
        let expected = hkdf::finished_mac(
            suite.hash,
            &binder_key,
            &crate::crypto::digest(suite.hash, truncated),
            self.conn.is_dtls,
        )?;
        if !constant_time_eq(&offer.binders[0], &expected) {
            return Err(Error::DecryptError("PSK binder mismatch".to_string()));
        }
        Ok(Some(session))
    }

    fn select_credential_tls13(&self) -> Result<(Arc<Credential>, SignatureScheme), Error> {
        let client_schemes = self.client_hello.signature_schemes();
        if client_schemes.is_empty() {
            return Err(Error::NoCommonSignatureAlgorithms);
        }
        let trust_anchors = self.client_hello.certificate_authorities();
        let mut deepest = Error::UnknownCertificateType;
        for credential in self.config().credentials() {
            // TLS 1.3 ignores the curve list; the ECDSA curve rides in the
            // signature scheme itself.
            let ours = credential.supported_schemes(Version::TLS1_3);
            let Some(scheme) = ours.into_iter().find(|s| client_schemes.contains(s)) else {
                if !matches!(deepest, Error::NoMatchingIssuer) {
                    deepest = Error::NoCommonSignatureAlgorithms;
                }
                continue;
            };
            if !trust_anchors.is_empty() {
                let chains = credential
                    .issuer_der()
                    .map(|issuer| trust_anchors.contains(&issuer))
                    .unwrap_or(false);
                if !chains {
                    deepest = Error::NoMatchingIssuer;
                    continue;
                }
            }
            return Ok((credential.clone(), scheme));
        }
        Err(deepest)
    }

    fn select_alpn(&self) -> Result<Option<Vec<u8>>, Error> {
        let client = self.client_hello.alpn_protocols();
        let ours = self.config().alpn_protocols();
        if client.is_empty() || ours.is_empty() {
            return Ok(None);
        }
        for protocol in ours {
            if client.contains(protocol) {
                return Ok(Some(protocol.clone()));
            }
        }
        Err(Error::NoApplicationProtocol)
    }

    fn send_tls13_ticket(&mut self, suite: &'static CipherSuite) -> Result<(), Error> {
        if !self.config().session_tickets() {
            return Ok(());
        }
        let mut nonce = vec![0u8; 8];
        OsRng.fill_bytes(&mut nonce);
        let psk = hkdf::hkdf_expand_label(
            suite.hash,
            &self.conn.resumption_secret,
            b"resumption",
            &nonce,
            suite.hash.output_len(),
            self.conn.is_dtls,
        )?;
        let mut age_add_bytes = [0u8; 4];
        OsRng.fill_bytes(&mut age_add_bytes);
        let age_add = u32::from_be_bytes(age_add_bytes);

        let max_early_data = if self.config().early_data() { 16384 } else { 0 };
        let session = Session {
            version: Version::TLS1_3,
            cipher_suite: suite.id,
            secret: psk,
            session_id: Vec::new(),
            ticket: Vec::new(),
            peer_certificates: self.conn.peer_certificates.clone(),
            alpn_protocol: self.conn.alpn_protocol.clone(),
            extended_master_secret: false,
            ticket_age_add: age_add,
            max_early_data,
            created_unix: SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
            lifetime_secs: DEFAULT_TICKET_LIFETIME.as_secs() as u32,
        };
        let ticket = encrypt_ticket(self.config().ticket_key(), &session)?;

        let mut extensions = Vec::new();
        if max_early_data > 0 {
            extensions.push(Extension::new(
                ExtensionType::EarlyData,
                max_early_data.to_be_bytes().to_vec(),
            ));
        }
        let nst = NewSessionTicket13 {
            lifetime: DEFAULT_TICKET_LIFETIME.as_secs() as u32,
            age_add,
            nonce,
            ticket,
            extensions,
        };
        let mut body = Vec::new();
        nst.serialize(&mut body);
        self.conn
            .write_handshake_msg(HandshakeType::NewSessionTicket, &body)?;
        self.conn.flush()?;
        self.conn.finish_flight();
        Ok(())
    }

    // ------------------------------------------------------------------
    // TLS ≤ 1.2
    // ------------------------------------------------------------------

    fn do_tls12(mut self, version: Version) -> Result<(), Error> {
        let is_dtls = self.conn.is_dtls;

        // Resumption lookup precedes suite selection: an accepted session
        // pins the suite.
        self.offered_session = self.lookup_tls12_session(version);

        if let Some(session) = self.offered_session.take() {
            return self.do_tls12_resumption(version, session);
        }

        let (suite, credential, scheme) = self.select_credential_tls12(version)?;
        self.conn.suite = Some(suite);
        self.transcript
            .start_hash(transcript_hash_for(version, suite));
        debug!("selected {} with {:?} credential", suite.name, credential.key_type());

        let client_ems = self.client_hello.offers_extended_master_secret();
        self.conn.extended_master_secret = client_ems;
        let will_ticket = self.config().session_tickets()
            && self.client_hello.session_ticket().is_some();

        let alpn = self.select_alpn()?;
        self.conn.alpn_protocol = alpn.clone();

        // Fresh session ID when we can cache the session.
        let session_id = if self.config().session_cache().is_some() {
            let mut id = vec![0u8; 32];
            OsRng.fill_bytes(&mut id);
            id
        } else {
            Vec::new()
        };
        self.conn.server_session_id = session_id.clone();

        self.send_tls12_server_hello(version, suite, session_id, client_ems, will_ticket, &alpn)?;

        // Certificate.
        let mut body = Vec::new();
        Certificate12 {
            chain: credential.chain.clone(),
        }
        .serialize(&mut body);
        let framed = self.conn.write_handshake_msg(HandshakeType::Certificate, &body)?;
        self.transcript.add(&framed);

        // ServerKeyExchange for the ECDHE suites.
        let mut server_offer = None;
        if suite.is_ecdhe() {
            let client_groups = self.client_hello.supported_groups();
            let group = self
                .config()
                .groups()
                .iter()
                .copied()
                .find(|g| client_groups.is_empty() || client_groups.contains(g))
                .ok_or(Error::NoSharedGroup)?;
            let offer = EcdheOffer::generate(group)?;

            let params = ServerEcdheParams {
                group,
                public: offer.public().to_vec(),
            };
            let mut params_raw = Vec::new();
            params.serialize(&mut params_raw);
            let blob = ServerKeyExchange::signed_blob(
                &self.conn.client_random,
                &self.conn.server_random,
                &params_raw,
            );
            let (scheme_field, signature) = if version >= Version::TLS1_2 {
                let scheme = scheme.ok_or(Error::NoCommonSignatureAlgorithms)?;
                (Some(scheme), credential.key.sign(scheme, &blob)?)
            } else {
                (None, credential.key.sign_legacy(&blob)?)
            };
            let skx = ServerKeyExchange {
                params,
                params_raw,
                scheme: scheme_field,
                signature,
            };
            let mut body = Vec::new();
            skx.serialize(&mut body);
            let framed = self
                .conn
                .write_handshake_msg(HandshakeType::ServerKeyExchange, &body)?;
            self.transcript.add(&framed);
            server_offer = Some(offer);
        }

        // CertificateRequest.
        let requesting = self.config().client_auth() != ClientAuthPolicy::None;
        if requesting {
            let request = CertificateRequest12 {
                certificate_types: default_certificate_types(),
                signature_schemes: if version >= Version::TLS1_2 {
                    supported_verify_schemes_tls12()
                } else {
                    Vec::new()
                },
                certificate_authorities: Vec::new(),
            };
            let mut body = Vec::new();
            request.serialize(&mut body, version);
            let framed = self
                .conn
                .write_handshake_msg(HandshakeType::CertificateRequest, &body)?;
            self.transcript.add(&framed);
        }

        let framed = self
            .conn
            .write_handshake_msg(HandshakeType::ServerHelloDone, &[])?;
        self.transcript.add(&framed);
        self.conn.flush()?;
        self.conn.finish_flight();

        // Client flight.
        let mut state = if requesting {
            ClientFlightState::WaitCertificateOrKeyExchange
        } else {
            ClientFlightState::WaitClientKeyExchange
        };
        let mut client_cert_sent = false;
        let mut master: Option<Vec<u8>> = None;

        loop {
            if state == ClientFlightState::Done {
                break;
            }
            let msg = self.conn.next_handshake_message()?;
            match (state, msg.typ) {
                (ClientFlightState::WaitCertificateOrKeyExchange, HandshakeType::Certificate) => {
                    let certificate = parse_all(&msg.body, Certificate12::parse)?;
                    self.transcript.add(&msg.tls_encoding());
                    if certificate.chain.is_empty() {
                        if self.config().client_auth() == ClientAuthPolicy::Require {
                            return Err(Error::HandshakeFailure(
                                "client certificate required but not supplied".to_string(),
                            ));
                        }
                    } else {
                        self.config().verifier().verify(&certificate.chain)?;
                        self.conn.peer_certificates = certificate.chain;
                        client_cert_sent = true;
                    }
                    state = ClientFlightState::WaitClientKeyExchange;
                }
                (
                    ClientFlightState::WaitCertificateOrKeyExchange
                    | ClientFlightState::WaitClientKeyExchange,
                    HandshakeType::ClientKeyExchange,
                ) => {
                    if state == ClientFlightState::WaitCertificateOrKeyExchange
                        && self.config().client_auth() == ClientAuthPolicy::Require
                    {
                        return Err(Error::HandshakeFailure(
                            "client certificate required but not supplied".to_string(),
                        ));
                    }
                    let pm = self.process_client_key_exchange(&msg, suite, server_offer.take())?;
                    self.transcript.add(&msg.tls_encoding());

                    let m = if self.conn.extended_master_secret {
                        let session_hash = self.transcript.current_hash();
                        prf::extended_master_secret(version, suite.hash, &pm, &session_hash)?
                    } else {
                        prf::master_secret(
                            version,
                            suite.hash,
                            &pm,
                            &self.conn.client_random,
                            &self.conn.server_random,
                        )?
                    };
                    master = Some(m);
                    state = if client_cert_sent {
                        ClientFlightState::WaitCertificateVerify
                    } else {
                        ClientFlightState::Done
                    };
                }
                (ClientFlightState::WaitCertificateVerify, HandshakeType::CertificateVerify) => {
                    let cv = parse_all(&msg.body, |i| CertificateVerify::parse(i, version))?;
                    let key = leaf_public_key(&self.conn.peer_certificates)?;
                    match (version >= Version::TLS1_2, cv.scheme) {
                        (true, Some(scheme)) => {
                            key.verify(scheme, self.transcript.raw(), &cv.signature)?
                        }
                        (false, None) => key.verify_legacy(self.transcript.raw(), &cv.signature)?,
                        _ => {
                            return Err(Error::Decode(
                                "signature algorithm mismatch with version".to_string(),
                            ))
                        }
                    }
                    self.transcript.add(&msg.tls_encoding());
                    state = ClientFlightState::Done;
                }
                (_, other) => {
                    return Err(Error::UnexpectedMessage(format!(
                        "{:?} in state {:?}",
                        other, state
                    )))
                }
            }
        }
        let master = master.expect("set when leaving the flight loop");

        // Keys for both directions; client commits first.
        self.install_tls12_keys(suite, version, &master)?;
        self.conn.read_change_cipher_spec()?;
        let client_verify = self.read_finished12(suite, version, &master, true)?;
        self.conn.first_finished = client_verify;

        // Ticket, then our CCS + Finished.
        let mut ticket_bytes = None;
        if will_ticket {
            ticket_bytes = Some(self.issue_tls12_ticket(version, suite, &master)?);
        }
        self.conn.send_change_cipher_spec()?;
        self.conn.out.change_cipher_spec()?;
        self.send_finished12(suite, version, &master)?;
        self.conn.flush()?;
        self.conn.finish_flight();

        self.store_tls12_session(version, suite, &master, ticket_bytes);
        self.conn.master_secret = master;
        Ok(())
    }

    fn do_tls12_resumption(mut self, version: Version, session: Session) -> Result<(), Error> {
        let suite = suite_by_id(session.cipher_suite).ok_or(Error::NoSharedCipher)?;
        self.conn.suite = Some(suite);
        self.conn.did_resume = true;
        self.transcript
            .start_hash(transcript_hash_for(version, suite));
        debug!("resuming {} session with {}", version, suite.name);

        let client_ems = self.client_hello.offers_extended_master_secret();
        self.conn.extended_master_secret = session.extended_master_secret && client_ems;
        let by_ticket = session.session_id.is_empty()
            || session.session_id != self.client_hello.session_id;
        let alpn = self.select_alpn()?;
        self.conn.alpn_protocol = alpn.clone();

        let echo_id = if by_ticket {
            // Ticket resumption: assign a fresh ID (it never enters a cache).
            Vec::new()
        } else {
            session.session_id.clone()
        };
        self.conn.server_session_id = echo_id.clone();

        self.send_tls12_server_hello(version, suite, echo_id, self.conn.extended_master_secret, by_ticket, &alpn)?;

        let master = session.secret.clone();
        if by_ticket {
            // Refresh the ticket so the abbreviated flight is recognizable.
            self.issue_tls12_ticket(version, suite, &master)?;
        }

        self.install_tls12_keys(suite, version, &master)?;
        self.conn.send_change_cipher_spec()?;
        self.conn.out.change_cipher_spec()?;
        let server_verify = self.send_finished12(suite, version, &master)?;
        self.conn.first_finished = server_verify;
        self.conn.flush()?;
        self.conn.finish_flight();

        self.conn.read_change_cipher_spec()?;
        self.read_finished12(suite, version, &master, true)?;

        self.conn.peer_certificates = session.peer_certificates.clone();
        self.conn.master_secret = master;
        Ok(())
    }

    /// Session-ID then ticket lookup, with the acceptance checks from the
    /// spec: version and suite must still be valid, and client-certificate
    /// requirements must hold.
    fn lookup_tls12_session(&self, version: Version) -> Option<Session> {
        let config = self.config();
        let candidate = if let Some(ticket) = self
            .client_hello
            .session_ticket()
            .filter(|t| !t.is_empty() && config.session_tickets())
        {
            decrypt_ticket(config.ticket_key(), ticket)
        } else if !self.client_hello.session_id.is_empty() {
            config
                .session_cache()?
                .get(&self.client_hello.session_id, SystemTime::now())
        } else {
            None
        };
        let session = candidate?;

        if session.expired(SystemTime::now()) {
            return None;
        }
        if session.version != version {
            trace!("declining resumption: version changed");
            return None;
        }
        // Pre-1.3 the suite may not change, and the client must still
        // offer it.
        if !self.client_hello.cipher_suites.contains(&session.cipher_suite) {
            trace!("declining resumption: suite no longer offered");
            return None;
        }
        let suite = suite_by_id(session.cipher_suite)?;
        if !suite.supports_version(version, self.conn.is_dtls) {
            return None;
        }
        if session.extended_master_secret && !self.client_hello.offers_extended_master_secret() {
            trace!("declining resumption: EMS mismatch");
            return None;
        }
        if config.client_auth() == ClientAuthPolicy::Require
            && session.peer_certificates.is_empty()
        {
            trace!("declining resumption: client certificate required");
            return None;
        }
        Some(session)
    }

    #[allow(clippy::too_many_arguments)]
    fn send_tls12_server_hello(
        &mut self,
        version: Version,
        suite: &'static CipherSuite,
        session_id: Vec<u8>,
        ems: bool,
        ticket: bool,
        alpn: &Option<Vec<u8>>,
    ) -> Result<(), Error> {
        let mut random = [0u8; 32];
        OsRng.fill_bytes(&mut random);
        // Downgrade sentinels: announce when we negotiated below our best.
        if self.config().max_version() >= Version::TLS1_3
            || self.config().knobs().send_downgrade_sentinel
        {
            random[24..].copy_from_slice(&DOWNGRADE_TLS13);
        } else if self.config().max_version() >= Version::TLS1_2 && version < Version::TLS1_2 {
            random[24..].copy_from_slice(&DOWNGRADE_TLS12);
        }
        self.conn.server_random = random;

        let mut extensions = Vec::new();
        if ems {
            extensions.push(Extension::new(ExtensionType::ExtendedMasterSecret, Vec::new()));
        }
        if ticket {
            extensions.push(Extension::new(ExtensionType::SessionTicket, Vec::new()));
        }
        if let Some(protocol) = alpn {
            let mut data = Vec::new();
            serialize_alpn_list(std::slice::from_ref(protocol), &mut data);
            extensions.push(Extension::new(ExtensionType::Alpn, data));
        }
        if suite.is_ecdhe() {
            extensions.push(Extension::new(ExtensionType::EcPointFormats, vec![1, 0]));
        }

        let hello = ServerHello {
            server_version: version.to_wire(self.conn.is_dtls),
            random,
            session_id,
            cipher_suite: suite.id,
            compression_method: CompressionMethod::Null,
            extensions,
        };
        let mut body = Vec::new();
        hello.serialize(&mut body);
        let framed = self.conn.write_handshake_msg(HandshakeType::ServerHello, &body)?;
        self.transcript.add(&framed);
        Ok(())
    }

    /// Credential and suite selection for ≤ 1.2: iterate credentials in
    /// preference order, take the first satisfying every active
    /// constraint, and otherwise report the most specific failure seen.
    fn select_credential_tls12(
        &self,
        version: Version,
    ) -> Result<(&'static CipherSuite, Arc<Credential>, Option<SignatureScheme>), Error> {
        let is_dtls = self.conn.is_dtls;
        let candidate_suites: Vec<&'static CipherSuite> = self
            .config()
            .cipher_suites()
            .iter()
            .filter_map(|id| suite_by_id(*id))
            .filter(|s| {
                !s.is_tls13()
                    && s.supports_version(version, is_dtls)
                    && self.client_hello.cipher_suites.contains(&s.id)
            })
            .collect();
        if candidate_suites.is_empty() {
            return Err(Error::NoSharedCipher);
        }

        let client_groups = self.client_hello.supported_groups();
        let client_schemes = self.client_hello.signature_schemes();

        // Rank failures so the reported error reflects how far selection
        // got: certificate type, then curve, then signature algorithms.
        let mut deepest: (u8, Error) = (0, Error::NoSharedCipher);
        let mut fail = |rank: u8, err: Error, deepest: &mut (u8, Error)| {
            if rank > deepest.0 {
                *deepest = (rank, err);
            }
        };

        for credential in self.config().credentials() {
            for &suite in &candidate_suites {
                let wanted = match suite.kx {
                    KeyExchangeAlgorithm::Rsa | KeyExchangeAlgorithm::EcdheRsa => KeyType::Rsa,
                    KeyExchangeAlgorithm::EcdheEcdsa => KeyType::Ecdsa,
                    KeyExchangeAlgorithm::Tls13 => continue,
                };
                if credential.key_type() != wanted {
                    fail(1, Error::UnknownCertificateType, &mut deepest);
                    continue;
                }
                // Pre-1.3 the certificate curve must be one the client
                // listed.
                if let Some(curve) = credential.curve() {
                    if !client_groups.is_empty() && !client_groups.contains(&curve) {
                        fail(2, Error::WrongCurve, &mut deepest);
                        continue;
                    }
                }
                // Signing suites need a mutually acceptable algorithm.
                let mut scheme = None;
                if suite.is_ecdhe() {
                    if version >= Version::TLS1_2 {
                        let effective = if client_schemes.is_empty() {
                            legacy_default_schemes(credential.key_type())
                        } else {
                            client_schemes.clone()
                        };
                        scheme = credential
                            .supported_schemes(version)
                            .into_iter()
                            .find(|s| effective.contains(s));
                        if scheme.is_none() {
                            fail(3, Error::NoCommonSignatureAlgorithms, &mut deepest);
                            continue;
                        }
                    }
                }
                return Ok((suite, credential.clone(), scheme));
            }
        }
        Err(deepest.1)
    }

    fn process_client_key_exchange(
        &mut self,
        msg: &HandshakeMessage,
        suite: &'static CipherSuite,
        server_offer: Option<EcdheOffer>,
    ) -> Result<Vec<u8>, Error> {
        match suite.kx {
            KeyExchangeAlgorithm::EcdheRsa | KeyExchangeAlgorithm::EcdheEcdsa => {
                let ckx = parse_all(&msg.body, ClientKeyExchange::parse_ecdhe)?;
                let ClientKeyExchange::Ecdhe { public } = ckx else {
                    unreachable!("parse_ecdhe yields Ecdhe");
                };
                let offer = server_offer.ok_or_else(|| {
                    Error::Internal("ClientKeyExchange without a server offer".to_string())
                })?;
                Ok(offer.finish(&public)?.to_vec())
            }
            KeyExchangeAlgorithm::Rsa => {
                let ckx = parse_all(&msg.body, ClientKeyExchange::parse_rsa)?;
                let ClientKeyExchange::Rsa {
                    encrypted_premaster,
                } = ckx
                else {
                    unreachable!("parse_rsa yields Rsa");
                };
                let credential = self
                    .config()
                    .credentials()
                    .iter()
                    .find(|c| c.key_type() == KeyType::Rsa)
                    .cloned()
                    .ok_or_else(|| Error::Internal("RSA suite without RSA key".to_string()))?;
                let key = match &*credential.key {
                    crate::crypto::signing::PrivateKey::Rsa(key) => key.clone(),
                    _ => return Err(Error::Internal("RSA suite without RSA key".to_string())),
                };
                let premaster = rsa_decrypt_premaster(&key, &encrypted_premaster)?;
                // Version check folded into one comparison to avoid a
                // Bleichenbacher-adjacent oracle shape.
                let expected = self.client_hello.client_version.to_be_bytes();
                if premaster.len() != 48 || premaster[..2] != expected {
                    return Err(Error::DecryptError("premaster version".to_string()));
                }
                Ok(premaster.to_vec())
            }
            KeyExchangeAlgorithm::Tls13 => unreachable!("TLS 1.3 suite in 1.2 path"),
        }
    }

    fn install_tls12_keys(
        &mut self,
        suite: &'static CipherSuite,
        version: Version,
        master: &[u8],
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
        let mac_len = suite.mac_len;
        let key_len = suite.key_len;
        let iv_len = suite.fixed_iv_len;
        let (macs, rest) = key_block.split_at(2 * mac_len);
        let (keys, ivs) = rest.split_at(2 * key_len);

        let is_dtls = self.conn.is_dtls;
        let client_state = CipherState::for_suite(
            suite,
            version,
            is_dtls,
            &keys[..key_len],
            &macs[..mac_len],
            &ivs[..iv_len],
        )?;
        let server_state = CipherState::for_suite(
            suite,
            version,
            is_dtls,
            &keys[key_len..],
            &macs[mac_len..],
            &ivs[iv_len..],
        )?;
        // Server writes with the server keys and reads with the client's.
        self.conn.out.prepare_cipher_spec(version, server_state);
        self.conn.r#in.prepare_cipher_spec(version, client_state);
        Ok(())
    }

    fn send_finished12(
        &mut self,
        suite: &'static CipherSuite,
        version: Version,
        master: &[u8],
    ) -> Result<Vec<u8>, Error> {
        let verify_data = prf::finished_verify_data(
            version,
            suite.hash,
            master,
            &self.transcript.current_hash(),
            false,
        )?;
        let mut body = Vec::new();
        Finished {
            verify_data: verify_data.clone(),
        }
        .serialize(&mut body);
        let framed = self.conn.write_handshake_msg(HandshakeType::Finished, &body)?;
        self.transcript.add(&framed);
        Ok(verify_data)
    }

    fn read_finished12(
        &mut self,
        suite: &'static CipherSuite,
        version: Version,
        master: &[u8],
        from_client: bool,
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
            from_client,
        )?;
        if !constant_time_eq(&finished.verify_data, &expected) {
            return Err(Error::BadRecordMac);
        }
        self.transcript.add(&msg.tls_encoding());
        Ok(finished.verify_data)
    }

    fn issue_tls12_ticket(
        &mut self,
        version: Version,
        suite: &'static CipherSuite,
        master: &[u8],
    ) -> Result<Vec<u8>, Error> {
        let session = Session {
            version,
            cipher_suite: suite.id,
            secret: master.to_vec(),
            session_id: Vec::new(),
            ticket: Vec::new(),
            peer_certificates: self.conn.peer_certificates.clone(),
            alpn_protocol: self.conn.alpn_protocol.clone(),
            extended_master_secret: self.conn.extended_master_secret,
            ticket_age_add: 0,
            max_early_data: 0,
            created_unix: SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
            lifetime_secs: DEFAULT_TICKET_LIFETIME.as_secs() as u32,
        };
        let ticket = encrypt_ticket(self.config().ticket_key(), &session)?;
        let nst = NewSessionTicket12 {
            lifetime_hint: DEFAULT_TICKET_LIFETIME.as_secs() as u32,
            ticket: ticket.clone(),
        };
        let mut body = Vec::new();
        nst.serialize(&mut body);
        let framed = self
            .conn
            .write_handshake_msg(HandshakeType::NewSessionTicket, &body)?;
        self.transcript.add(&framed);
        Ok(ticket)
    }

    fn store_tls12_session(
        &self,
        version: Version,
        suite: &'static CipherSuite,
        master: &[u8],
        _ticket: Option<Vec<u8>>,
    ) {
        let Some(cache) = self.config().session_cache() else {
            return;
        };
        if self.conn.server_session_id.is_empty() {
            return;
        }
        let session = Session {
            version,
            cipher_suite: suite.id,
            secret: master.to_vec(),
            session_id: self.conn.server_session_id.clone(),
            ticket: Vec::new(),
            peer_certificates: self.conn.peer_certificates.clone(),
            alpn_protocol: self.conn.alpn_protocol.clone(),
            extended_master_secret: self.conn.extended_master_secret,
            ticket_age_add: 0,
            max_early_data: 0,
            created_unix: SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
            lifetime_secs: DEFAULT_TICKET_LIFETIME.as_secs() as u32,
        };
        cache.put(&self.conn.server_session_id, session);
    }
}

fn transcript_hash_for(version: Version, suite: &CipherSuite) -> HashAlgorithm {
    if version >= Version::TLS1_2 {
        suite.hash
    } else {
        HashAlgorithm::MD5SHA1
    }
}

/// Map a legacy client_version to the best logical version at or below it.
fn legacy_version_floor(wire: u16, is_dtls: bool) -> Option<Version> {
    if let Some(v) = Version::from_wire(wire, is_dtls) {
        return Some(v);
    }
    if is_dtls {
        // DTLS wire versions count down; anything newer than DTLS 1.2 is
        // treated as 1.2.
        if wire <= 0xFEFD {
            return Some(Version::TLS1_2);
        }
        if wire <= 0xFEFF {
            return Some(Version::TLS1_1);
        }
        None
    } else {
        if wire > 0x0303 && wire < 0x1000 {
            return Some(Version::TLS1_2);
        }
        None
    }
}

fn supported_verify_schemes() -> Vec<SignatureScheme> {
    vec![
        SignatureScheme::ECDSA_SECP256R1_SHA256,
        SignatureScheme::ECDSA_SECP384R1_SHA384,
        SignatureScheme::RSA_PSS_RSAE_SHA256,
        SignatureScheme::RSA_PSS_RSAE_SHA384,
    ]
}

fn supported_verify_schemes_tls12() -> Vec<SignatureScheme> {
    vec![
        SignatureScheme::ECDSA_SECP256R1_SHA256,
        SignatureScheme::ECDSA_SECP384R1_SHA384,
        SignatureScheme::RSA_PKCS1_SHA256,
        SignatureScheme::RSA_PKCS1_SHA384,
        SignatureScheme::RSA_PSS_RSAE_SHA256,
    ]
}

fn legacy_default_schemes(key_type: KeyType) -> Vec<SignatureScheme> {
    // RFC 5246 section 7.4.1.4.1: absent signature_algorithms implies
    // SHA-1 with the key's algorithm.
    match key_type {
        KeyType::Rsa => vec![SignatureScheme::RSA_PKCS1_SHA1],
        KeyType::Ecdsa => vec![SignatureScheme::ECDSA_SHA1],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::LengthPrefix;
    use crate::message::extensions::{serialize_named_group_list, serialize_u16_list};
    use crate::suites;
    use std::io;

    #[test]
    fn legacy_version_clamping() {
        assert_eq!(legacy_version_floor(0x0303, false), Some(Version::TLS1_2));
        assert_eq!(legacy_version_floor(0x0301, false), Some(Version::TLS1_0));
        // A hypothetical TLS 1.4 clamps to 1.2.
        assert_eq!(legacy_version_floor(0x0305, false), Some(Version::TLS1_2));
        assert_eq!(legacy_version_floor(0x2000, false), None);
        assert_eq!(legacy_version_floor(0xFEFC, true), Some(Version::TLS1_3));
        assert_eq!(legacy_version_floor(0xFEFF, true), Some(Version::TLS1_1));
    }

    struct NullTransport;

    impl io::Read for NullTransport {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            Ok(0)
        }
    }

    impl io::Write for NullTransport {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn hello(
        cipher_suites: Vec<u16>,
        groups: &[NamedGroup],
        schemes: &[SignatureScheme],
        trust_anchors: &[Vec<u8>],
    ) -> ClientHello {
        let mut extensions = Vec::new();
        if !groups.is_empty() {
            let mut data = Vec::new();
            serialize_named_group_list(groups, &mut data);
            extensions.push(Extension::new(ExtensionType::SupportedGroups, data));
        }
        if !schemes.is_empty() {
            let ids: Vec<u16> = schemes.iter().map(|s| s.as_u16()).collect();
            let mut data = Vec::new();
            serialize_u16_list(&ids, &mut data);
            extensions.push(Extension::new(ExtensionType::SignatureAlgorithms, data));
        }
        if !trust_anchors.is_empty() {
            let mut data = Vec::new();
            let mark = LengthPrefix::u16(&mut data);
            for ca in trust_anchors {
                let m = LengthPrefix::u16(&mut data);
                data.extend_from_slice(ca);
                m.finish(&mut data);
            }
            mark.finish(&mut data);
            extensions.push(Extension::new(ExtensionType::CertificateAuthorities, data));
        }
        ClientHello {
            client_version: 0x0303,
            random: [7; 32],
            session_id: Vec::new(),
            cookie: None,
            cipher_suites,
            compression_methods: vec![CompressionMethod::Null],
            extensions,
        }
    }

    fn server_with_ecdsa_credential() -> (Conn, Vec<u8>) {
        let credential = crate::certificate::generate_self_signed("selection test").unwrap();
        let issuer = credential.issuer_der().unwrap();
        let config = std::sync::Arc::new(Config::builder().credential(credential).build().unwrap());
        (Conn::server(Box::new(NullTransport), config), issuer)
    }

    #[test]
    fn tls13_selection_reports_signature_and_issuer_failures() {
        let (mut conn, issuer) = server_with_ecdsa_credential();
        let mut hs = ServerHandshake::new(&mut conn);

        // RSA-only client schemes against an ECDSA credential.
        hs.client_hello = hello(
            vec![suites::TLS_AES_128_GCM_SHA256],
            &[],
            &[SignatureScheme::RSA_PSS_RSAE_SHA256],
            &[],
        );
        assert!(matches!(
            hs.select_credential_tls13(),
            Err(Error::NoCommonSignatureAlgorithms)
        ));

        // Scheme matches but the trust anchor does not.
        hs.client_hello = hello(
            vec![suites::TLS_AES_128_GCM_SHA256],
            &[],
            &[SignatureScheme::ECDSA_SECP256R1_SHA256],
            &[vec![0x30, 0x00]],
        );
        assert!(matches!(
            hs.select_credential_tls13(),
            Err(Error::NoMatchingIssuer)
        ));

        // Scheme and issuer both match.
        hs.client_hello = hello(
            vec![suites::TLS_AES_128_GCM_SHA256],
            &[],
            &[SignatureScheme::ECDSA_SECP256R1_SHA256],
            &[issuer],
        );
        let (_, scheme) = hs.select_credential_tls13().unwrap();
        assert_eq!(scheme, SignatureScheme::ECDSA_SECP256R1_SHA256);
    }

    #[test]
    fn tls12_selection_constraint_errors() {
        let (mut conn, _) = server_with_ecdsa_credential();
        let mut hs = ServerHandshake::new(&mut conn);

        // No overlap in suites at all.
        hs.client_hello = hello(vec![0x00FF], &[], &[], &[]);
        assert!(matches!(
            hs.select_credential_tls12(Version::TLS1_2),
            Err(Error::NoSharedCipher)
        ));

        // RSA-keyed suites against an ECDSA credential.
        hs.client_hello = hello(
            vec![suites::TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256],
            &[NamedGroup::X25519, NamedGroup::Secp256r1],
            &[SignatureScheme::RSA_PKCS1_SHA256],
            &[],
        );
        assert!(matches!(
            hs.select_credential_tls12(Version::TLS1_2),
            Err(Error::UnknownCertificateType)
        ));

        // ECDSA suite, but the certificate's curve is not in the client's
        // list.
        hs.client_hello = hello(
            vec![suites::TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256],
            &[NamedGroup::Secp384r1],
            &[SignatureScheme::ECDSA_SECP256R1_SHA256],
            &[],
        );
        assert!(matches!(
            hs.select_credential_tls12(Version::TLS1_2),
            Err(Error::WrongCurve)
        ));

        // Curve fine, no shared signature algorithm.
        hs.client_hello = hello(
            vec![suites::TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256],
            &[NamedGroup::Secp256r1],
            &[SignatureScheme::RSA_PKCS1_SHA256],
            &[],
        );
        assert!(matches!(
            hs.select_credential_tls12(Version::TLS1_2),
            Err(Error::NoCommonSignatureAlgorithms)
        ));

        // Everything lines up.
        hs.client_hello = hello(
            vec![suites::TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256],
            &[NamedGroup::Secp256r1],
            &[SignatureScheme::ECDSA_SECP256R1_SHA256],
            &[],
        );
        let (suite, credential, scheme) = hs.select_credential_tls12(Version::TLS1_2).unwrap();
        assert_eq!(suite.id, suites::TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256);
        assert_eq!(credential.key_type(), KeyType::Ecdsa);
        assert_eq!(scheme, Some(SignatureScheme::ECDSA_SECP256R1_SHA256));
    }
}

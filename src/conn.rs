//! The Connection: owns the transport, the two record-layer halves, the
//! DTLS framing state and the negotiated parameters. During the handshake a
//! transient client or server state machine drives it; afterwards only
//! cipher state and negotiated parameters remain live.

use std::io::{Read, Write};
use std::sync::Arc;

use log::{debug, trace, warn};

use crate::config::Config;
use crate::crypto::hkdf;
use crate::crypto::prf;
use crate::dtls::{fragment_message, Assembler, FlightEntry};
use crate::message::{
    parse_tls_handshake, Alert, HandshakeMessage, KeyUpdate, NewSessionTicket13,
};
use crate::record::{HalfConn, DTLS_RECORD_HEADER_LEN, MAX_PLAINTEXT, TLS_RECORD_HEADER_LEN};
use crate::session::Session;
use crate::suites::CipherSuite;
use crate::types::{AlertDescription, AlertLevel, ContentType, HandshakeType, Version};
use crate::Error;

/// Byte transport under a connection. For datagram transports each `write`
/// must send one packet and each `read` must return one whole packet.
pub trait Transport: Read + Write + Send {}

impl<T: Read + Write + Send> Transport for T {}

const MAX_DATAGRAM: usize = 65536;

pub struct Conn {
    transport: Box<dyn Transport>,
    pub(crate) config: Arc<Config>,
    pub(crate) is_client: bool,
    pub(crate) is_dtls: bool,

    // Negotiated parameters; immutable once handshake_complete.
    pub(crate) vers: Option<Version>,
    pub(crate) suite: Option<&'static CipherSuite>,
    pub(crate) handshake_complete: bool,
    pub(crate) did_resume: bool,
    pub(crate) peer_certificates: Vec<Vec<u8>>,
    pub(crate) alpn_protocol: Option<Vec<u8>>,
    pub(crate) extended_master_secret: bool,
    pub(crate) early_data_accepted: bool,
    pub(crate) client_random: [u8; 32],
    pub(crate) server_random: [u8; 32],
    pub(crate) server_session_id: Vec<u8>,
    pub(crate) master_secret: Vec<u8>,
    pub(crate) exporter_secret: Vec<u8>,
    pub(crate) resumption_secret: Vec<u8>,
    pub(crate) first_finished: Vec<u8>,

    handshake_result: Option<Result<(), Error>>,

    pub(crate) r#in: HalfConn,
    pub(crate) out: HalfConn,

    // Stream-transport buffers.
    raw_input: Vec<u8>,
    // Plaintext handshake bytes not yet consumed as messages (TLS).
    hand: Vec<u8>,
    // Application data ready for read().
    input: Vec<u8>,

    pub(crate) skip_early_data: bool,
    pub(crate) early_data_received: Vec<u8>,

    // DTLS state.
    packet_buf: Vec<u8>,
    packet_off: usize,
    pub(crate) send_handshake_seq: u16,
    assembler: Assembler,
    reassembled: Vec<HandshakeMessage>,
    pending_fragments: Vec<Vec<u8>>,
    pending_records: Vec<(bool, Vec<u8>)>,
    pub(crate) current_flight: Vec<FlightEntry>,
    pub(crate) previous_flight: Vec<FlightEntry>,
}

impl Conn {
    /// A TLS client over a stream transport.
    pub fn client(transport: Box<dyn Transport>, config: Arc<Config>) -> Conn {
        Conn::new(transport, config, true, false)
    }

    /// A TLS server over a stream transport.
    pub fn server(transport: Box<dyn Transport>, config: Arc<Config>) -> Conn {
        Conn::new(transport, config, false, false)
    }

    /// A DTLS client over a datagram transport.
    pub fn dtls_client(transport: Box<dyn Transport>, config: Arc<Config>) -> Conn {
        Conn::new(transport, config, true, true)
    }

    /// A DTLS server over a datagram transport.
    pub fn dtls_server(transport: Box<dyn Transport>, config: Arc<Config>) -> Conn {
        Conn::new(transport, config, false, true)
    }

    fn new(transport: Box<dyn Transport>, config: Arc<Config>, is_client: bool, is_dtls: bool) -> Conn {
        let r#in = HalfConn::new(is_dtls);
        let mut out = HalfConn::new(is_dtls);
        if let Some(map) = config.knobs().sequence_number_mapping {
            out.set_seq_map(Some(map));
        }
        Conn {
            transport,
            config,
            is_client,
            is_dtls,
            vers: None,
            suite: None,
            handshake_complete: false,
            did_resume: false,
            peer_certificates: Vec::new(),
            alpn_protocol: None,
            extended_master_secret: false,
            early_data_accepted: false,
            client_random: [0; 32],
            server_random: [0; 32],
            server_session_id: Vec::new(),
            master_secret: Vec::new(),
            exporter_secret: Vec::new(),
            resumption_secret: Vec::new(),
            first_finished: Vec::new(),
            handshake_result: None,
            r#in,
            out,
            raw_input: Vec::new(),
            hand: Vec::new(),
            input: Vec::new(),
            skip_early_data: false,
            early_data_received: Vec::new(),
            packet_buf: Vec::new(),
            packet_off: 0,
            send_handshake_seq: 0,
            assembler: Assembler::new(),
            reassembled: Vec::new(),
            pending_fragments: Vec::new(),
            pending_records: Vec::new(),
            current_flight: Vec::new(),
            previous_flight: Vec::new(),
        }
    }

    // ------------------------------------------------------------------
    // Public surface
    // ------------------------------------------------------------------

    /// Run the handshake. Idempotent: the first call does the work, later
    /// calls return the cached result. Errors are sticky.
    pub fn handshake(&mut self) -> Result<(), Error> {
        if let Some(result) = &self.handshake_result {
            return result.clone();
        }
        let result = if self.is_client {
            crate::client::handshake(self)
        } else {
            crate::server::handshake(self)
        };
        if let Err(err) = &result {
            if let Some((level, desc)) = err.alert() {
                let _ = self.send_alert(level, desc);
            }
            self.r#in.set_error(err.clone());
            self.out.set_error(err.clone());
        } else {
            self.handshake_complete = true;
        }
        self.handshake_result = Some(result.clone());
        result
    }

    pub fn handshake_complete(&self) -> bool {
        self.handshake_complete
    }

    pub fn version(&self) -> Option<Version> {
        self.vers
    }

    pub fn cipher_suite(&self) -> Option<u16> {
        self.suite.map(|s| s.id)
    }

    pub fn did_resume(&self) -> bool {
        self.did_resume
    }

    pub fn peer_certificates(&self) -> &[Vec<u8>] {
        &self.peer_certificates
    }

    pub fn alpn_protocol(&self) -> Option<&[u8]> {
        self.alpn_protocol.as_deref()
    }

    pub fn early_data_accepted(&self) -> bool {
        self.early_data_accepted
    }

    /// Early data received by a server before the handshake finished.
    pub fn early_data_received(&self) -> &[u8] {
        &self.early_data_received
    }

    /// The first Finished verify_data of the handshake ("tls-unique").
    pub fn first_finished(&self) -> &[u8] {
        &self.first_finished
    }

    /// Write application data.
    pub fn write(&mut self, data: &[u8]) -> Result<usize, Error> {
        self.handshake()?;
        self.out.check_error()?;
        for chunk in data.chunks(MAX_PLAINTEXT) {
            let wire = self.record_wire_version();
            let record = self
                .out
                .seal_record(ContentType::ApplicationData, wire, chunk)?;
            self.write_wire(&record)?;
        }
        Ok(data.len())
    }

    /// Read application data into `buf`.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
        self.handshake()?;
        while self.input.is_empty() {
            let (typ, payload) = self.read_one_record(ContentType::ApplicationData)?;
            match typ {
                ContentType::ApplicationData => self.input.extend_from_slice(&payload),
                ContentType::Handshake => self.process_post_handshake_data(&payload)?,
                ContentType::Alert => unreachable!("alerts handled in read_one_record"),
                other => {
                    return Err(self.fatal(Error::UnexpectedMessage(format!(
                        "{} record while reading application data",
                        other
                    ))))
                }
            }
        }
        let n = usize::min(buf.len(), self.input.len());
        buf[..n].copy_from_slice(&self.input[..n]);
        self.input.drain(..n);
        Ok(n)
    }

    /// Send close_notify.
    pub fn send_close_notify(&mut self) -> Result<(), Error> {
        self.send_alert(AlertLevel::Warning, AlertDescription::CloseNotify)
    }

    /// Request a TLS 1.3 key update from the peer and rotate our write keys.
    pub fn send_key_update(&mut self, request_peer: bool) -> Result<(), Error> {
        self.handshake()?;
        if self.vers != Some(Version::TLS1_3) {
            return Err(Error::Internal("KeyUpdate below TLS 1.3".to_string()));
        }
        let mut body = Vec::new();
        KeyUpdate {
            update_requested: request_peer,
        }
        .serialize(&mut body);
        self.write_handshake_msg(HandshakeType::KeyUpdate, &body)?;
        self.flush()?;
        self.out.update_traffic_secret()?;
        Ok(())
    }

    /// RFC 5705 / RFC 8446 exporter.
    pub fn export_keying_material(
        &self,
        label: &[u8],
        context: &[u8],
        len: usize,
    ) -> Result<Vec<u8>, Error> {
        if !self.handshake_complete {
            return Err(Error::Internal("exporter before handshake".to_string()));
        }
        let suite = self
            .suite
            .ok_or_else(|| Error::Internal("exporter without suite".to_string()))?;
        let vers = self
            .vers
            .ok_or_else(|| Error::Internal("exporter without version".to_string()))?;
        if vers >= Version::TLS1_3 {
            let secret = hkdf::derive_secret(
                suite.hash,
                &self.exporter_secret,
                label,
                &crate::crypto::digest(suite.hash, &[]),
                self.is_dtls,
            )?;
            hkdf::hkdf_expand_label(
                suite.hash,
                &secret,
                b"exporter",
                &crate::crypto::digest(suite.hash, context),
                len,
                self.is_dtls,
            )
        } else {
            prf::export_keying_material(
                vers,
                suite.hash,
                &self.master_secret,
                label,
                &self.client_random,
                &self.server_random,
                Some(context),
                len,
            )
        }
    }

    /// Simulated-timeout hook: resend the previous outbound flight. Only
    /// valid while the flight's epoch is still current (pre-CCS flights);
    /// DTLS retransmission here is test-driven, never automatic.
    pub fn retransmit_previous_flight(&mut self) -> Result<(), Error> {
        if !self.is_dtls {
            return Err(Error::Internal("retransmit on stream transport".to_string()));
        }
        let flight = std::mem::take(&mut self.previous_flight);
        for entry in &flight {
            match entry {
                FlightEntry::Handshake {
                    typ,
                    body,
                    message_seq,
                    epoch,
                } => {
                    if *epoch != self.out.epoch() {
                        self.previous_flight = flight;
                        return Err(Error::Internal(
                            "cannot retransmit across epoch change".to_string(),
                        ));
                    }
                    let max_fragment = self.max_fragment_len();
                    for fragment in fragment_message(*typ, body, *message_seq, max_fragment) {
                        self.pending_fragments.push(fragment);
                    }
                }
                FlightEntry::ChangeCipherSpec { epoch } => {
                    let epoch = *epoch;
                    self.previous_flight = flight;
                    return Err(Error::Internal(format!(
                        "cannot retransmit a flight spanning epoch {}",
                        epoch
                    )));
                }
            }
        }
        self.previous_flight = flight;
        self.flush()
    }

    // ------------------------------------------------------------------
    // Record plumbing
    // ------------------------------------------------------------------

    pub(crate) fn record_wire_version(&self) -> u16 {
        match self.vers {
            Some(vers) => vers.record_wire(self.is_dtls),
            None => {
                if self.is_dtls {
                    Version::TLS1_1.to_wire(true)
                } else {
                    Version::TLS1_0.to_wire(false)
                }
            }
        }
    }

    fn write_wire(&mut self, record: &[u8]) -> Result<(), Error> {
        self.transport.write_all(record)?;
        self.transport.flush()?;
        Ok(())
    }

    /// Notify the peer and record a fatal error on both directions.
    pub(crate) fn fatal(&mut self, err: Error) -> Error {
        if let Some((level, desc)) = err.alert() {
            let _ = self.send_alert(level, desc);
        }
        self.r#in.set_error(err.clone());
        self.out.set_error(err.clone());
        err
    }

    pub(crate) fn send_alert(
        &mut self,
        level: AlertLevel,
        description: AlertDescription,
    ) -> Result<(), Error> {
        if self.out.check_error().is_err() && description != AlertDescription::CloseNotify {
            // Direction already poisoned; nothing more to say.
            return Ok(());
        }
        let body = Alert { level, description }.serialize();
        let wire = self.record_wire_version();
        let record = match self.out.seal_record(ContentType::Alert, wire, &body) {
            Ok(record) => record,
            Err(_) => return Ok(()),
        };
        debug!("sending alert {:?}/{}", level, description);
        let _ = self.write_wire(&record);
        Ok(())
    }

    fn fill_raw_input(&mut self, need: usize) -> Result<(), Error> {
        while self.raw_input.len() < need {
            let mut chunk = [0u8; 4096];
            let n = self.transport.read(&mut chunk)?;
            if n == 0 {
                return Err(Error::Transport("unexpected EOF".to_string()));
            }
            self.raw_input.extend_from_slice(&chunk[..n]);
        }
        Ok(())
    }

    /// Read one record from the wire, handling alerts, version checks and
    /// early-data skipping. Returns the decrypted content type and payload;
    /// never returns alert records.
    pub(crate) fn read_one_record(
        &mut self,
        want: ContentType,
    ) -> Result<(ContentType, Vec<u8>), Error> {
        loop {
            let (typ, payload) = if self.is_dtls {
                match self.read_one_record_dtls()? {
                    Some(pair) => pair,
                    None => continue,
                }
            } else {
                match self.read_one_record_tls(want)? {
                    Some(pair) => pair,
                    None => continue,
                }
            };

            match typ {
                ContentType::Alert => {
                    let alert = Alert::parse_body(&payload)
                        .map_err(|e| self.fatal(e))?;
                    match (alert.level, alert.description) {
                        (_, AlertDescription::CloseNotify) => {
                            return Err(self.fatal(Error::CloseNotify));
                        }
                        (AlertLevel::Warning, desc) => {
                            trace!("dropping warning alert: {}", desc);
                            continue;
                        }
                        (_, desc) => {
                            return Err(self.fatal(Error::PeerAlert(desc)));
                        }
                    }
                }
                ContentType::ChangeCipherSpec if self.vers.is_none() && payload == [1] => {
                    // Compatibility CCS arriving before version negotiation
                    // settles (a TLS 1.3 peer around HelloRetryRequest).
                    trace!("ignoring pre-negotiation ChangeCipherSpec");
                    continue;
                }
                ContentType::ApplicationData
                    if self.skip_early_data && !self.r#in.is_encrypting() =>
                {
                    // Plaintext-looking early data after a rejected 0-RTT
                    // offer (HelloRetryRequest path); skip it.
                    trace!("skipping {} bytes of plaintext early data", payload.len());
                    continue;
                }
                _ => {
                    // Any successfully-processed record ends the trial-
                    // decryption window for rejected early data.
                    self.skip_early_data = false;
                    return Ok((typ, payload));
                }
            }
        }
    }

    fn check_record_version(&self, typ: ContentType, wire: u16) -> Result<(), Error> {
        if typ == ContentType::Alert && self.vers.is_none() {
            // Alerts around version negotiation have no well-defined
            // record version.
            return Ok(());
        }
        match self.vers {
            Some(vers) => {
                let expect = vers.record_wire(self.is_dtls);
                if wire != expect {
                    return Err(Error::ProtocolVersion(format!(
                        "record version {:04x}, expected {:04x}",
                        wire, expect
                    )));
                }
            }
            None => {
                let plausible = if self.is_dtls {
                    wire & 0xFF00 == 0xFE00
                } else {
                    wire & 0xFF00 == 0x0300
                };
                if !plausible {
                    return Err(Error::ProtocolVersion(format!(
                        "implausible record version {:04x}",
                        wire
                    )));
                }
            }
        }
        Ok(())
    }

    fn read_one_record_tls(
        &mut self,
        want: ContentType,
    ) -> Result<Option<(ContentType, Vec<u8>)>, Error> {
        self.fill_raw_input(TLS_RECORD_HEADER_LEN)?;
        let typ = ContentType::from_u8(self.raw_input[0]);
        let wire = u16::from_be_bytes([self.raw_input[1], self.raw_input[2]]);
        let len = u16::from_be_bytes([self.raw_input[3], self.raw_input[4]]) as usize;

        if self.vers.is_none() && want == ContentType::Handshake && self.raw_input[0] == 0x80 {
            // SSLv2-style length byte; not something we ever accept.
            return Err(self.fatal(Error::ProtocolVersion(
                "SSLv2-style record".to_string(),
            )));
        }
        if let Err(e) = self.check_record_version(typ, wire) {
            return Err(self.fatal(e));
        }

        self.fill_raw_input(TLS_RECORD_HEADER_LEN + len)?;
        let record: Vec<u8> = self
            .raw_input
            .drain(..TLS_RECORD_HEADER_LEN + len)
            .collect();

        // TLS 1.3 never encrypts ChangeCipherSpec: the compatibility CCS is
        // recognized by its outer type and skipped before any decryption.
        if typ == ContentType::ChangeCipherSpec && self.vers == Some(Version::TLS1_3) {
            if record[TLS_RECORD_HEADER_LEN..] != [1] {
                return Err(self.fatal(Error::UnexpectedMessage(
                    "malformed compatibility ChangeCipherSpec".to_string(),
                )));
            }
            trace!("ignoring compatibility ChangeCipherSpec");
            return Ok(None);
        }

        match self.r#in.open_record(&record) {
            Ok((typ, payload, _)) => Ok(Some((typ, payload))),
            Err(Error::BadRecordMac) if self.skip_early_data => {
                trace!("trial decryption failed; skipping early data record");
                Ok(None)
            }
            Err(err) => Err(self.fatal(err)),
        }
    }

    fn read_one_record_dtls(&mut self) -> Result<Option<(ContentType, Vec<u8>)>, Error> {
        if self.packet_off >= self.packet_buf.len() {
            let mut packet = vec![0u8; MAX_DATAGRAM];
            let n = self.transport.read(&mut packet)?;
            if n == 0 {
                return Err(Error::Transport("unexpected EOF".to_string()));
            }
            packet.truncate(n);
            self.packet_buf = packet;
            self.packet_off = 0;
        }

        let buf = &self.packet_buf[self.packet_off..];
        if buf.len() < DTLS_RECORD_HEADER_LEN {
            self.packet_off = self.packet_buf.len();
            warn!("dropping truncated DTLS record tail ({} bytes)", buf.len());
            return Ok(None);
        }
        let typ = ContentType::from_u8(buf[0]);
        let wire = u16::from_be_bytes([buf[1], buf[2]]);
        if let Err(e) = self.check_record_version(typ, wire) {
            return Err(self.fatal(e));
        }

        if typ == ContentType::ChangeCipherSpec && self.vers == Some(Version::TLS1_3) {
            let len = u16::from_be_bytes([buf[11], buf[12]]) as usize;
            self.packet_off += DTLS_RECORD_HEADER_LEN + len;
            trace!("ignoring compatibility ChangeCipherSpec");
            return Ok(None);
        }

        match self.r#in.open_record(buf) {
            Ok((typ, payload, consumed)) => {
                self.packet_off += consumed;
                Ok(Some((typ, payload)))
            }
            Err(Error::BadRecordMac) if self.skip_early_data => {
                let len = u16::from_be_bytes([buf[11], buf[12]]) as usize;
                self.packet_off += DTLS_RECORD_HEADER_LEN + len;
                trace!("trial decryption failed; skipping early data record");
                Ok(None)
            }
            Err(err) => Err(self.fatal(err)),
        }
    }

    // ------------------------------------------------------------------
    // Handshake message plumbing
    // ------------------------------------------------------------------

    /// Next complete handshake message. Returns the parsed message; the
    /// caller feeds `msg.tls_encoding()` to the transcript.
    pub(crate) fn next_handshake_message(&mut self) -> Result<HandshakeMessage, Error> {
        loop {
            if self.is_dtls {
                if !self.reassembled.is_empty() {
                    return Ok(self.reassembled.remove(0));
                }
            } else if let Some((msg, used)) =
                parse_tls_handshake(&self.hand).map_err(|e| self.fatal(e))?
            {
                self.hand.drain(..used);
                return Ok(msg);
            }

            let (typ, payload) = self.read_one_record(ContentType::Handshake)?;
            match typ {
                ContentType::Handshake => {
                    if self.is_dtls {
                        let mut out = Vec::new();
                        let result = self.assembler.add_record_payload(&payload, &mut out);
                        if let Err(e) = result {
                            return Err(self.fatal(e));
                        }
                        self.reassembled.extend(out);
                    } else {
                        self.hand.extend_from_slice(&payload);
                    }
                }
                other => {
                    return Err(self.fatal(Error::UnexpectedMessage(format!(
                        "{} record while expecting handshake data",
                        other
                    ))))
                }
            }
        }
    }

    /// Server-side 0-RTT: collect early application data until the
    /// client's EndOfEarlyData message completes, and return that message.
    pub(crate) fn read_early_data_until_eoed(
        &mut self,
        max_early_data: usize,
    ) -> Result<HandshakeMessage, Error> {
        loop {
            if self.is_dtls {
                if !self.reassembled.is_empty() {
                    return Ok(self.reassembled.remove(0));
                }
            } else if let Some((msg, used)) =
                parse_tls_handshake(&self.hand).map_err(|e| self.fatal(e))?
            {
                self.hand.drain(..used);
                return Ok(msg);
            }

            let (typ, payload) = self.read_one_record(ContentType::ApplicationData)?;
            match typ {
                ContentType::ApplicationData => {
                    if self.early_data_received.len() + payload.len() > max_early_data {
                        return Err(self.fatal(Error::UnexpectedMessage(
                            "client exceeded the early data limit".to_string(),
                        )));
                    }
                    self.early_data_received.extend_from_slice(&payload);
                }
                ContentType::Handshake => {
                    if self.is_dtls {
                        let mut out = Vec::new();
                        let result = self.assembler.add_record_payload(&payload, &mut out);
                        if let Err(e) = result {
                            return Err(self.fatal(e));
                        }
                        self.reassembled.extend(out);
                    } else {
                        self.hand.extend_from_slice(&payload);
                    }
                }
                other => {
                    return Err(self.fatal(Error::UnexpectedMessage(format!(
                        "{} record during early data",
                        other
                    ))))
                }
            }
        }
    }

    /// Read the peer's ChangeCipherSpec and commit the staged read cipher.
    pub(crate) fn read_change_cipher_spec(&mut self) -> Result<(), Error> {
        if !self.hand.is_empty() || !self.reassembled.is_empty() {
            return Err(self.fatal(Error::UnexpectedMessage(
                "buffered handshake messages on cipher change".to_string(),
            )));
        }
        let (typ, payload) = self.read_one_record(ContentType::ChangeCipherSpec)?;
        if typ != ContentType::ChangeCipherSpec || payload != [1] {
            return Err(self.fatal(Error::UnexpectedMessage(format!(
                "expected ChangeCipherSpec, got {}",
                typ
            ))));
        }
        self.r#in
            .change_cipher_spec()
            .map_err(|e| self.fatal(e))?;
        Ok(())
    }

    /// Serialize and send one handshake message. Returns the TLS-framed
    /// encoding for the transcript. On DTLS the message is fragmented and
    /// queued; `flush` sends it.
    pub(crate) fn write_handshake_msg(
        &mut self,
        typ: HandshakeType,
        body: &[u8],
    ) -> Result<Vec<u8>, Error> {
        let msg = HandshakeMessage::new(typ, body.to_vec());
        let framed = msg.tls_encoding();

        if self.is_dtls {
            let message_seq = self.send_handshake_seq;
            self.send_handshake_seq = self.send_handshake_seq.wrapping_add(1);
            let max_fragment = self.max_fragment_len();
            for fragment in fragment_message(typ, body, message_seq, max_fragment) {
                self.pending_fragments.push(fragment);
            }
            self.current_flight.push(FlightEntry::Handshake {
                typ,
                body: body.to_vec(),
                message_seq,
                epoch: self.out.epoch(),
            });
        } else {
            let wire = self.record_wire_version();
            for chunk in framed.chunks(MAX_PLAINTEXT) {
                let record = self.out.seal_record(ContentType::Handshake, wire, chunk)?;
                self.write_wire(&record)?;
            }
        }
        Ok(framed)
    }

    /// Install a TLS 1.3 write traffic secret. Queued DTLS fragments are
    /// sealed under the old epoch first; the record layer itself commits
    /// immediately (no two-phase ChangeCipherSpec at 1.3).
    pub(crate) fn use_out_traffic_secret(
        &mut self,
        version: Version,
        suite: &'static CipherSuite,
        secret: &[u8],
    ) -> Result<(), Error> {
        if self.is_dtls {
            self.pack_pending_fragments()?;
        }
        self.out.use_traffic_secret(version, suite, secret)
    }

    /// Install a TLS 1.3 read traffic secret. Changing keys with partial
    /// handshake data buffered means messages straddled a key change,
    /// which the protocol forbids.
    pub(crate) fn use_in_traffic_secret(
        &mut self,
        version: Version,
        suite: &'static CipherSuite,
        secret: &[u8],
    ) -> Result<(), Error> {
        if !self.hand.is_empty() {
            return Err(self.fatal(Error::UnexpectedMessage(
                "buffered handshake messages on cipher change".to_string(),
            )));
        }
        self.r#in.use_traffic_secret(version, suite, secret)
    }

    /// Plaintext middlebox-compatibility ChangeCipherSpec (TLS 1.3).
    /// Callers only use this while the write direction is unprotected.
    pub(crate) fn send_compat_ccs(&mut self) -> Result<(), Error> {
        let wire = Version::TLS1_2.to_wire(self.is_dtls);
        let record = self
            .out
            .seal_record(ContentType::ChangeCipherSpec, wire, &[1])?;
        self.write_wire(&record)
    }

    pub(crate) fn write_record_raw(&mut self, record: &[u8]) -> Result<(), Error> {
        self.write_wire(record)
    }

    /// Send ChangeCipherSpec. The caller commits the staged write cipher
    /// (or installs traffic keys) afterwards.
    pub(crate) fn send_change_cipher_spec(&mut self) -> Result<(), Error> {
        let wire = self.record_wire_version();
        if self.is_dtls {
            // Seal everything queued so far under the old epoch first.
            self.pack_pending_fragments()?;
            let record = self.out.seal_record(ContentType::ChangeCipherSpec, wire, &[1])?;
            self.pending_records.push((true, record));
            self.current_flight.push(FlightEntry::ChangeCipherSpec {
                epoch: self.out.epoch(),
            });
        } else {
            let record = self.out.seal_record(ContentType::ChangeCipherSpec, wire, &[1])?;
            self.write_wire(&record)?;
        }
        Ok(())
    }

    fn max_fragment_len(&self) -> usize {
        let budget = self
            .config
            .mtu()
            .saturating_sub(DTLS_RECORD_HEADER_LEN + 64 + crate::message::DTLS_HANDSHAKE_HEADER_LEN);
        let budget = usize::max(budget, 64);
        match self.config.knobs().max_fragment_len {
            Some(cap) => usize::min(cap, budget),
            None => budget,
        }
    }

    /// Pack queued DTLS fragments into sealed records (multiple fragments
    /// may share a record, bounded by the MTU).
    fn pack_pending_fragments(&mut self) -> Result<(), Error> {
        let wire = self.record_wire_version();
        let max_payload = self
            .config
            .mtu()
            .saturating_sub(DTLS_RECORD_HEADER_LEN + 64)
            .max(64);

        let fragments = std::mem::take(&mut self.pending_fragments);
        let mut payload: Vec<u8> = Vec::new();
        for fragment in fragments {
            if !payload.is_empty() && payload.len() + fragment.len() > max_payload {
                let record = self
                    .out
                    .seal_record(ContentType::Handshake, wire, &payload)?;
                self.pending_records.push((false, record));
                payload.clear();
            }
            payload.extend_from_slice(&fragment);
        }
        if !payload.is_empty() {
            let record = self
                .out
                .seal_record(ContentType::Handshake, wire, &payload)?;
            self.pending_records.push((false, record));
        }
        Ok(())
    }

    /// Flush pending outbound handshake data. On DTLS this packs fragments
    /// into records and records into datagrams; ChangeCipherSpec gets its
    /// own datagram unless packing is forced by configuration.
    pub(crate) fn flush(&mut self) -> Result<(), Error> {
        if !self.is_dtls {
            return Ok(());
        }
        self.pack_pending_fragments()?;

        let pack_ccs = self.config.knobs().pack_change_cipher_spec;
        let records = std::mem::take(&mut self.pending_records);
        let mut datagram: Vec<u8> = Vec::new();
        for (is_ccs, record) in records {
            let boundary = !datagram.is_empty()
                && (datagram.len() + record.len() > self.config.mtu()
                    || (is_ccs && !pack_ccs));
            if boundary {
                let full = std::mem::take(&mut datagram);
                self.write_wire(&full)?;
            }
            datagram.extend_from_slice(&record);
            if is_ccs && !pack_ccs {
                let full = std::mem::take(&mut datagram);
                self.write_wire(&full)?;
            }
        }
        if !datagram.is_empty() {
            self.write_wire(&datagram)?;
        }
        Ok(())
    }

    /// Mark the end of an outbound flight for retransmission bookkeeping.
    pub(crate) fn finish_flight(&mut self) {
        if self.is_dtls {
            self.previous_flight = std::mem::take(&mut self.current_flight);
        }
    }

    // ------------------------------------------------------------------
    // Post-handshake messages
    // ------------------------------------------------------------------

    fn process_post_handshake_data(&mut self, payload: &[u8]) -> Result<(), Error> {
        if self.is_dtls {
            let mut out = Vec::new();
            self.assembler
                .add_record_payload(payload, &mut out)
                .map_err(|e| self.fatal(e))?;
            self.reassembled.extend(out);
            while !self.reassembled.is_empty() {
                let msg = self.reassembled.remove(0);
                self.process_post_handshake_message(msg)?;
            }
        } else {
            self.hand.extend_from_slice(payload);
            while let Some((msg, used)) =
                parse_tls_handshake(&self.hand).map_err(|e| self.fatal(e))?
            {
                self.hand.drain(..used);
                self.process_post_handshake_message(msg)?;
            }
        }
        Ok(())
    }

    fn process_post_handshake_message(&mut self, msg: HandshakeMessage) -> Result<(), Error> {
        if self.vers != Some(Version::TLS1_3) {
            return Err(self.fatal(Error::UnexpectedMessage(
                "post-handshake handshake message below TLS 1.3".to_string(),
            )));
        }
        match msg.typ {
            HandshakeType::NewSessionTicket if self.is_client => {
                let ticket = crate::codec::parse_all(&msg.body, NewSessionTicket13::parse)
                    .map_err(|e| self.fatal(e))?;
                self.store_tls13_ticket(&ticket).map_err(|e| self.fatal(e))
            }
            HandshakeType::KeyUpdate => {
                let update = crate::codec::parse_all(&msg.body, KeyUpdate::parse)
                    .map_err(|e| self.fatal(e))?;
                debug!("peer KeyUpdate, update_requested={}", update.update_requested);
                self.r#in
                    .update_traffic_secret()
                    .map_err(|e| self.fatal(e))?;
                if update.update_requested {
                    let mut body = Vec::new();
                    KeyUpdate {
                        update_requested: false,
                    }
                    .serialize(&mut body);
                    self.write_handshake_msg(HandshakeType::KeyUpdate, &body)?;
                    self.flush()?;
                    self.out
                        .update_traffic_secret()
                        .map_err(|e| self.fatal(e))?;
                }
                Ok(())
            }
            other => Err(self.fatal(Error::UnexpectedMessage(format!(
                "post-handshake {:?}",
                other
            )))),
        }
    }

    /// Derive the PSK for a TLS 1.3 ticket and stash the session.
    pub(crate) fn store_tls13_ticket(&mut self, ticket: &NewSessionTicket13) -> Result<(), Error> {
        let suite = self
            .suite
            .ok_or_else(|| Error::Internal("ticket without suite".to_string()))?;
        let psk = hkdf::hkdf_expand_label(
            suite.hash,
            &self.resumption_secret,
            b"resumption",
            &ticket.nonce,
            suite.hash.output_len(),
            self.is_dtls,
        )?;
        let session = Session {
            version: Version::TLS1_3,
            cipher_suite: suite.id,
            secret: psk,
            session_id: Vec::new(),
            ticket: ticket.ticket.clone(),
            peer_certificates: self.peer_certificates.clone(),
            alpn_protocol: self.alpn_protocol.clone(),
            extended_master_secret: false,
            ticket_age_add: ticket.age_add,
            max_early_data: ticket.max_early_data().unwrap_or(0),
            created_unix: std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
            lifetime_secs: ticket.lifetime,
        };
        if let Some(cache) = self.config.session_cache() {
            let key = self.cache_key();
            debug!("storing TLS 1.3 session ({} byte ticket)", session.ticket.len());
            cache.put(&key, session);
        }
        Ok(())
    }

    pub(crate) fn cache_key(&self) -> Vec<u8> {
        self.config
            .server_name()
            .map(|n| n.as_bytes().to_vec())
            .unwrap_or_else(|| b"*".to_vec())
    }
}

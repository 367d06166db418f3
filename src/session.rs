//! Resumption state: sessions, the cross-connection session cache and the
//! self-encrypted ticket envelope.
//!
//! Ticket envelope, bit-exact for compatibility:
//! 16-byte key name ‖ 16-byte IV ‖ AES-128-CTR ciphertext ‖ 32-byte
//! HMAC-SHA256 computed over everything preceding it (key name included).

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use aes::cipher::{KeyIvInit, StreamCipher};
use nom::number::complete::{be_u16, be_u32, be_u64, be_u8};
use nom::IResult;
use rand::rngs::OsRng;
use rand::RngCore;
use zeroize::Zeroize;

use crate::codec::{put_u16, put_u32, put_u8, vec_u16, vec_u24, vec_u8, LengthPrefix};
use crate::crypto::{constant_time_eq, hmac};
use crate::types::{HashAlgorithm, Version};
use crate::Error;

type Aes128Ctr = ctr::Ctr128BE<aes::Aes128>;

const TICKET_KEY_NAME_LEN: usize = 16;
const TICKET_IV_LEN: usize = 16;
const TICKET_MAC_LEN: usize = 32;

pub const DEFAULT_TICKET_LIFETIME: Duration = Duration::from_secs(7 * 24 * 3600);

/// A resumable session, as stored in caches and inside tickets.
///
/// For TLS ≤ 1.2 `secret` is the master secret; for TLS 1.3 it is the
/// fully-derived resumption PSK.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub version: Version,
    pub cipher_suite: u16,
    pub secret: Vec<u8>,
    pub session_id: Vec<u8>,
    pub ticket: Vec<u8>,
    pub peer_certificates: Vec<Vec<u8>>,
    pub alpn_protocol: Option<Vec<u8>>,
    pub extended_master_secret: bool,
    pub ticket_age_add: u32,
    pub max_early_data: u32,
    pub created_unix: u64,
    pub lifetime_secs: u32,
}

impl Drop for Session {
    fn drop(&mut self) {
        self.secret.zeroize();
    }
}

impl Session {
    pub fn expired(&self, now: SystemTime) -> bool {
        let now = now
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
            .as_secs();
        now >= self.created_unix.saturating_add(self.lifetime_secs as u64)
    }

    /// The obfuscated ticket age the client puts into a PSK identity.
    pub fn obfuscated_age(&self, now: SystemTime) -> u32 {
        let now = now
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
            .as_secs();
        let age_ms = now.saturating_sub(self.created_unix).saturating_mul(1000) as u32;
        age_ms.wrapping_add(self.ticket_age_add)
    }

    fn serialize(&self, out: &mut Vec<u8>) {
        put_u16(out, self.version.to_wire(false));
        put_u16(out, self.cipher_suite);
        put_u8(out, self.extended_master_secret as u8);
        let mark = LengthPrefix::u16(out);
        out.extend_from_slice(&self.secret);
        mark.finish(out);
        let mark = LengthPrefix::u8(out);
        out.extend_from_slice(&self.session_id);
        mark.finish(out);
        let mark = LengthPrefix::u24(out);
        for cert in &self.peer_certificates {
            let m = LengthPrefix::u24(out);
            out.extend_from_slice(cert);
            m.finish(out);
        }
        mark.finish(out);
        match &self.alpn_protocol {
            Some(p) => {
                put_u8(out, 1);
                let m = LengthPrefix::u8(out);
                out.extend_from_slice(p);
                m.finish(out);
            }
            None => put_u8(out, 0),
        }
        put_u32(out, self.ticket_age_add);
        put_u32(out, self.max_early_data);
        out.extend_from_slice(&self.created_unix.to_be_bytes());
        put_u32(out, self.lifetime_secs);
    }

    fn parse(input: &[u8]) -> IResult<&[u8], Session> {
        let (input, version_wire) = be_u16(input)?;
        let (input, cipher_suite) = be_u16(input)?;
        let (input, ems) = be_u8(input)?;
        let (input, secret) = vec_u16(input)?;
        let (input, session_id) = vec_u8(input)?;
        let (input, mut cert_block) = vec_u24(input)?;
        let mut peer_certificates = Vec::new();
        while !cert_block.is_empty() {
            let (rest, cert) = vec_u24(cert_block)?;
            peer_certificates.push(cert.to_vec());
            cert_block = rest;
        }
        let (input, has_alpn) = be_u8(input)?;
        let (input, alpn_protocol) = if has_alpn == 1 {
            let (input, p) = vec_u8(input)?;
            (input, Some(p.to_vec()))
        } else {
            (input, None)
        };
        let (input, ticket_age_add) = be_u32(input)?;
        let (input, max_early_data) = be_u32(input)?;
        let (input, created_unix) = be_u64(input)?;
        let (input, lifetime_secs) = be_u32(input)?;

        let version = Version::from_wire(version_wire, false).ok_or(nom::Err::Failure(
            nom::error::Error::new(input, nom::error::ErrorKind::Tag),
        ))?;

        Ok((
            input,
            Session {
                version,
                cipher_suite,
                secret: secret.to_vec(),
                session_id: session_id.to_vec(),
                ticket: Vec::new(),
                peer_certificates,
                alpn_protocol,
                extended_master_secret: ems == 1,
                ticket_age_add,
                max_early_data,
                created_unix,
                lifetime_secs,
            },
        ))
    }
}

/// Key material for the ticket envelope: 16-byte name, 16-byte AES key,
/// 16-byte HMAC key.
#[derive(Clone)]
pub struct TicketKey {
    bytes: [u8; 48],
}

impl TicketKey {
    pub fn new(bytes: [u8; 48]) -> TicketKey {
        TicketKey { bytes }
    }

    pub fn random() -> TicketKey {
        let mut bytes = [0u8; 48];
        OsRng.fill_bytes(&mut bytes);
        TicketKey { bytes }
    }

    fn name(&self) -> &[u8] {
        &self.bytes[..16]
    }

    fn aes_key(&self) -> &[u8] {
        &self.bytes[16..32]
    }

    fn mac_key(&self) -> &[u8] {
        &self.bytes[32..48]
    }
}

/// Seal a session into a ticket.
pub fn encrypt_ticket(key: &TicketKey, session: &Session) -> Result<Vec<u8>, Error> {
    let mut state = Vec::new();
    session.serialize(&mut state);

    let mut iv = [0u8; TICKET_IV_LEN];
    OsRng.fill_bytes(&mut iv);

    let mut out = Vec::with_capacity(TICKET_KEY_NAME_LEN + TICKET_IV_LEN + state.len() + TICKET_MAC_LEN);
    out.extend_from_slice(key.name());
    out.extend_from_slice(&iv);

    let mut ctr = Aes128Ctr::new_from_slices(key.aes_key(), &iv)
        .map_err(|_| Error::Internal("ticket cipher init".to_string()))?;
    ctr.apply_keystream(&mut state);
    out.extend_from_slice(&state);

    let mac = hmac(HashAlgorithm::SHA256, key.mac_key(), &out)?;
    out.extend_from_slice(&mac);
    Ok(out)
}

/// Open a ticket. `None` for anything that does not verify; the MAC is
/// checked before any byte of the ciphertext is interpreted.
pub fn decrypt_ticket(key: &TicketKey, ticket: &[u8]) -> Option<Session> {
    if ticket.len() < TICKET_KEY_NAME_LEN + TICKET_IV_LEN + TICKET_MAC_LEN {
        return None;
    }
    let (body, mac) = ticket.split_at(ticket.len() - TICKET_MAC_LEN);
    if &body[..TICKET_KEY_NAME_LEN] != key.name() {
        return None;
    }
    let expected = hmac(HashAlgorithm::SHA256, key.mac_key(), body).ok()?;
    if !constant_time_eq(mac, &expected) {
        return None;
    }

    let iv = &body[TICKET_KEY_NAME_LEN..TICKET_KEY_NAME_LEN + TICKET_IV_LEN];
    let mut state = body[TICKET_KEY_NAME_LEN + TICKET_IV_LEN..].to_vec();
    let mut ctr = Aes128Ctr::new_from_slices(key.aes_key(), iv).ok()?;
    ctr.apply_keystream(&mut state);

    let (rest, session) = Session::parse(&state).ok()?;
    if !rest.is_empty() {
        return None;
    }
    Some(session)
}

/// Cross-connection session cache: a mutex-guarded map with
/// expiration-on-read. Clients key by server name, servers by session ID.
pub struct SessionCache {
    sessions: Mutex<HashMap<Vec<u8>, Session>>,
}

impl SessionCache {
    pub fn new() -> SessionCache {
        SessionCache {
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn put(&self, key: &[u8], session: Session) {
        self.sessions
            .lock()
            .expect("session cache lock")
            .insert(key.to_vec(), session);
    }

    pub fn get(&self, key: &[u8], now: SystemTime) -> Option<Session> {
        let mut sessions = self.sessions.lock().expect("session cache lock");
        match sessions.get(key) {
            Some(session) if session.expired(now) => {
                sessions.remove(key);
                None
            }
            Some(session) => Some(session.clone()),
            None => None,
        }
    }

    pub fn take(&self, key: &[u8], now: SystemTime) -> Option<Session> {
        let mut sessions = self.sessions.lock().expect("session cache lock");
        let session = sessions.remove(key)?;
        if session.expired(now) {
            return None;
        }
        Some(session)
    }
}

impl Default for SessionCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Session {
        Session {
            version: Version::TLS1_2,
            cipher_suite: 0xC02F,
            secret: vec![0x42; 48],
            session_id: vec![7; 32],
            ticket: Vec::new(),
            peer_certificates: vec![vec![0x30, 0x82]],
            alpn_protocol: Some(b"h2".to_vec()),
            extended_master_secret: true,
            ticket_age_add: 0x1234,
            max_early_data: 0,
            created_unix: 1_700_000_000,
            lifetime_secs: 3600,
        }
    }

    #[test]
    fn ticket_round_trip() {
        let key = TicketKey::random();
        let session = sample();
        let ticket = encrypt_ticket(&key, &session).unwrap();
        assert_eq!(&ticket[..16], key.name());
        let mut opened = decrypt_ticket(&key, &ticket).unwrap();
        opened.ticket = session.ticket.clone();
        assert_eq!(opened, session);
    }

    #[test]
    fn ticket_mac_tamper_rejected() {
        let key = TicketKey::random();
        let mut ticket = encrypt_ticket(&key, &sample()).unwrap();
        let idx = ticket.len() - 1;
        ticket[idx] ^= 1;
        assert!(decrypt_ticket(&key, &ticket).is_none());

        let mut ticket = encrypt_ticket(&key, &sample()).unwrap();
        // Flipping ciphertext must also fail, via the MAC.
        ticket[40] ^= 1;
        assert!(decrypt_ticket(&key, &ticket).is_none());
    }

    #[test]
    fn ticket_wrong_key_rejected() {
        let ticket = encrypt_ticket(&TicketKey::random(), &sample()).unwrap();
        assert!(decrypt_ticket(&TicketKey::random(), &ticket).is_none());
    }

    #[test]
    fn cache_expires_on_read() {
        let cache = SessionCache::new();
        let mut session = sample();
        session.created_unix = 0;
        session.lifetime_secs = 1;
        cache.put(b"host", session);
        assert!(cache.get(b"host", SystemTime::now()).is_none());
        // The expired entry was dropped entirely.
        assert!(cache.get(b"host", UNIX_EPOCH).is_none());
    }

    #[test]
    fn cache_round_trip() {
        let cache = SessionCache::new();
        cache.put(b"host", sample());
        let got = cache.get(b"host", SystemTime::now()).unwrap();
        assert_eq!(got.cipher_suite, 0xC02F);
        assert!(cache.take(b"host", SystemTime::now()).is_some());
        assert!(cache.take(b"host", SystemTime::now()).is_none());
    }

    #[test]
    fn obfuscated_age_wraps_with_age_add() {
        let mut session = sample();
        session.ticket_age_add = u32::MAX;
        let now = UNIX_EPOCH + Duration::from_secs(session.created_unix + 2);
        // 2000ms + u32::MAX wraps.
        assert_eq!(session.obfuscated_age(now), 1999);
    }
}

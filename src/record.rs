//! Record layer: one `HalfConn` per direction.
//!
//! A half-connection owns the active cipher state, the sequence number for
//! its direction and the staged next-epoch state. TLS ≤ 1.2 commits staged
//! state on ChangeCipherSpec (`prepare_cipher_spec` then
//! `change_cipher_spec`); TLS 1.3 installs traffic secrets directly via
//! `use_traffic_secret`. Epoch changes always reset the sequence number;
//! sequence wraparound under one epoch is fatal.
//!
//! Errors are sticky: once a direction fails, every further operation on it
//! returns the stored error.

use rand::rngs::OsRng;
use rand::RngCore;
use zeroize::Zeroize;

use crate::crypto::cipher::{AeadCipher, CbcCipher, StreamState, AEAD_OVERHEAD, CBC_BLOCK_SIZE};
use crate::crypto::{constant_time_eq, hkdf, hmac};
use crate::suites::{CipherSuite, Protection};
use crate::types::{ContentType, HashAlgorithm, Version};
use crate::Error;

pub const MAX_PLAINTEXT: usize = 16384;
pub const MAX_CIPHERTEXT: usize = MAX_PLAINTEXT + 2048;
pub const TLS_RECORD_HEADER_LEN: usize = 5;
pub const DTLS_RECORD_HEADER_LEN: usize = 13;

const MAX_DTLS_SEQ: u64 = (1 << 48) - 1;

/// HMAC-SHA1 record MAC for the MAC-then-encrypt families.
pub struct MacKey {
    key: Vec<u8>,
}

impl Drop for MacKey {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

impl MacKey {
    pub fn new(key: &[u8]) -> MacKey {
        MacKey { key: key.to_vec() }
    }

    pub fn len(&self) -> usize {
        20
    }

    /// MAC input: seq(8) ‖ type(1) ‖ version(2) ‖ length(2) ‖ fragment.
    /// For DTLS the first two seq bytes carry the epoch.
    fn compute(&self, seq: &[u8; 8], typ: ContentType, wire_version: u16, data: &[u8]) -> Vec<u8> {
        let mut input = Vec::with_capacity(13 + data.len());
        input.extend_from_slice(seq);
        input.push(typ.as_u8());
        input.extend_from_slice(&wire_version.to_be_bytes());
        input.extend_from_slice(&(data.len() as u16).to_be_bytes());
        input.extend_from_slice(data);
        hmac(HashAlgorithm::SHA1, &self.key, &input).expect("HMAC-SHA1")
    }
}

/// The active record protection, one variant per cipher family.
pub enum CipherState {
    Null,
    Stream {
        cipher: StreamState,
        mac: MacKey,
    },
    Block {
        cipher: CbcCipher,
        mac: MacKey,
        /// Explicit per-record IV (TLS ≥ 1.1 and all DTLS). When false the
        /// chained IV below carries over between records (TLS 1.0).
        explicit_iv: bool,
        chain_iv: Vec<u8>,
    },
    Aead {
        aead: AeadCipher,
        fixed_iv: Vec<u8>,
        /// 8-byte nonce carried on the wire (TLS 1.2 GCM).
        explicit_nonce: bool,
        /// TLS 1.3 construction: implicit XOR nonce, inner content type.
        tls13: bool,
    },
}

impl CipherState {
    /// Build the record protection for a ≤1.2 suite from key-block material.
    pub fn for_suite(
        suite: &'static CipherSuite,
        version: Version,
        is_dtls: bool,
        key: &[u8],
        mac_key: &[u8],
        iv: &[u8],
    ) -> Result<CipherState, Error> {
        match suite.protection {
            Protection::Rc4Sha1 => Ok(CipherState::Stream {
                cipher: StreamState::new(key)?,
                mac: MacKey::new(mac_key),
            }),
            Protection::AesCbcSha1 => Ok(CipherState::Block {
                cipher: CbcCipher::new(key)?,
                mac: MacKey::new(mac_key),
                explicit_iv: version >= Version::TLS1_1 || is_dtls,
                chain_iv: iv.to_vec(),
            }),
            Protection::AesGcm => Ok(CipherState::Aead {
                aead: AeadCipher::new(Protection::AesGcm, key)?,
                fixed_iv: iv.to_vec(),
                explicit_nonce: true,
                tls13: false,
            }),
            Protection::ChaCha20Poly1305 => Ok(CipherState::Aead {
                aead: AeadCipher::new(Protection::ChaCha20Poly1305, key)?,
                fixed_iv: iv.to_vec(),
                explicit_nonce: false,
                tls13: false,
            }),
        }
    }

    /// Build TLS 1.3 record protection from a traffic secret.
    pub fn for_traffic_secret(
        suite: &'static CipherSuite,
        secret: &[u8],
        is_dtls: bool,
    ) -> Result<CipherState, Error> {
        let (key, iv) = hkdf::traffic_keys(
            suite.hash,
            secret,
            suite.key_len,
            suite.fixed_iv_len,
            is_dtls,
        )?;
        Ok(CipherState::Aead {
            aead: AeadCipher::new(suite.protection, &key)?,
            fixed_iv: iv,
            explicit_nonce: false,
            tls13: true,
        })
    }

}

struct PendingCipherState {
    version: Version,
    cipher: CipherState,
}

/// One direction of the record layer.
pub struct HalfConn {
    is_dtls: bool,
    version: Option<Version>,
    cipher: CipherState,
    epoch: u16,
    /// Out: next sequence to send. In (DTLS): minimum acceptable sequence.
    /// In (TLS): the implicit record counter.
    seq: u64,
    pending: Option<PendingCipherState>,
    /// Sequence counter of epoch 0, preserved across a cipher reset.
    epoch0_seq: u64,
    /// Test knob: remap outgoing record sequence numbers.
    seq_map: Option<fn(u64) -> u64>,
    err: Option<Error>,
    /// Current TLS 1.3 traffic secret, kept for the KeyUpdate ratchet.
    traffic_secret: Vec<u8>,
    suite: Option<&'static CipherSuite>,
}

impl Drop for HalfConn {
    fn drop(&mut self) {
        self.traffic_secret.zeroize();
    }
}

impl HalfConn {
    pub fn new(is_dtls: bool) -> HalfConn {
        HalfConn {
            is_dtls,
            version: None,
            cipher: CipherState::Null,
            epoch: 0,
            seq: 0,
            pending: None,
            epoch0_seq: 0,
            seq_map: None,
            err: None,
            traffic_secret: Vec::new(),
            suite: None,
        }
    }

    pub fn set_seq_map(&mut self, map: Option<fn(u64) -> u64>) {
        self.seq_map = map;
    }

    pub fn epoch(&self) -> u16 {
        self.epoch
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn is_encrypting(&self) -> bool {
        !matches!(self.cipher, CipherState::Null)
    }

    /// Record a permanent error. Every later operation returns it.
    pub fn set_error(&mut self, err: Error) -> Error {
        self.err = Some(err.clone());
        err
    }

    pub fn check_error(&self) -> Result<(), Error> {
        match &self.err {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    /// Stage cipher state for the next ChangeCipherSpec.
    pub fn prepare_cipher_spec(&mut self, version: Version, cipher: CipherState) {
        self.pending = Some(PendingCipherState { version, cipher });
    }

    /// Commit staged cipher state. Committing with nothing staged is a
    /// protocol-state violation.
    pub fn change_cipher_spec(&mut self) -> Result<(), Error> {
        let pending = self.pending.take().ok_or_else(|| {
            Error::UnexpectedMessage("ChangeCipherSpec with no pending cipher".to_string())
        })?;
        self.version = Some(pending.version);
        self.cipher = pending.cipher;
        self.bump_epoch()?;
        Ok(())
    }

    /// TLS 1.3 path: derive and install record protection immediately.
    pub fn use_traffic_secret(
        &mut self,
        version: Version,
        suite: &'static CipherSuite,
        secret: &[u8],
    ) -> Result<(), Error> {
        self.cipher = CipherState::for_traffic_secret(suite, secret, self.is_dtls)?;
        self.version = Some(version);
        self.suite = Some(suite);
        self.traffic_secret.zeroize();
        self.traffic_secret = secret.to_vec();
        self.bump_epoch()?;
        Ok(())
    }

    /// KeyUpdate ratchet: derive the next traffic secret and install it.
    pub fn update_traffic_secret(&mut self) -> Result<(), Error> {
        let suite = self
            .suite
            .ok_or_else(|| Error::Internal("KeyUpdate before traffic keys".to_string()))?;
        let next = hkdf::next_traffic_secret(suite.hash, &self.traffic_secret, self.is_dtls)?;
        let version = self
            .version
            .ok_or_else(|| Error::Internal("KeyUpdate before version".to_string()))?;
        self.use_traffic_secret(version, suite, &next)
    }

    /// Drop back to the null cipher. Used when a HelloRetryRequest voids
    /// already-installed 0-RTT keys and the retry hello must go out in the
    /// clear.
    pub fn reset_cipher(&mut self) {
        self.cipher = CipherState::Null;
        self.epoch = 0;
        self.seq = self.epoch0_seq;
        self.traffic_secret.zeroize();
        self.traffic_secret = Vec::new();
        self.suite = None;
    }

    fn bump_epoch(&mut self) -> Result<(), Error> {
        if self.epoch == 0 {
            self.epoch0_seq = self.seq;
        }
        self.epoch = self
            .epoch
            .checked_add(1)
            .ok_or_else(|| Error::Internal("epoch overflow".to_string()))?;
        self.seq = 0;
        Ok(())
    }

    fn increment_seq(&mut self) -> Result<(), Error> {
        let limit = if self.is_dtls { MAX_DTLS_SEQ } else { u64::MAX };
        if self.seq >= limit {
            return Err(self.set_error(Error::SequenceOverflow));
        }
        self.seq += 1;
        Ok(())
    }

    /// The 8-byte sequence field: epoch ‖ 48-bit counter for DTLS, the
    /// plain 64-bit counter for TLS.
    fn seq_bytes(&self, seq: u64) -> [u8; 8] {
        if self.is_dtls {
            let mut out = [0u8; 8];
            out[..2].copy_from_slice(&self.epoch.to_be_bytes());
            out[2..].copy_from_slice(&seq.to_be_bytes()[2..]);
            out
        } else {
            seq.to_be_bytes()
        }
    }

    fn out_seq(&self) -> u64 {
        match self.seq_map {
            Some(map) if self.is_dtls => map(self.seq) & MAX_DTLS_SEQ,
            Some(map) => map(self.seq),
            None => self.seq,
        }
    }

    fn aead_nonce(fixed_iv: &[u8], seq: &[u8; 8], explicit: Option<&[u8]>) -> [u8; 12] {
        let mut nonce = [0u8; 12];
        match explicit {
            Some(explicit) => {
                // GCM ≤ 1.2: fixed(4) ‖ explicit(8).
                nonce[..4].copy_from_slice(&fixed_iv[..4]);
                nonce[4..].copy_from_slice(explicit);
            }
            None => {
                // Implicit construction: fixed(12) XOR padded sequence.
                nonce.copy_from_slice(fixed_iv);
                for (n, s) in nonce[4..].iter_mut().zip(seq.iter()) {
                    *n ^= s;
                }
            }
        }
        nonce
    }

    /// ≤1.2 AEAD additional data: seq ‖ type ‖ version ‖ plaintext length.
    fn aead_additional_data(
        seq: &[u8; 8],
        typ: ContentType,
        wire_version: u16,
        plaintext_len: usize,
    ) -> Vec<u8> {
        let mut aad = Vec::with_capacity(13);
        aad.extend_from_slice(seq);
        aad.push(typ.as_u8());
        aad.extend_from_slice(&wire_version.to_be_bytes());
        aad.extend_from_slice(&(plaintext_len as u16).to_be_bytes());
        aad
    }

    /// Protect `payload` and return the complete record (header included).
    pub fn seal_record(
        &mut self,
        typ: ContentType,
        wire_version: u16,
        payload: &[u8],
    ) -> Result<Vec<u8>, Error> {
        self.check_error()?;
        if payload.len() > MAX_PLAINTEXT {
            return Err(Error::RecordOverflow);
        }

        let is_dtls = self.is_dtls;
        let seq_bytes = self.seq_bytes(self.out_seq());

        let record = match &mut self.cipher {
            CipherState::Null => {
                let mut record =
                    build_header(is_dtls, typ, wire_version, &seq_bytes, payload.len());
                record.extend_from_slice(payload);
                record
            }
            CipherState::Stream { cipher, mac } => {
                let tag = mac.compute(&seq_bytes, typ, wire_version, payload);
                let mut body = Vec::with_capacity(payload.len() + tag.len());
                body.extend_from_slice(payload);
                body.extend_from_slice(&tag);
                cipher.xor(&mut body);
                let mut record = build_header(is_dtls, typ, wire_version, &seq_bytes, body.len());
                record.extend_from_slice(&body);
                record
            }
            CipherState::Block {
                cipher,
                mac,
                explicit_iv,
                chain_iv,
            } => {
                let tag = mac.compute(&seq_bytes, typ, wire_version, payload);
                let mut content = Vec::with_capacity(payload.len() + tag.len() + CBC_BLOCK_SIZE);
                content.extend_from_slice(payload);
                content.extend_from_slice(&tag);
                let padding_len = CBC_BLOCK_SIZE - content.len() % CBC_BLOCK_SIZE;
                content.resize(content.len() + padding_len, (padding_len - 1) as u8);

                let iv = if *explicit_iv {
                    let mut iv = vec![0u8; CBC_BLOCK_SIZE];
                    OsRng.fill_bytes(&mut iv);
                    iv
                } else {
                    chain_iv.clone()
                };
                cipher.encrypt(&iv, &mut content)?;
                if !*explicit_iv {
                    // TLS 1.0 chains the last ciphertext block as next IV.
                    chain_iv.copy_from_slice(&content[content.len() - CBC_BLOCK_SIZE..]);
                }

                let body_len = if *explicit_iv {
                    iv.len() + content.len()
                } else {
                    content.len()
                };
                let mut record = build_header(is_dtls, typ, wire_version, &seq_bytes, body_len);
                if *explicit_iv {
                    record.extend_from_slice(&iv);
                }
                record.extend_from_slice(&content);
                record
            }
            CipherState::Aead {
                aead,
                fixed_iv,
                explicit_nonce,
                tls13,
            } => {
                if *tls13 {
                    // Inner plaintext: content ‖ real type; outer type is
                    // always application_data.
                    let mut inner = Vec::with_capacity(payload.len() + 1);
                    inner.extend_from_slice(payload);
                    inner.push(typ.as_u8());

                    let body_len = inner.len() + AEAD_OVERHEAD;
                    let header = build_header(
                        is_dtls,
                        ContentType::ApplicationData,
                        wire_version,
                        &seq_bytes,
                        body_len,
                    );
                    let nonce = Self::aead_nonce(fixed_iv, &seq_bytes, None);
                    let sealed = aead.seal(&nonce, &inner, &header);
                    let mut record = header;
                    record.extend_from_slice(&sealed);
                    record
                } else if *explicit_nonce {
                    let nonce = Self::aead_nonce(fixed_iv, &seq_bytes, Some(&seq_bytes));
                    let aad =
                        Self::aead_additional_data(&seq_bytes, typ, wire_version, payload.len());
                    let sealed = aead.seal(&nonce, payload, &aad);
                    let mut record =
                        build_header(is_dtls, typ, wire_version, &seq_bytes, 8 + sealed.len());
                    record.extend_from_slice(&seq_bytes);
                    record.extend_from_slice(&sealed);
                    record
                } else {
                    let nonce = Self::aead_nonce(fixed_iv, &seq_bytes, None);
                    let aad =
                        Self::aead_additional_data(&seq_bytes, typ, wire_version, payload.len());
                    let sealed = aead.seal(&nonce, payload, &aad);
                    let mut record =
                        build_header(is_dtls, typ, wire_version, &seq_bytes, sealed.len());
                    record.extend_from_slice(&sealed);
                    record
                }
            }
        };

        if record.len() > MAX_CIPHERTEXT + DTLS_RECORD_HEADER_LEN {
            return Err(Error::RecordOverflow);
        }
        self.increment_seq()?;
        Ok(record)
    }

    /// Parse and unprotect one record from the front of `buf`. Returns the
    /// real content type, the plaintext and the bytes consumed.
    pub fn open_record(&mut self, buf: &[u8]) -> Result<(ContentType, Vec<u8>, usize), Error> {
        self.check_error()?;

        let header_len = if self.is_dtls {
            DTLS_RECORD_HEADER_LEN
        } else {
            TLS_RECORD_HEADER_LEN
        };
        if buf.len() < header_len {
            return Err(Error::Decode("truncated record header".to_string()));
        }
        let typ = ContentType::from_u8(buf[0]);
        let wire_version = u16::from_be_bytes([buf[1], buf[2]]);
        let (record_seq, len_at) = if self.is_dtls {
            let epoch = u16::from_be_bytes([buf[3], buf[4]]);
            if epoch != self.epoch {
                return Err(Error::UnexpectedMessage(format!(
                    "record epoch {} != current {}",
                    epoch, self.epoch
                )));
            }
            let mut seq8 = [0u8; 8];
            seq8[2..].copy_from_slice(&buf[5..11]);
            (u64::from_be_bytes(seq8), 11)
        } else {
            (self.seq, 3)
        };
        let body_len = u16::from_be_bytes([buf[len_at], buf[len_at + 1]]) as usize;
        if body_len > MAX_CIPHERTEXT {
            return Err(Error::RecordOverflow);
        }
        if buf.len() < header_len + body_len {
            return Err(Error::Decode("truncated record body".to_string()));
        }

        if self.is_dtls && record_seq < self.seq {
            return Err(Error::UnexpectedMessage(format!(
                "record sequence {} below minimum {}",
                record_seq, self.seq
            )));
        }

        let header = &buf[..header_len];
        let body = &buf[header_len..header_len + body_len];
        let consumed = header_len + body_len;

        let seq_bytes = self.seq_bytes(record_seq);
        let (typ, plaintext) = self.unprotect(typ, wire_version, header, body, &seq_bytes)?;
        if plaintext.len() > MAX_PLAINTEXT {
            return Err(Error::RecordOverflow);
        }

        if self.is_dtls {
            self.seq = record_seq;
        }
        self.increment_seq()?;
        Ok((typ, plaintext, consumed))
    }

    fn unprotect(
        &mut self,
        typ: ContentType,
        wire_version: u16,
        header: &[u8],
        body: &[u8],
        seq_bytes: &[u8; 8],
    ) -> Result<(ContentType, Vec<u8>), Error> {
        match &mut self.cipher {
            CipherState::Null => Ok((typ, body.to_vec())),
            CipherState::Stream { cipher, mac } => {
                let mut payload = body.to_vec();
                cipher.xor(&mut payload);
                if payload.len() < mac.len() {
                    return Err(Error::BadRecordMac);
                }
                let split = payload.len() - mac.len();
                let received = payload.split_off(split);
                let expected = mac.compute(seq_bytes, typ, wire_version, &payload);
                if !constant_time_eq(&received, &expected) {
                    return Err(Error::BadRecordMac);
                }
                Ok((typ, payload))
            }
            CipherState::Block {
                cipher,
                mac,
                explicit_iv,
                chain_iv,
            } => {
                let iv_len = if *explicit_iv { CBC_BLOCK_SIZE } else { 0 };
                let min = iv_len + round_up(mac.len() + 1, CBC_BLOCK_SIZE);
                if body.len() < min || (body.len() - iv_len) % CBC_BLOCK_SIZE != 0 {
                    return Err(Error::BadRecordMac);
                }

                let (iv, mut payload) = if *explicit_iv {
                    (body[..iv_len].to_vec(), body[iv_len..].to_vec())
                } else {
                    (chain_iv.clone(), body.to_vec())
                };
                if !*explicit_iv {
                    chain_iv.copy_from_slice(&body[body.len() - CBC_BLOCK_SIZE..]);
                }
                cipher.decrypt(&iv, &mut payload)?;

                let (unpadded_len, padding_good) = remove_padding(&payload);
                payload.truncate(unpadded_len);

                if payload.len() < mac.len() {
                    return Err(Error::BadRecordMac);
                }
                let split = payload.len() - mac.len();
                let received = payload.split_off(split);
                let expected = mac.compute(seq_bytes, typ, wire_version, &payload);

                // Padding failure and MAC failure must be indistinguishable.
                if !constant_time_eq(&received, &expected) || padding_good != 255 {
                    return Err(Error::BadRecordMac);
                }
                Ok((typ, payload))
            }
            CipherState::Aead {
                aead,
                fixed_iv,
                explicit_nonce,
                tls13,
            } => {
                if *tls13 {
                    let nonce = Self::aead_nonce(fixed_iv, seq_bytes, None);
                    let inner = aead.open(&nonce, body, header)?;

                    // Strip zero padding; the last non-zero byte is the type.
                    let mut end = inner.len();
                    while end > 0 && inner[end - 1] == 0 {
                        end -= 1;
                    }
                    if end == 0 {
                        return Err(Error::UnexpectedMessage(
                            "record with no content type".to_string(),
                        ));
                    }
                    let real_typ = ContentType::from_u8(inner[end - 1]);
                    Ok((real_typ, inner[..end - 1].to_vec()))
                } else if *explicit_nonce {
                    if body.len() < 8 {
                        return Err(Error::BadRecordMac);
                    }
                    let (explicit, ciphertext) = body.split_at(8);
                    let nonce = Self::aead_nonce(fixed_iv, seq_bytes, Some(explicit));
                    if ciphertext.len() < AEAD_OVERHEAD {
                        return Err(Error::BadRecordMac);
                    }
                    let aad = Self::aead_additional_data(
                        seq_bytes,
                        typ,
                        wire_version,
                        ciphertext.len() - AEAD_OVERHEAD,
                    );
                    let plaintext = aead.open(&nonce, ciphertext, &aad)?;
                    Ok((typ, plaintext))
                } else {
                    let nonce = Self::aead_nonce(fixed_iv, seq_bytes, None);
                    if body.len() < AEAD_OVERHEAD {
                        return Err(Error::BadRecordMac);
                    }
                    let aad = Self::aead_additional_data(
                        seq_bytes,
                        typ,
                        wire_version,
                        body.len() - AEAD_OVERHEAD,
                    );
                    let plaintext = aead.open(&nonce, body, &aad)?;
                    Ok((typ, plaintext))
                }
            }
        }
    }
}

fn build_header(
    is_dtls: bool,
    typ: ContentType,
    wire_version: u16,
    seq_bytes: &[u8; 8],
    body_len: usize,
) -> Vec<u8> {
    let mut header = Vec::with_capacity(DTLS_RECORD_HEADER_LEN);
    header.push(typ.as_u8());
    header.extend_from_slice(&wire_version.to_be_bytes());
    if is_dtls {
        header.extend_from_slice(seq_bytes);
    }
    header.extend_from_slice(&(body_len as u16).to_be_bytes());
    header
}

fn round_up(a: usize, b: usize) -> usize {
    a + (b - a % b) % b
}

/// Strip CBC padding in constant time. Returns the unpadded length and a
/// validity byte that is 255 for good padding and 0 otherwise; the caller
/// folds the byte into the MAC check so both failures look identical.
fn remove_padding(payload: &[u8]) -> (usize, u8) {
    if payload.is_empty() {
        return (0, 0);
    }

    let padding_len = payload[payload.len() - 1];
    let t = ((payload.len() - 1) as u32).wrapping_sub(padding_len as u32);
    // MSB of t is zero when padding_len <= len-1.
    let mut good = ((!t as i32) >> 31) as u8;

    let to_check = usize::min(255, payload.len() - 1);
    for i in 0..to_check {
        let t = (padding_len as u32).wrapping_sub(i as u32);
        // MSB of t is zero when i <= padding_len.
        let mask = ((!t as i32) >> 31) as u8;
        let b = payload[payload.len() - 1 - i];
        good &= !((mask & padding_len) ^ (mask & b));
    }

    good &= good << 4;
    good &= good << 2;
    good &= good << 1;
    good = ((good as i8) >> 7) as u8;

    let to_remove = (good & padding_len) as usize + 1;
    (payload.len() - to_remove, good)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::suites::{
        suite_by_id, TLS_AES_128_GCM_SHA256, TLS_ECDHE_RSA_WITH_AES_128_CBC_SHA,
        TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256, TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256,
        TLS_RSA_WITH_RC4_128_SHA,
    };

    fn paired(suite_id: u16, version: Version, is_dtls: bool) -> (HalfConn, HalfConn) {
        let suite = suite_by_id(suite_id).unwrap();
        let mut writer = HalfConn::new(is_dtls);
        let mut reader = HalfConn::new(is_dtls);
        if suite.is_tls13() {
            let secret = vec![0x42; suite.hash.output_len()];
            writer
                .use_traffic_secret(version, suite, &secret)
                .unwrap();
            reader
                .use_traffic_secret(version, suite, &secret)
                .unwrap();
        } else {
            let key = vec![0x11; suite.key_len];
            let mac = vec![0x22; suite.mac_len];
            let iv = vec![0x33; suite.fixed_iv_len];
            for hc in [&mut writer, &mut reader] {
                let state =
                    CipherState::for_suite(suite, version, is_dtls, &key, &mac, &iv).unwrap();
                hc.prepare_cipher_spec(version, state);
                hc.change_cipher_spec().unwrap();
            }
        }
        (writer, reader)
    }

    fn round_trip(suite_id: u16, version: Version, is_dtls: bool) {
        let (mut writer, mut reader) = paired(suite_id, version, is_dtls);
        let wire = version.record_wire(is_dtls);
        for payload_len in [0usize, 1, 320, MAX_PLAINTEXT] {
            let payload = vec![0x5A; payload_len];
            let record = writer
                .seal_record(ContentType::ApplicationData, wire, &payload)
                .unwrap();
            let (typ, plaintext, consumed) = reader.open_record(&record).unwrap();
            assert_eq!(consumed, record.len());
            assert_eq!(typ, ContentType::ApplicationData);
            assert_eq!(plaintext, payload, "suite {:04x} len {}", suite_id, payload_len);
        }
    }

    #[test]
    fn round_trip_stream() {
        round_trip(TLS_RSA_WITH_RC4_128_SHA, Version::TLS1_0, false);
        round_trip(TLS_RSA_WITH_RC4_128_SHA, Version::TLS1_2, false);
    }

    #[test]
    fn round_trip_cbc_implicit_and_explicit_iv() {
        round_trip(TLS_ECDHE_RSA_WITH_AES_128_CBC_SHA, Version::TLS1_0, false);
        round_trip(TLS_ECDHE_RSA_WITH_AES_128_CBC_SHA, Version::TLS1_1, false);
        round_trip(TLS_ECDHE_RSA_WITH_AES_128_CBC_SHA, Version::TLS1_2, false);
        round_trip(TLS_ECDHE_RSA_WITH_AES_128_CBC_SHA, Version::TLS1_2, true);
    }

    #[test]
    fn round_trip_aead_explicit_nonce() {
        round_trip(TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256, Version::TLS1_2, false);
        round_trip(TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256, Version::TLS1_2, true);
    }

    #[test]
    fn round_trip_aead_implicit_nonce() {
        round_trip(
            TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256,
            Version::TLS1_2,
            false,
        );
        round_trip(TLS_AES_128_GCM_SHA256, Version::TLS1_3, false);
        round_trip(TLS_AES_128_GCM_SHA256, Version::TLS1_3, true);
    }

    #[test]
    fn tls13_hides_content_type() {
        let (mut writer, mut reader) = paired(TLS_AES_128_GCM_SHA256, Version::TLS1_3, false);
        let record = writer
            .seal_record(ContentType::Handshake, 0x0303, b"finished-ish")
            .unwrap();
        // Outer type is application_data.
        assert_eq!(record[0], 23);
        let (typ, plaintext, _) = reader.open_record(&record).unwrap();
        assert_eq!(typ, ContentType::Handshake);
        assert_eq!(plaintext, b"finished-ish");
    }

    #[test]
    fn tls13_all_zero_plaintext_rejected() {
        let suite = suite_by_id(TLS_AES_128_GCM_SHA256).unwrap();
        let secret = vec![0x42; 32];
        let mut reader = HalfConn::new(false);
        reader
            .use_traffic_secret(Version::TLS1_3, suite, &secret)
            .unwrap();

        // Hand-seal a record whose inner plaintext is all zeros.
        let state = CipherState::for_traffic_secret(suite, &secret, false).unwrap();
        let (aead, fixed_iv) = match state {
            CipherState::Aead { aead, fixed_iv, .. } => (aead, fixed_iv),
            _ => unreachable!(),
        };
        let inner = vec![0u8; 5];
        let mut header = vec![23, 0x03, 0x03];
        header.extend_from_slice(&((inner.len() + AEAD_OVERHEAD) as u16).to_be_bytes());
        let nonce = HalfConn::aead_nonce(&fixed_iv, &[0u8; 8], None);
        let sealed = aead.seal(&nonce, &inner, &header);
        let mut record = header;
        record.extend_from_slice(&sealed);

        let err = reader.open_record(&record).unwrap_err();
        assert!(matches!(err, Error::UnexpectedMessage(_)));
    }

    #[test]
    fn sequence_increments_and_epoch_resets() {
        let (mut writer, _) = paired(TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256, Version::TLS1_2, false);
        assert_eq!(writer.seq(), 0);
        for i in 1..=3u64 {
            writer
                .seal_record(ContentType::ApplicationData, 0x0303, b"x")
                .unwrap();
            assert_eq!(writer.seq(), i);
        }
        let suite = suite_by_id(TLS_AES_128_GCM_SHA256).unwrap();
        writer
            .use_traffic_secret(Version::TLS1_3, suite, &[0x9; 32])
            .unwrap();
        assert_eq!(writer.seq(), 0);
        assert_eq!(writer.epoch(), 2);
    }

    #[test]
    fn change_cipher_spec_requires_pending() {
        let mut hc = HalfConn::new(false);
        assert!(matches!(
            hc.change_cipher_spec(),
            Err(Error::UnexpectedMessage(_))
        ));
    }

    #[test]
    fn tampered_records_fail_uniformly() {
        for suite_id in [
            TLS_ECDHE_RSA_WITH_AES_128_CBC_SHA,
            TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256,
            TLS_RSA_WITH_RC4_128_SHA,
        ] {
            let (mut writer, mut reader) = paired(suite_id, Version::TLS1_2, false);
            let mut record = writer
                .seal_record(ContentType::ApplicationData, 0x0303, b"payload bytes!")
                .unwrap();
            let last = record.len() - 1;
            record[last] ^= 0x40;
            assert_eq!(
                reader.open_record(&record).unwrap_err(),
                Error::BadRecordMac,
                "suite {:04x}",
                suite_id
            );
        }
    }

    #[test]
    fn remove_padding_all_lengths() {
        // For a fixed-size record, every valid padding length must be
        // accepted and every corrupted one rejected, with validity visible
        // only through the returned byte.
        for pad in 0u8..=15 {
            let mut payload = vec![0xAB; 48 - pad as usize - 1];
            payload.extend(std::iter::repeat(pad).take(pad as usize + 1));
            let (len, good) = remove_padding(&payload);
            assert_eq!(good, 255, "pad {}", pad);
            assert_eq!(len, 48 - pad as usize - 1);
        }
        for pad in 1u8..=15 {
            let mut payload = vec![0xAB; 48 - pad as usize - 1];
            payload.extend(std::iter::repeat(pad).take(pad as usize + 1));
            // Corrupt one padding byte (not the length byte).
            let idx = payload.len() - 2;
            payload[idx] ^= 0xFF;
            let (_, good) = remove_padding(&payload);
            assert_eq!(good, 0, "pad {}", pad);
        }
        // Padding length exceeding the record is invalid.
        let (_, good) = remove_padding(&[200u8; 4]);
        assert_eq!(good, 0);
    }

    #[test]
    fn dtls_rejects_wrong_epoch_and_replay() {
        let (mut writer, mut reader) = paired(
            TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256,
            Version::TLS1_2,
            true,
        );
        let wire = Version::TLS1_2.record_wire(true);
        let r1 = writer
            .seal_record(ContentType::ApplicationData, wire, b"one")
            .unwrap();
        let r2 = writer
            .seal_record(ContentType::ApplicationData, wire, b"two")
            .unwrap();
        reader.open_record(&r1).unwrap();
        reader.open_record(&r2).unwrap();
        // Replaying r1 violates forward progress.
        assert!(matches!(
            reader.open_record(&r1),
            Err(Error::UnexpectedMessage(_))
        ));
    }

    #[test]
    fn dtls_sequence_remap_applies_to_output() {
        let (mut writer, _) = paired(
            TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256,
            Version::TLS1_2,
            true,
        );
        writer.set_seq_map(Some(|seq| seq + 100));
        let wire = Version::TLS1_2.record_wire(true);
        let record = writer
            .seal_record(ContentType::ApplicationData, wire, b"x")
            .unwrap();
        let mut seq8 = [0u8; 8];
        seq8[2..].copy_from_slice(&record[5..11]);
        assert_eq!(u64::from_be_bytes(seq8), 100);
    }

    #[test]
    fn sticky_errors() {
        let mut hc = HalfConn::new(false);
        hc.set_error(Error::BadRecordMac);
        assert_eq!(
            hc.seal_record(ContentType::Alert, 0x0303, b"").unwrap_err(),
            Error::BadRecordMac
        );
        assert_eq!(hc.open_record(&[0; 16]).unwrap_err(), Error::BadRecordMac);
    }
}

//! HKDF and the TLS 1.3 key schedule (RFC 8446 section 7.1).
//!
//! ```text
//!              0
//!              |
//!    PSK ->  HKDF-Extract = Early Secret
//!              |
//!              +--> Derive-Secret(., "ext binder" | "res binder", "")
//!              +--> Derive-Secret(., "c e traffic", ClientHello)
//!              v
//!        Derive-Secret(., "derived", "")
//!              |
//!    (EC)DHE -> HKDF-Extract = Handshake Secret
//!              +--> "c hs traffic" / "s hs traffic"
//!              v
//!        Derive-Secret(., "derived", "")
//!              |
//!    0 -> HKDF-Extract = Master Secret
//!              +--> "c ap traffic" / "s ap traffic" / "exp master" / "res master"
//! ```
//!
//! DTLS 1.3 uses the label prefix "dtls13" where TLS 1.3 uses "tls13 ".

use hmac::Mac;
use zeroize::Zeroize;

use crate::types::HashAlgorithm;
use crate::Error;

use super::hmac as hmac_oneshot;

/// HKDF-Extract(salt, ikm).
pub fn hkdf_extract(hash: HashAlgorithm, salt: &[u8], ikm: &[u8]) -> Result<Vec<u8>, Error> {
    let salt = if salt.is_empty() {
        vec![0u8; hash.output_len()]
    } else {
        salt.to_vec()
    };
    hmac_oneshot(hash, &salt, ikm)
}

/// HKDF-Expand(prk, info, len).
pub fn hkdf_expand(
    hash: HashAlgorithm,
    prk: &[u8],
    info: &[u8],
    out_len: usize,
) -> Result<Vec<u8>, Error> {
    fn run<M>(prk: &[u8], info: &[u8], out_len: usize) -> Result<Vec<u8>, Error>
    where
        M: Mac + hmac::digest::KeyInit,
    {
        let mut out = Vec::with_capacity(out_len);
        let mut block: Vec<u8> = Vec::new();
        let mut counter = 1u8;
        while out.len() < out_len {
            let mut mac = <M as hmac::digest::KeyInit>::new_from_slice(prk)
                .map_err(|_| Error::Internal("invalid HKDF prk".to_string()))?;
            mac.update(&block);
            mac.update(info);
            mac.update(&[counter]);
            block = mac.finalize().into_bytes().to_vec();
            let take = usize::min(out_len - out.len(), block.len());
            out.extend_from_slice(&block[..take]);
            counter = counter
                .checked_add(1)
                .ok_or_else(|| Error::Internal("HKDF output too long".to_string()))?;
        }
        Ok(out)
    }
    match hash {
        HashAlgorithm::SHA256 => run::<super::HmacSha256>(prk, info, out_len),
        HashAlgorithm::SHA384 => run::<super::HmacSha384>(prk, info, out_len),
        other => Err(Error::Internal(format!("HKDF over {:?}", other))),
    }
}

/// HKDF-Expand-Label(secret, label, context, len).
pub fn hkdf_expand_label(
    hash: HashAlgorithm,
    secret: &[u8],
    label: &[u8],
    context: &[u8],
    out_len: usize,
    is_dtls: bool,
) -> Result<Vec<u8>, Error> {
    let prefix: &[u8] = if is_dtls { b"dtls13" } else { b"tls13 " };
    let mut info = Vec::with_capacity(4 + prefix.len() + label.len() + context.len());
    info.extend_from_slice(&(out_len as u16).to_be_bytes());
    info.push((prefix.len() + label.len()) as u8);
    info.extend_from_slice(prefix);
    info.extend_from_slice(label);
    info.push(context.len() as u8);
    info.extend_from_slice(context);
    hkdf_expand(hash, secret, &info, out_len)
}

/// Derive-Secret(secret, label, transcript_hash).
pub fn derive_secret(
    hash: HashAlgorithm,
    secret: &[u8],
    label: &[u8],
    transcript_hash: &[u8],
    is_dtls: bool,
) -> Result<Vec<u8>, Error> {
    hkdf_expand_label(
        hash,
        secret,
        label,
        transcript_hash,
        hash.output_len(),
        is_dtls,
    )
}

/// Traffic key + IV for a traffic secret.
pub fn traffic_keys(
    hash: HashAlgorithm,
    secret: &[u8],
    key_len: usize,
    iv_len: usize,
    is_dtls: bool,
) -> Result<(Vec<u8>, Vec<u8>), Error> {
    let key = hkdf_expand_label(hash, secret, b"key", &[], key_len, is_dtls)?;
    let iv = hkdf_expand_label(hash, secret, b"iv", &[], iv_len, is_dtls)?;
    Ok((key, iv))
}

/// finished_key = HKDF-Expand-Label(base, "finished", "", H.len);
/// verify_data = HMAC(finished_key, transcript_hash).
pub fn finished_mac(
    hash: HashAlgorithm,
    base_secret: &[u8],
    transcript_hash: &[u8],
    is_dtls: bool,
) -> Result<Vec<u8>, Error> {
    let finished_key =
        hkdf_expand_label(hash, base_secret, b"finished", &[], hash.output_len(), is_dtls)?;
    hmac_oneshot(hash, &finished_key, transcript_hash)
}

/// application_traffic_secret_N+1 from N (KeyUpdate ratchet).
pub fn next_traffic_secret(
    hash: HashAlgorithm,
    current: &[u8],
    is_dtls: bool,
) -> Result<Vec<u8>, Error> {
    hkdf_expand_label(hash, current, b"traffic upd", &[], hash.output_len(), is_dtls)
}

/// The running TLS 1.3 key schedule: one HKDF-Extract chain per connection.
pub struct KeySchedule {
    hash: HashAlgorithm,
    is_dtls: bool,
    secret: Vec<u8>,
}

impl Drop for KeySchedule {
    fn drop(&mut self) {
        self.secret.zeroize();
    }
}

impl KeySchedule {
    /// Early Secret = HKDF-Extract(0, PSK or zeros).
    pub fn new(hash: HashAlgorithm, is_dtls: bool, psk: Option<&[u8]>) -> Result<Self, Error> {
        let zeros = vec![0u8; hash.output_len()];
        let ikm = psk.unwrap_or(&zeros);
        let secret = hkdf_extract(hash, &[], ikm)?;
        Ok(KeySchedule {
            hash,
            is_dtls,
            secret,
        })
    }

    pub fn hash(&self) -> HashAlgorithm {
        self.hash
    }

    /// Derive-Secret from the current extract stage.
    pub fn derive(&self, label: &[u8], transcript_hash: &[u8]) -> Result<Vec<u8>, Error> {
        derive_secret(self.hash, &self.secret, label, transcript_hash, self.is_dtls)
    }

    /// Move to the next extract stage: Derive-Secret(., "derived", "") then
    /// HKDF-Extract with `ikm` (the ECDHE secret, or zeros for the final
    /// master step).
    pub fn advance(&mut self, ikm: Option<&[u8]>) -> Result<(), Error> {
        let empty_hash = super::digest(self.hash, &[]);
        let derived = derive_secret(self.hash, &self.secret, b"derived", &empty_hash, self.is_dtls)?;
        let zeros = vec![0u8; self.hash.output_len()];
        let ikm = ikm.unwrap_or(&zeros);
        let next = hkdf_extract(self.hash, &derived, ikm)?;
        self.secret.zeroize();
        self.secret = next;
        Ok(())
    }

    /// PSK binder key ("ext binder" or "res binder") from the early secret.
    pub fn binder_key(&self, external: bool) -> Result<Vec<u8>, Error> {
        let label: &[u8] = if external { b"ext binder" } else { b"res binder" };
        let empty_hash = super::digest(self.hash, &[]);
        self.derive(label, &empty_hash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hex(s: &str) -> Vec<u8> {
        (0..s.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&s[i..i + 2], 16).unwrap())
            .collect()
    }

    // RFC 5869 test case 1.
    #[test]
    fn hkdf_rfc5869_case1() {
        let ikm = hex("0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b");
        let salt = hex("000102030405060708090a0b0c");
        let info = hex("f0f1f2f3f4f5f6f7f8f9");
        let prk = hkdf_extract(HashAlgorithm::SHA256, &salt, &ikm).unwrap();
        assert_eq!(
            prk,
            hex("077709362c2e32df0ddc3f0dc47bba6390b6c73bb50f9c3122ec844ad7c2b3e5")
        );
        let okm = hkdf_expand(HashAlgorithm::SHA256, &prk, &info, 42).unwrap();
        assert_eq!(
            okm,
            hex("3cb25f25faacd57a90434f64d0362f2a2d2d0a90cf1a5a4c5db02d56ecc4c5bf34007208d5b887185865")
        );
    }

    // RFC 8448 section 3, simple 1-RTT handshake: early secret and the
    // derived secret feeding the handshake extract.
    #[test]
    fn tls13_early_secret_rfc8448() {
        let ks = KeySchedule::new(HashAlgorithm::SHA256, false, None).unwrap();
        assert_eq!(
            ks.secret,
            hex("33ad0a1c607ec03b09e6cd9893680ce210adf300aa1f2660e1b22e10f170f92a")
        );
    }

    #[test]
    fn expand_label_prefix_differs_for_dtls() {
        let secret = [0x42u8; 32];
        let tls = hkdf_expand_label(HashAlgorithm::SHA256, &secret, b"key", &[], 16, false).unwrap();
        let dtls = hkdf_expand_label(HashAlgorithm::SHA256, &secret, b"key", &[], 16, true).unwrap();
        assert_ne!(tls, dtls);
    }

    #[test]
    fn schedule_advances() {
        let mut ks = KeySchedule::new(HashAlgorithm::SHA256, false, None).unwrap();
        let before = ks.secret.clone();
        ks.advance(Some(&[0x11; 32])).unwrap();
        assert_ne!(ks.secret, before);
        let hs = ks.derive(b"s hs traffic", &[0x22; 32]).unwrap();
        assert_eq!(hs.len(), 32);
        ks.advance(None).unwrap();
        let app = ks.derive(b"s ap traffic", &[0x22; 32]).unwrap();
        assert_ne!(hs, app);
    }
}

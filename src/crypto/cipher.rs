//! Record-protection primitives: AEAD seal/open, CBC block transforms and
//! the RC4 keystream. All of these are consumed by the record layer as
//! bytes-in/bytes-out operations; nonce and padding policy live up there.

use aes::cipher::{block_padding::NoPadding, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::{Aead as _, KeyInit, Payload};
use aes_gcm::{Aes128Gcm, Aes256Gcm};
use chacha20poly1305::ChaCha20Poly1305;
use rc4::{consts::U16, KeyInit as Rc4KeyInit, Rc4, StreamCipher};

use crate::suites::Protection;
use crate::Error;

pub const AEAD_OVERHEAD: usize = 16;
pub const CBC_BLOCK_SIZE: usize = 16;

/// An AEAD instance bound to a key.
pub enum AeadCipher {
    Aes128Gcm(Box<Aes128Gcm>),
    Aes256Gcm(Box<Aes256Gcm>),
    ChaCha20Poly1305(Box<ChaCha20Poly1305>),
}

impl AeadCipher {
    pub fn new(protection: Protection, key: &[u8]) -> Result<AeadCipher, Error> {
        match (protection, key.len()) {
            (Protection::AesGcm, 16) => Ok(AeadCipher::Aes128Gcm(Box::new(
                Aes128Gcm::new_from_slice(key)
                    .map_err(|_| Error::Internal("bad AES-128-GCM key".to_string()))?,
            ))),
            (Protection::AesGcm, 32) => Ok(AeadCipher::Aes256Gcm(Box::new(
                Aes256Gcm::new_from_slice(key)
                    .map_err(|_| Error::Internal("bad AES-256-GCM key".to_string()))?,
            ))),
            (Protection::ChaCha20Poly1305, 32) => Ok(AeadCipher::ChaCha20Poly1305(Box::new(
                ChaCha20Poly1305::new_from_slice(key)
                    .map_err(|_| Error::Internal("bad ChaCha20 key".to_string()))?,
            ))),
            _ => Err(Error::Internal("bad AEAD key length".to_string())),
        }
    }

    pub fn seal(&self, nonce: &[u8; 12], plaintext: &[u8], aad: &[u8]) -> Vec<u8> {
        let nonce = GenericArray::from_slice(nonce);
        let payload = Payload {
            msg: plaintext,
            aad,
        };
        // Sealing cannot fail for in-range plaintext lengths.
        let out = match self {
            AeadCipher::Aes128Gcm(c) => c.encrypt(nonce, payload),
            AeadCipher::Aes256Gcm(c) => c.encrypt(nonce, payload),
            AeadCipher::ChaCha20Poly1305(c) => c.encrypt(nonce, payload),
        };
        out.expect("AEAD seal")
    }

    pub fn open(&self, nonce: &[u8; 12], ciphertext: &[u8], aad: &[u8]) -> Result<Vec<u8>, Error> {
        let nonce = GenericArray::from_slice(nonce);
        let payload = Payload {
            msg: ciphertext,
            aad,
        };
        let out = match self {
            AeadCipher::Aes128Gcm(c) => c.decrypt(nonce, payload),
            AeadCipher::Aes256Gcm(c) => c.decrypt(nonce, payload),
            AeadCipher::ChaCha20Poly1305(c) => c.decrypt(nonce, payload),
        };
        out.map_err(|_| Error::BadRecordMac)
    }
}

/// AES-CBC keyed for one direction. A fresh encryptor/decryptor is built per
/// record because TLS supplies the IV per record (explicitly from TLS 1.1,
/// chained from the previous record's last ciphertext block in TLS 1.0).
pub enum CbcCipher {
    Aes128([u8; 16]),
    Aes256([u8; 32]),
}

type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;
type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;
type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

impl CbcCipher {
    pub fn new(key: &[u8]) -> Result<CbcCipher, Error> {
        match key.len() {
            16 => Ok(CbcCipher::Aes128(key.try_into().unwrap())),
            32 => Ok(CbcCipher::Aes256(key.try_into().unwrap())),
            _ => Err(Error::Internal("bad CBC key length".to_string())),
        }
    }

    /// In-place CBC encryption. `buf` must be block-aligned.
    pub fn encrypt(&self, iv: &[u8], buf: &mut [u8]) -> Result<(), Error> {
        if buf.len() % CBC_BLOCK_SIZE != 0 {
            return Err(Error::Internal("CBC input not block aligned".to_string()));
        }
        let len = buf.len();
        let res = match self {
            CbcCipher::Aes128(key) => Aes128CbcEnc::new_from_slices(key, iv)
                .map_err(|_| Error::Internal("bad CBC iv".to_string()))?
                .encrypt_padded_mut::<NoPadding>(buf, len)
                .map(|_| ()),
            CbcCipher::Aes256(key) => Aes256CbcEnc::new_from_slices(key, iv)
                .map_err(|_| Error::Internal("bad CBC iv".to_string()))?
                .encrypt_padded_mut::<NoPadding>(buf, len)
                .map(|_| ()),
        };
        res.map_err(|_| Error::Internal("CBC encrypt".to_string()))
    }

    /// In-place CBC decryption. `buf` must be block-aligned.
    pub fn decrypt(&self, iv: &[u8], buf: &mut [u8]) -> Result<(), Error> {
        if buf.len() % CBC_BLOCK_SIZE != 0 {
            return Err(Error::BadRecordMac);
        }
        let res = match self {
            CbcCipher::Aes128(key) => Aes128CbcDec::new_from_slices(key, iv)
                .map_err(|_| Error::Internal("bad CBC iv".to_string()))?
                .decrypt_padded_mut::<NoPadding>(buf)
                .map(|_| ()),
            CbcCipher::Aes256(key) => Aes256CbcDec::new_from_slices(key, iv)
                .map_err(|_| Error::Internal("bad CBC iv".to_string()))?
                .decrypt_padded_mut::<NoPadding>(buf)
                .map(|_| ()),
        };
        res.map_err(|_| Error::BadRecordMac)
    }
}

/// RC4 keystream state. The stream runs across record boundaries, so this
/// is the one cipher that is stateful between records.
pub struct StreamState {
    rc4: Rc4<U16>,
}

impl StreamState {
    pub fn new(key: &[u8]) -> Result<StreamState, Error> {
        let rc4 = <Rc4<U16> as Rc4KeyInit>::new_from_slice(key)
            .map_err(|_| Error::Internal("bad RC4 key length".to_string()))?;
        Ok(StreamState { rc4 })
    }

    pub fn xor(&mut self, buf: &mut [u8]) {
        self.rc4.apply_keystream(buf);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aead_round_trip_all_variants() {
        for (protection, key_len) in [
            (Protection::AesGcm, 16),
            (Protection::AesGcm, 32),
            (Protection::ChaCha20Poly1305, 32),
        ] {
            let key = vec![0x42u8; key_len];
            let aead = AeadCipher::new(protection, &key).unwrap();
            let nonce = [7u8; 12];
            let aad = b"header";
            let ct = aead.seal(&nonce, b"hello record", aad);
            assert_eq!(ct.len(), 12 + AEAD_OVERHEAD);
            let pt = aead.open(&nonce, &ct, aad).unwrap();
            assert_eq!(pt, b"hello record");

            // Tampering must fail.
            let mut bad = ct.clone();
            bad[0] ^= 1;
            assert_eq!(aead.open(&nonce, &bad, aad), Err(Error::BadRecordMac));
            assert_eq!(aead.open(&nonce, &ct, b"other"), Err(Error::BadRecordMac));
        }
    }

    #[test]
    fn cbc_round_trip() {
        let cbc = CbcCipher::new(&[0x24; 16]).unwrap();
        let iv = [9u8; 16];
        let mut buf = [0u8; 32];
        buf[..5].copy_from_slice(b"data!");
        let orig = buf;
        cbc.encrypt(&iv, &mut buf).unwrap();
        assert_ne!(buf, orig);
        cbc.decrypt(&iv, &mut buf).unwrap();
        assert_eq!(buf, orig);
    }

    #[test]
    fn cbc_rejects_ragged_input() {
        let cbc = CbcCipher::new(&[0x24; 32]).unwrap();
        let mut buf = [0u8; 17];
        assert!(cbc.decrypt(&[0; 16], &mut buf).is_err());
    }

    #[test]
    fn rc4_keystream_continues_across_calls() {
        let mut a = StreamState::new(&[1u8; 16]).unwrap();
        let mut b = StreamState::new(&[1u8; 16]).unwrap();

        let mut one = [0u8; 24];
        a.xor(&mut one);

        let mut first = [0u8; 8];
        let mut second = [0u8; 16];
        b.xor(&mut first);
        b.xor(&mut second);

        assert_eq!(&one[..8], &first);
        assert_eq!(&one[8..], &second);
    }
}

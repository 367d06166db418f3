//! Narrow interfaces over the cryptographic primitives.
//!
//! The protocol engine consumes everything in here as plain functions or
//! small value types: derive bytes from bytes, seal/open buffers, sign and
//! verify blobs. No protocol knowledge lives below this line except the
//! exact byte layouts the derivation functions are defined over.

pub mod cipher;
pub mod hkdf;
pub mod kx;
pub mod prf;
pub mod signing;

use hmac::{Hmac, Mac};
use sha1::Sha1;
use sha2::{Sha256, Sha384};

use crate::types::HashAlgorithm;
use crate::Error;

pub(crate) type HmacSha1 = Hmac<Sha1>;
pub(crate) type HmacSha256 = Hmac<Sha256>;
pub(crate) type HmacSha384 = Hmac<Sha384>;

/// One-shot HMAC with the given hash.
pub fn hmac(hash: HashAlgorithm, key: &[u8], data: &[u8]) -> Result<Vec<u8>, Error> {
    fn run<D: Mac + hmac::digest::KeyInit>(key: &[u8], data: &[u8]) -> Result<Vec<u8>, Error> {
        let mut mac = <D as hmac::digest::KeyInit>::new_from_slice(key)
            .map_err(|_| Error::Internal("invalid HMAC key".to_string()))?;
        mac.update(data);
        Ok(mac.finalize().into_bytes().to_vec())
    }
    match hash {
        HashAlgorithm::SHA1 => run::<HmacSha1>(key, data),
        HashAlgorithm::SHA256 => run::<HmacSha256>(key, data),
        HashAlgorithm::SHA384 => run::<HmacSha384>(key, data),
        HashAlgorithm::MD5SHA1 => Err(Error::Internal("HMAC over MD5SHA1".to_string())),
    }
}

/// One-shot hash.
pub fn digest(hash: HashAlgorithm, data: &[u8]) -> Vec<u8> {
    use sha2::Digest;
    match hash {
        HashAlgorithm::SHA1 => Sha1::digest(data).to_vec(),
        HashAlgorithm::SHA256 => Sha256::digest(data).to_vec(),
        HashAlgorithm::SHA384 => Sha384::digest(data).to_vec(),
        HashAlgorithm::MD5SHA1 => {
            let mut out = md5::Md5::digest(data).to_vec();
            out.extend_from_slice(&Sha1::digest(data));
            out
        }
    }
}

/// Constant-time equality for MACs and verify_data.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    use subtle::ConstantTimeEq;
    a.len() == b.len() && bool::from(a.ct_eq(b))
}

//! Handshake signatures: signing with the local credential, verification
//! against the peer's public key, and the TLS 1.3 CertificateVerify
//! framing.

use pkcs8::{DecodePrivateKey, DecodePublicKey};
use rand::rngs::OsRng;
use sha1::Sha1;
use signature::hazmat::{PrehashSigner, PrehashVerifier};
use sha2::{Digest, Sha256, Sha384, Sha512};

use crate::types::{NamedGroup, SignatureScheme, Version};
use crate::Error;

/// Which family of keys a credential carries, used during suite and
/// credential selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyType {
    Rsa,
    Ecdsa,
}

/// A parsed private key.
pub enum PrivateKey {
    EcdsaP256(p256::ecdsa::SigningKey),
    EcdsaP384(p384::ecdsa::SigningKey),
    Rsa(Box<rsa::RsaPrivateKey>),
}

impl PrivateKey {
    /// Parse a DER private key: PKCS#8 first, then SEC1 (EC) and PKCS#1 (RSA).
    pub fn from_der(der: &[u8]) -> Result<PrivateKey, Error> {
        if let Ok(key) = p256::ecdsa::SigningKey::from_pkcs8_der(der) {
            return Ok(PrivateKey::EcdsaP256(key));
        }
        if let Ok(key) = p384::ecdsa::SigningKey::from_pkcs8_der(der) {
            return Ok(PrivateKey::EcdsaP384(key));
        }
        if let Ok(key) = rsa::RsaPrivateKey::from_pkcs8_der(der) {
            return Ok(PrivateKey::Rsa(Box::new(key)));
        }
        // SEC1 (the OpenSSL EC key format): dispatch on the scalar length.
        if let Ok(ec_key) = sec1::EcPrivateKey::try_from(der) {
            match ec_key.private_key.len() {
                32 => {
                    if let Ok(key) = p256::SecretKey::from_sec1_der(der) {
                        return Ok(PrivateKey::EcdsaP256(p256::ecdsa::SigningKey::from(&key)));
                    }
                }
                48 => {
                    if let Ok(key) = p384::SecretKey::from_sec1_der(der) {
                        return Ok(PrivateKey::EcdsaP384(p384::ecdsa::SigningKey::from(&key)));
                    }
                }
                _ => {}
            }
        }
        {
            use rsa::pkcs1::DecodeRsaPrivateKey;
            if let Ok(key) = rsa::RsaPrivateKey::from_pkcs1_der(der) {
                return Ok(PrivateKey::Rsa(Box::new(key)));
            }
        }
        Err(Error::Config(
            "private key not in a supported DER format".to_string(),
        ))
    }

    pub fn key_type(&self) -> KeyType {
        match self {
            PrivateKey::EcdsaP256(_) | PrivateKey::EcdsaP384(_) => KeyType::Ecdsa,
            PrivateKey::Rsa(_) => KeyType::Rsa,
        }
    }

    /// The curve of an ECDSA key, for curve-constraint checks.
    pub fn curve(&self) -> Option<NamedGroup> {
        match self {
            PrivateKey::EcdsaP256(_) => Some(NamedGroup::Secp256r1),
            PrivateKey::EcdsaP384(_) => Some(NamedGroup::Secp384r1),
            PrivateKey::Rsa(_) => None,
        }
    }

    /// Signature schemes this key can produce at `version`, preferred first.
    pub fn supported_schemes(&self, version: Version) -> Vec<SignatureScheme> {
        use SignatureScheme::*;
        let mut schemes = match self {
            PrivateKey::EcdsaP256(_) => vec![ECDSA_SECP256R1_SHA256],
            PrivateKey::EcdsaP384(_) => vec![ECDSA_SECP384R1_SHA384],
            PrivateKey::Rsa(_) => {
                if version >= Version::TLS1_3 {
                    vec![RSA_PSS_RSAE_SHA256, RSA_PSS_RSAE_SHA384]
                } else {
                    vec![RSA_PKCS1_SHA256, RSA_PKCS1_SHA384, RSA_PSS_RSAE_SHA256]
                }
            }
        };
        if version < Version::TLS1_2 {
            // Pre-1.2 signatures are fixed by key type: MD5SHA1 for RSA,
            // SHA1 for ECDSA. Represented by the SHA1 schemes.
            schemes = match self.key_type() {
                KeyType::Rsa => vec![RSA_PKCS1_SHA1],
                KeyType::Ecdsa => vec![ECDSA_SHA1],
            };
        }
        schemes
    }

    pub fn sign(&self, scheme: SignatureScheme, message: &[u8]) -> Result<Vec<u8>, Error> {
        match (self, scheme) {
            (PrivateKey::EcdsaP256(key), SignatureScheme::ECDSA_SECP256R1_SHA256) => {
                let sig: p256::ecdsa::Signature = key
                    .sign_prehash(&Sha256::digest(message))
                    .map_err(|_| Error::Internal("ECDSA signing failed".to_string()))?;
                Ok(sig.to_der().as_bytes().to_vec())
            }
            (PrivateKey::EcdsaP256(key), SignatureScheme::ECDSA_SHA1) => {
                let sig: p256::ecdsa::Signature = key
                    .sign_prehash(&Sha1::digest(message))
                    .map_err(|_| Error::Internal("ECDSA signing failed".to_string()))?;
                Ok(sig.to_der().as_bytes().to_vec())
            }
            (PrivateKey::EcdsaP384(key), SignatureScheme::ECDSA_SECP384R1_SHA384) => {
                let sig: p384::ecdsa::Signature = key
                    .sign_prehash(&Sha384::digest(message))
                    .map_err(|_| Error::Internal("ECDSA signing failed".to_string()))?;
                Ok(sig.to_der().as_bytes().to_vec())
            }
            (PrivateKey::Rsa(key), scheme) => rsa_sign(key, scheme, message),
            (_, scheme) => Err(Error::Internal(format!(
                "key cannot produce {:?}",
                scheme
            ))),
        }
    }
}

fn rsa_sign(
    key: &rsa::RsaPrivateKey,
    scheme: SignatureScheme,
    message: &[u8],
) -> Result<Vec<u8>, Error> {
    use SignatureScheme::*;
    let out = match scheme {
        RSA_PKCS1_SHA1 => key.sign(
            rsa::Pkcs1v15Sign::new::<Sha1>(),
            &Sha1::digest(message),
        ),
        RSA_PKCS1_SHA256 => key.sign(
            rsa::Pkcs1v15Sign::new::<Sha256>(),
            &Sha256::digest(message),
        ),
        RSA_PKCS1_SHA384 => key.sign(
            rsa::Pkcs1v15Sign::new::<Sha384>(),
            &Sha384::digest(message),
        ),
        RSA_PKCS1_SHA512 => key.sign(
            rsa::Pkcs1v15Sign::new::<Sha512>(),
            &Sha512::digest(message),
        ),
        RSA_PSS_RSAE_SHA256 => key.sign_with_rng(
            &mut OsRng,
            rsa::Pss::new::<Sha256>(),
            &Sha256::digest(message),
        ),
        RSA_PSS_RSAE_SHA384 => key.sign_with_rng(
            &mut OsRng,
            rsa::Pss::new::<Sha384>(),
            &Sha384::digest(message),
        ),
        RSA_PSS_RSAE_SHA512 => key.sign_with_rng(
            &mut OsRng,
            rsa::Pss::new::<Sha512>(),
            &Sha512::digest(message),
        ),
        other => return Err(Error::Internal(format!("RSA cannot produce {:?}", other))),
    };
    out.map_err(|e| Error::Internal(format!("RSA signing failed: {}", e)))
}

/// A peer public key extracted from a certificate SPKI.
pub enum PeerPublicKey {
    EcdsaP256(p256::ecdsa::VerifyingKey),
    EcdsaP384(p384::ecdsa::VerifyingKey),
    Rsa(Box<rsa::RsaPublicKey>),
}

impl PeerPublicKey {
    /// Parse a DER SubjectPublicKeyInfo.
    pub fn from_spki_der(spki: &[u8]) -> Result<PeerPublicKey, Error> {
        if let Ok(key) = p256::ecdsa::VerifyingKey::from_public_key_der(spki) {
            return Ok(PeerPublicKey::EcdsaP256(key));
        }
        if let Ok(key) = p384::ecdsa::VerifyingKey::from_public_key_der(spki) {
            return Ok(PeerPublicKey::EcdsaP384(key));
        }
        if let Ok(key) = rsa::RsaPublicKey::from_public_key_der(spki) {
            return Ok(PeerPublicKey::Rsa(Box::new(key)));
        }
        Err(Error::BadCertificate(
            "unsupported public key in certificate".to_string(),
        ))
    }

    pub fn key_type(&self) -> KeyType {
        match self {
            PeerPublicKey::EcdsaP256(_) | PeerPublicKey::EcdsaP384(_) => KeyType::Ecdsa,
            PeerPublicKey::Rsa(_) => KeyType::Rsa,
        }
    }

    pub fn verify(
        &self,
        scheme: SignatureScheme,
        message: &[u8],
        signature: &[u8],
    ) -> Result<(), Error> {
        let fail = || Error::DecryptError(format!("signature verify failed ({:?})", scheme));
        match (self, scheme) {
            (PeerPublicKey::EcdsaP256(key), SignatureScheme::ECDSA_SECP256R1_SHA256) => {
                let sig = p256::ecdsa::Signature::from_der(signature).map_err(|_| fail())?;
                key.verify_prehash(&Sha256::digest(message), &sig)
                    .map_err(|_| fail())
            }
            (PeerPublicKey::EcdsaP256(key), SignatureScheme::ECDSA_SHA1) => {
                let sig = p256::ecdsa::Signature::from_der(signature).map_err(|_| fail())?;
                key.verify_prehash(&Sha1::digest(message), &sig)
                    .map_err(|_| fail())
            }
            (PeerPublicKey::EcdsaP384(key), SignatureScheme::ECDSA_SECP384R1_SHA384) => {
                let sig = p384::ecdsa::Signature::from_der(signature).map_err(|_| fail())?;
                key.verify_prehash(&Sha384::digest(message), &sig)
                    .map_err(|_| fail())
            }
            (PeerPublicKey::Rsa(key), scheme) => rsa_verify(key, scheme, message, signature),
            _ => Err(fail()),
        }
    }
}

fn rsa_verify(
    key: &rsa::RsaPublicKey,
    scheme: SignatureScheme,
    message: &[u8],
    signature: &[u8],
) -> Result<(), Error> {
    use SignatureScheme::*;
    let fail = || Error::DecryptError(format!("signature verify failed ({:?})", scheme));
    let res = match scheme {
        RSA_PKCS1_SHA1 => key.verify(
            rsa::Pkcs1v15Sign::new::<Sha1>(),
            &Sha1::digest(message),
            signature,
        ),
        RSA_PKCS1_SHA256 => key.verify(
            rsa::Pkcs1v15Sign::new::<Sha256>(),
            &Sha256::digest(message),
            signature,
        ),
        RSA_PKCS1_SHA384 => key.verify(
            rsa::Pkcs1v15Sign::new::<Sha384>(),
            &Sha384::digest(message),
            signature,
        ),
        RSA_PKCS1_SHA512 => key.verify(
            rsa::Pkcs1v15Sign::new::<Sha512>(),
            &Sha512::digest(message),
            signature,
        ),
        RSA_PSS_RSAE_SHA256 => key.verify(
            rsa::Pss::new::<Sha256>(),
            &Sha256::digest(message),
            signature,
        ),
        RSA_PSS_RSAE_SHA384 => key.verify(
            rsa::Pss::new::<Sha384>(),
            &Sha384::digest(message),
            signature,
        ),
        RSA_PSS_RSAE_SHA512 => key.verify(
            rsa::Pss::new::<Sha512>(),
            &Sha512::digest(message),
            signature,
        ),
        _ => return Err(fail()),
    };
    res.map_err(|_| fail())
}

impl PrivateKey {
    /// Pre-TLS-1.2 signature: RSA signs an unprefixed MD5‖SHA1 digest,
    /// ECDSA signs SHA-1.
    pub fn sign_legacy(&self, message: &[u8]) -> Result<Vec<u8>, Error> {
        match self {
            PrivateKey::Rsa(key) => {
                let digest = crate::crypto::digest(crate::types::HashAlgorithm::MD5SHA1, message);
                key.sign(rsa::Pkcs1v15Sign::new_unprefixed(), &digest)
                    .map_err(|e| Error::Internal(format!("RSA signing failed: {}", e)))
            }
            _ => self.sign(SignatureScheme::ECDSA_SHA1, message),
        }
    }
}

impl PeerPublicKey {
    /// Verify a pre-TLS-1.2 signature (see [`PrivateKey::sign_legacy`]).
    pub fn verify_legacy(&self, message: &[u8], signature: &[u8]) -> Result<(), Error> {
        match self {
            PeerPublicKey::Rsa(key) => {
                let digest = crate::crypto::digest(crate::types::HashAlgorithm::MD5SHA1, message);
                key.verify(rsa::Pkcs1v15Sign::new_unprefixed(), &digest, signature)
                    .map_err(|_| Error::DecryptError("legacy RSA signature".to_string()))
            }
            _ => self.verify(SignatureScheme::ECDSA_SHA1, message, signature),
        }
    }
}

/// The signed blob for TLS 1.3 CertificateVerify: 64 spaces, a context
/// string, a zero byte, then the transcript hash.
pub fn tls13_signature_message(transcript_hash: &[u8], is_server: bool) -> Vec<u8> {
    let context: &[u8] = if is_server {
        b"TLS 1.3, server CertificateVerify"
    } else {
        b"TLS 1.3, client CertificateVerify"
    };
    let mut msg = Vec::with_capacity(64 + context.len() + 1 + transcript_hash.len());
    msg.extend_from_slice(&[0x20; 64]);
    msg.extend_from_slice(context);
    msg.push(0);
    msg.extend_from_slice(transcript_hash);
    msg
}

#[cfg(test)]
mod tests {
    use super::*;
    use p256::pkcs8::EncodePublicKey;

    fn p256_pair() -> (PrivateKey, PeerPublicKey) {
        let sk = p256::ecdsa::SigningKey::random(&mut OsRng);
        let spki = sk
            .verifying_key()
            .to_public_key_der()
            .unwrap()
            .as_bytes()
            .to_vec();
        (
            PrivateKey::EcdsaP256(sk),
            PeerPublicKey::from_spki_der(&spki).unwrap(),
        )
    }

    #[test]
    fn ecdsa_sign_verify() {
        let (sk, pk) = p256_pair();
        let msg = b"signed handshake bytes";
        let sig = sk.sign(SignatureScheme::ECDSA_SECP256R1_SHA256, msg).unwrap();
        pk.verify(SignatureScheme::ECDSA_SECP256R1_SHA256, msg, &sig)
            .unwrap();
        assert!(pk
            .verify(SignatureScheme::ECDSA_SECP256R1_SHA256, b"other", &sig)
            .is_err());
    }

    #[test]
    fn scheme_key_mismatch_rejected() {
        let (sk, pk) = p256_pair();
        assert!(sk.sign(SignatureScheme::RSA_PSS_RSAE_SHA256, b"x").is_err());
        assert!(pk
            .verify(SignatureScheme::RSA_PSS_RSAE_SHA256, b"x", &[0u8; 64])
            .is_err());
    }

    #[test]
    fn tls13_message_framing() {
        let msg = tls13_signature_message(&[0xAB; 32], true);
        assert_eq!(&msg[..64], &[0x20; 64][..]);
        assert!(msg.windows(6).any(|w| w == b"server"));
        assert_eq!(msg[msg.len() - 33], 0);
        let client = tls13_signature_message(&[0xAB; 32], false);
        assert_ne!(msg, client);
    }

    #[test]
    fn scheme_sets_by_version() {
        let (sk, _) = p256_pair();
        assert_eq!(
            sk.supported_schemes(Version::TLS1_3),
            vec![SignatureScheme::ECDSA_SECP256R1_SHA256]
        );
        assert_eq!(
            sk.supported_schemes(Version::TLS1_1),
            vec![SignatureScheme::ECDSA_SHA1]
        );
    }
}

//! Ephemeral key exchange offers, one per named group, plus RSA key
//! transport for the pre-TLS-1.2 RSA suites.

use p256::elliptic_curve::sec1::ToEncodedPoint;
use rand::rngs::OsRng;
use rand::RngCore;
use zeroize::Zeroizing;

use crate::types::NamedGroup;
use crate::Error;

enum Secret {
    X25519(x25519_dalek::EphemeralSecret),
    P256(p256::ecdh::EphemeralSecret),
    P384(p384::ecdh::EphemeralSecret),
}

/// An in-progress ECDHE offer: private key plus the encoded public share.
pub struct EcdheOffer {
    group: NamedGroup,
    secret: Secret,
    public: Vec<u8>,
}

impl EcdheOffer {
    /// Generate a fresh key pair on `group`.
    pub fn generate(group: NamedGroup) -> Result<EcdheOffer, Error> {
        let (secret, public) = match group {
            NamedGroup::X25519 => {
                let secret = x25519_dalek::EphemeralSecret::random();
                let public = x25519_dalek::PublicKey::from(&secret);
                (Secret::X25519(secret), public.as_bytes().to_vec())
            }
            NamedGroup::Secp256r1 => {
                let secret = p256::ecdh::EphemeralSecret::random(&mut OsRng);
                let public = secret.public_key().to_encoded_point(false);
                (Secret::P256(secret), public.as_bytes().to_vec())
            }
            NamedGroup::Secp384r1 => {
                let secret = p384::ecdh::EphemeralSecret::random(&mut OsRng);
                let public = secret.public_key().to_encoded_point(false);
                (Secret::P384(secret), public.as_bytes().to_vec())
            }
            other => {
                return Err(Error::Internal(format!(
                    "unsupported key exchange group {:?}",
                    other
                )))
            }
        };
        Ok(EcdheOffer {
            group,
            secret,
            public,
        })
    }

    pub fn group(&self) -> NamedGroup {
        self.group
    }

    /// The public share as it appears on the wire (uncompressed point or
    /// raw X25519 bytes).
    pub fn public(&self) -> &[u8] {
        &self.public
    }

    /// Complete the exchange against the peer's public share.
    pub fn finish(self, peer_public: &[u8]) -> Result<Zeroizing<Vec<u8>>, Error> {
        let shared = match self.secret {
            Secret::X25519(secret) => {
                let bytes: [u8; 32] = peer_public
                    .try_into()
                    .map_err(|_| Error::IllegalParameter("bad X25519 share".to_string()))?;
                let peer = x25519_dalek::PublicKey::from(bytes);
                secret.diffie_hellman(&peer).as_bytes().to_vec()
            }
            Secret::P256(secret) => {
                let peer = p256::PublicKey::from_sec1_bytes(peer_public)
                    .map_err(|_| Error::IllegalParameter("bad P-256 share".to_string()))?;
                secret
                    .diffie_hellman(&peer)
                    .raw_secret_bytes()
                    .as_slice()
                    .to_vec()
            }
            Secret::P384(secret) => {
                let peer = p384::PublicKey::from_sec1_bytes(peer_public)
                    .map_err(|_| Error::IllegalParameter("bad P-384 share".to_string()))?;
                secret
                    .diffie_hellman(&peer)
                    .raw_secret_bytes()
                    .as_slice()
                    .to_vec()
            }
        };
        Ok(Zeroizing::new(shared))
    }
}

/// RSA key transport premaster: two version bytes then 46 random bytes.
pub fn rsa_premaster(offered_wire_version: u16) -> Zeroizing<Vec<u8>> {
    let mut premaster = vec![0u8; 48];
    OsRng.fill_bytes(&mut premaster);
    premaster[0] = (offered_wire_version >> 8) as u8;
    premaster[1] = offered_wire_version as u8;
    Zeroizing::new(premaster)
}

/// Encrypt the premaster to the server's RSA key (PKCS#1 v1.5).
pub fn rsa_encrypt_premaster(
    public: &rsa::RsaPublicKey,
    premaster: &[u8],
) -> Result<Vec<u8>, Error> {
    public
        .encrypt(&mut OsRng, rsa::Pkcs1v15Encrypt, premaster)
        .map_err(|e| Error::Internal(format!("RSA encrypt: {}", e)))
}

/// Decrypt a ClientKeyExchange premaster. The caller is responsible for the
/// anti-Bleichenbacher version check.
pub fn rsa_decrypt_premaster(
    private: &rsa::RsaPrivateKey,
    ciphertext: &[u8],
) -> Result<Zeroizing<Vec<u8>>, Error> {
    private
        .decrypt(rsa::Pkcs1v15Encrypt, ciphertext)
        .map(Zeroizing::new)
        .map_err(|_| Error::DecryptError("RSA premaster decrypt".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ecdhe_agreement_all_groups() {
        for group in [
            NamedGroup::X25519,
            NamedGroup::Secp256r1,
            NamedGroup::Secp384r1,
        ] {
            let a = EcdheOffer::generate(group).unwrap();
            let b = EcdheOffer::generate(group).unwrap();
            let pub_a = a.public().to_vec();
            let pub_b = b.public().to_vec();
            let shared_a = a.finish(&pub_b).unwrap();
            let shared_b = b.finish(&pub_a).unwrap();
            assert_eq!(&*shared_a, &*shared_b, "{:?}", group);
            assert!(!shared_a.is_empty());
        }
    }

    #[test]
    fn unsupported_group_rejected() {
        assert!(EcdheOffer::generate(NamedGroup::X448).is_err());
        assert!(EcdheOffer::generate(NamedGroup::Unknown(0x9999)).is_err());
    }

    #[test]
    fn bad_peer_share_rejected() {
        let offer = EcdheOffer::generate(NamedGroup::Secp256r1).unwrap();
        assert!(offer.finish(&[0u8; 12]).is_err());
    }

    #[test]
    fn premaster_leads_with_version() {
        let pm = rsa_premaster(0x0303);
        assert_eq!(pm.len(), 48);
        assert_eq!(&pm[..2], &[0x03, 0x03]);
    }
}

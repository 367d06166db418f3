//! Credentials and the narrow X.509 collaborator: parse certificates, pull
//! out the bits the handshake needs, verify peer chains through a pluggable
//! trait, and generate self-signed test credentials.

use std::fmt;
use std::sync::Arc;

use der::{Decode, Encode};
use rand::rngs::OsRng;
use rcgen::{
    Certificate as RcgenCertificate, CertificateParams, DistinguishedName, DnType, IsCa, KeyPair,
    PKCS_ECDSA_P256_SHA256, PKCS_RSA_SHA256,
};
use rsa::pkcs8::EncodePrivateKey;
use spki::ObjectIdentifier;
use x509_cert::Certificate as X509Certificate;

use crate::crypto::signing::{KeyType, PeerPublicKey, PrivateKey};
use crate::types::{NamedGroup, SignatureScheme, Version};
use crate::Error;

/// Verifies a peer certificate chain. The engine parses the chain before
/// calling; everything beyond SPKI extraction is this collaborator's
/// business.
pub trait CertVerifier: Send + Sync {
    fn verify(&self, chain: &[Vec<u8>]) -> Result<(), Error>;
}

/// Verifier that only requires the chain to parse. The default for a test
/// peer, which mostly talks to throwaway certificates.
pub struct ParseOnlyVerifier;

impl CertVerifier for ParseOnlyVerifier {
    fn verify(&self, chain: &[Vec<u8>]) -> Result<(), Error> {
        for cert in chain {
            parse_certificate(cert)?;
        }
        Ok(())
    }
}

const OID_EC_PUBLIC_KEY: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.10045.2.1");
const OID_RSA_ENCRYPTION: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("1.2.840.113549.1.1.1");

/// Fields the handshake needs from one certificate.
pub struct ParsedCertificate {
    pub spki_der: Vec<u8>,
    pub subject_der: Vec<u8>,
    pub issuer_der: Vec<u8>,
    algorithm_oid: ObjectIdentifier,
}

impl ParsedCertificate {
    /// The key family the certificate certifies, if recognized.
    pub fn key_type(&self) -> Option<KeyType> {
        match self.algorithm_oid {
            OID_EC_PUBLIC_KEY => Some(KeyType::Ecdsa),
            OID_RSA_ENCRYPTION => Some(KeyType::Rsa),
            _ => None,
        }
    }
}

pub fn parse_certificate(der_bytes: &[u8]) -> Result<ParsedCertificate, Error> {
    let cert = X509Certificate::from_der(der_bytes)
        .map_err(|e| Error::BadCertificate(format!("certificate parse: {}", e)))?;
    let spki_der = cert
        .tbs_certificate
        .subject_public_key_info
        .to_der()
        .map_err(|e| Error::BadCertificate(format!("SPKI encode: {}", e)))?;
    let subject_der = cert
        .tbs_certificate
        .subject
        .to_der()
        .map_err(|e| Error::BadCertificate(format!("subject encode: {}", e)))?;
    let issuer_der = cert
        .tbs_certificate
        .issuer
        .to_der()
        .map_err(|e| Error::BadCertificate(format!("issuer encode: {}", e)))?;
    let algorithm_oid = cert.tbs_certificate.subject_public_key_info.algorithm.oid;
    Ok(ParsedCertificate {
        spki_der,
        subject_der,
        issuer_der,
        algorithm_oid,
    })
}

/// The public key of a chain's leaf certificate.
pub fn leaf_public_key(chain: &[Vec<u8>]) -> Result<PeerPublicKey, Error> {
    let leaf = chain
        .first()
        .ok_or_else(|| Error::BadCertificate("empty certificate chain".to_string()))?;
    let parsed = parse_certificate(leaf)?;
    PeerPublicKey::from_spki_der(&parsed.spki_der)
}

/// A certificate chain plus its private key.
#[derive(Clone)]
pub struct Credential {
    pub chain: Vec<Vec<u8>>,
    pub key: Arc<PrivateKey>,
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("chain_len", &self.chain.len())
            .field("key_type", &self.key.key_type())
            .finish()
    }
}

impl Credential {
    pub fn new(chain: Vec<Vec<u8>>, key_der: &[u8]) -> Result<Credential, Error> {
        if chain.is_empty() {
            return Err(Error::Config("credential with empty chain".to_string()));
        }
        let parsed = parse_certificate(&chain[0])?;
        let key = PrivateKey::from_der(key_der)?;
        if parsed.key_type() != Some(key.key_type()) {
            return Err(Error::Config(
                "certificate and private key disagree on key type".to_string(),
            ));
        }
        Ok(Credential {
            chain,
            key: Arc::new(key),
        })
    }

    pub fn key_type(&self) -> KeyType {
        self.key.key_type()
    }

    pub fn curve(&self) -> Option<NamedGroup> {
        self.key.curve()
    }

    pub fn supported_schemes(&self, version: Version) -> Vec<SignatureScheme> {
        self.key.supported_schemes(version)
    }

    /// The leaf's issuer DER, for trust-anchor matching.
    pub fn issuer_der(&self) -> Result<Vec<u8>, Error> {
        Ok(parse_certificate(&self.chain[0])?.issuer_der)
    }
}

/// Generate a self-signed ECDSA P-256 credential.
pub fn generate_self_signed(common_name: &str) -> Result<Credential, Error> {
    let key_pair = KeyPair::generate(&PKCS_ECDSA_P256_SHA256)
        .map_err(|e| Error::Config(format!("key generation: {}", e)))?;
    let cert = build_self_signed(common_name, key_pair, &PKCS_ECDSA_P256_SHA256)?;
    let key_der = cert.serialize_private_key_der();
    let cert_der = cert
        .serialize_der()
        .map_err(|e| Error::Config(format!("certificate build: {}", e)))?;
    Credential::new(vec![cert_der], &key_der)
}

/// Generate a self-signed RSA-2048 credential. Noticeably slower than the
/// ECDSA path; meant for test setup.
pub fn generate_self_signed_rsa(common_name: &str) -> Result<Credential, Error> {
    let rsa_key = rsa::RsaPrivateKey::new(&mut OsRng, 2048)
        .map_err(|e| Error::Config(format!("RSA key generation: {}", e)))?;
    let key_der = rsa_key
        .to_pkcs8_der()
        .map_err(|e| Error::Config(format!("RSA key encode: {}", e)))?;
    let key_pair = KeyPair::from_der(key_der.as_bytes())
        .map_err(|e| Error::Config(format!("RSA key import: {}", e)))?;
    let cert = build_self_signed(common_name, key_pair, &PKCS_RSA_SHA256)?;
    let cert_der = cert
        .serialize_der()
        .map_err(|e| Error::Config(format!("certificate build: {}", e)))?;
    Credential::new(vec![cert_der], key_der.as_bytes())
}

fn build_self_signed(
    common_name: &str,
    key_pair: KeyPair,
    alg: &'static rcgen::SignatureAlgorithm,
) -> Result<RcgenCertificate, Error> {
    let mut params = CertificateParams::new(vec![common_name.to_string()]);
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, common_name.to_string());
    params.distinguished_name = dn;
    params.is_ca = IsCa::NoCa;
    params.alg = alg;
    params.key_pair = Some(key_pair);
    let not_before = time::OffsetDateTime::now_utc() - time::Duration::days(1);
    params.not_before = not_before;
    params.not_after = not_before + time::Duration::days(365);
    RcgenCertificate::from_params(params)
        .map_err(|e| Error::Config(format!("certificate build: {}", e)))
}

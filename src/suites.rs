//! Static cipher-suite registry.
//!
//! An immutable table of every suite the engine speaks, indexed by suite ID.
//! Record-layer construction dispatches on [`Protection`]; handshake code
//! dispatches on [`KeyExchangeAlgorithm`] and the PRF hash.

use crate::types::{HashAlgorithm, Version};

/// Key exchange + authentication implied by a suite (≤ TLS 1.2).
///
/// TLS 1.3 suites carry neither; key exchange is negotiated via key_share
/// and authentication via signature_algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyExchangeAlgorithm {
    /// RSA key transport: client encrypts the premaster to the server key.
    Rsa,
    /// Ephemeral ECDH, server signs with an RSA key.
    EcdheRsa,
    /// Ephemeral ECDH, server signs with an ECDSA key.
    EcdheEcdsa,
    /// TLS 1.3: key exchange decoupled from the suite.
    Tls13,
}

/// Record-protection family of a suite.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protection {
    /// RC4 keystream, HMAC-SHA1. Stream ciphers are forbidden in DTLS.
    Rc4Sha1,
    /// AES-CBC, HMAC-SHA1, explicit IV from TLS 1.1 / always in DTLS.
    AesCbcSha1,
    /// AES-GCM. Explicit 8-byte nonce in ≤1.2, implicit in 1.3.
    AesGcm,
    /// ChaCha20-Poly1305. Implicit XOR nonce in every version.
    ChaCha20Poly1305,
}

/// Immutable description of one cipher suite.
#[derive(Debug)]
pub struct CipherSuite {
    pub id: u16,
    pub name: &'static str,
    pub kx: KeyExchangeAlgorithm,
    pub protection: Protection,
    /// Hash driving the PRF (1.2), HKDF (1.3) and transcript.
    pub hash: HashAlgorithm,
    pub key_len: usize,
    /// Implicit IV material taken from the key block / traffic secret.
    pub fixed_iv_len: usize,
    /// MAC key/tag length for MAC-then-encrypt families, 0 for AEAD.
    pub mac_len: usize,
    min_version: Version,
    max_version: Version,
}

impl CipherSuite {
    pub fn is_tls13(&self) -> bool {
        self.kx == KeyExchangeAlgorithm::Tls13
    }

    pub fn is_aead(&self) -> bool {
        matches!(
            self.protection,
            Protection::AesGcm | Protection::ChaCha20Poly1305
        )
    }

    pub fn is_ecdhe(&self) -> bool {
        matches!(
            self.kx,
            KeyExchangeAlgorithm::EcdheRsa | KeyExchangeAlgorithm::EcdheEcdsa
        )
    }

    /// Whether the AEAD nonce is carried explicitly on the wire.
    pub fn explicit_nonce(&self, version: Version) -> bool {
        version < Version::TLS1_3 && self.protection == Protection::AesGcm
    }

    pub fn supports_version(&self, version: Version, is_dtls: bool) -> bool {
        if is_dtls && self.protection == Protection::Rc4Sha1 {
            return false;
        }
        if is_dtls && version == Version::TLS1_0 {
            return false;
        }
        version >= self.min_version && version <= self.max_version
    }
}

// Suite IDs, IANA names.
pub const TLS_RSA_WITH_RC4_128_SHA: u16 = 0x0005;
pub const TLS_RSA_WITH_AES_128_CBC_SHA: u16 = 0x002F;
pub const TLS_RSA_WITH_AES_256_CBC_SHA: u16 = 0x0035;
pub const TLS_RSA_WITH_AES_128_GCM_SHA256: u16 = 0x009C;
pub const TLS_ECDHE_ECDSA_WITH_AES_128_CBC_SHA: u16 = 0xC009;
pub const TLS_ECDHE_ECDSA_WITH_AES_256_CBC_SHA: u16 = 0xC00A;
pub const TLS_ECDHE_RSA_WITH_RC4_128_SHA: u16 = 0xC011;
pub const TLS_ECDHE_RSA_WITH_AES_128_CBC_SHA: u16 = 0xC013;
pub const TLS_ECDHE_RSA_WITH_AES_256_CBC_SHA: u16 = 0xC014;
pub const TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256: u16 = 0xC02B;
pub const TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384: u16 = 0xC02C;
pub const TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256: u16 = 0xC02F;
pub const TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384: u16 = 0xC030;
pub const TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256: u16 = 0xCCA8;
pub const TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256: u16 = 0xCCA9;
pub const TLS_AES_128_GCM_SHA256: u16 = 0x1301;
pub const TLS_AES_256_GCM_SHA384: u16 = 0x1302;
pub const TLS_CHACHA20_POLY1305_SHA256: u16 = 0x1303;

macro_rules! suite {
    ($id:expr, $name:expr, $kx:expr, $prot:expr, $hash:expr,
     key $key:expr, iv $iv:expr, mac $mac:expr, $min:expr, $max:expr) => {
        CipherSuite {
            id: $id,
            name: $name,
            kx: $kx,
            protection: $prot,
            hash: $hash,
            key_len: $key,
            fixed_iv_len: $iv,
            mac_len: $mac,
            min_version: $min,
            max_version: $max,
        }
    };
}

use HashAlgorithm::{SHA256, SHA384};
use KeyExchangeAlgorithm::{EcdheEcdsa, EcdheRsa, Rsa, Tls13};
use Protection::{AesCbcSha1, AesGcm, ChaCha20Poly1305, Rc4Sha1};
use Version::{TLS1_0, TLS1_2, TLS1_3};

/// Every suite the engine knows, in no particular order.
pub static ALL_SUITES: &[CipherSuite] = &[
    suite!(TLS_AES_128_GCM_SHA256, "TLS_AES_128_GCM_SHA256",
        Tls13, AesGcm, SHA256, key 16, iv 12, mac 0, TLS1_3, TLS1_3),
    suite!(TLS_AES_256_GCM_SHA384, "TLS_AES_256_GCM_SHA384",
        Tls13, AesGcm, SHA384, key 32, iv 12, mac 0, TLS1_3, TLS1_3),
    suite!(TLS_CHACHA20_POLY1305_SHA256, "TLS_CHACHA20_POLY1305_SHA256",
        Tls13, ChaCha20Poly1305, SHA256, key 32, iv 12, mac 0, TLS1_3, TLS1_3),
    suite!(TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256, "TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256",
        EcdheEcdsa, AesGcm, SHA256, key 16, iv 4, mac 0, TLS1_2, TLS1_2),
    suite!(TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384, "TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384",
        EcdheEcdsa, AesGcm, SHA384, key 32, iv 4, mac 0, TLS1_2, TLS1_2),
    suite!(TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256, "TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256",
        EcdheRsa, AesGcm, SHA256, key 16, iv 4, mac 0, TLS1_2, TLS1_2),
    suite!(TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384, "TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384",
        EcdheRsa, AesGcm, SHA384, key 32, iv 4, mac 0, TLS1_2, TLS1_2),
    suite!(TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256, "TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256",
        EcdheRsa, ChaCha20Poly1305, SHA256, key 32, iv 12, mac 0, TLS1_2, TLS1_2),
    suite!(TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256, "TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256",
        EcdheEcdsa, ChaCha20Poly1305, SHA256, key 32, iv 12, mac 0, TLS1_2, TLS1_2),
    suite!(TLS_RSA_WITH_AES_128_GCM_SHA256, "TLS_RSA_WITH_AES_128_GCM_SHA256",
        Rsa, AesGcm, SHA256, key 16, iv 4, mac 0, TLS1_2, TLS1_2),
    suite!(TLS_ECDHE_RSA_WITH_AES_128_CBC_SHA, "TLS_ECDHE_RSA_WITH_AES_128_CBC_SHA",
        EcdheRsa, AesCbcSha1, SHA256, key 16, iv 16, mac 20, TLS1_0, TLS1_2),
    suite!(TLS_ECDHE_RSA_WITH_AES_256_CBC_SHA, "TLS_ECDHE_RSA_WITH_AES_256_CBC_SHA",
        EcdheRsa, AesCbcSha1, SHA256, key 32, iv 16, mac 20, TLS1_0, TLS1_2),
    suite!(TLS_ECDHE_ECDSA_WITH_AES_128_CBC_SHA, "TLS_ECDHE_ECDSA_WITH_AES_128_CBC_SHA",
        EcdheEcdsa, AesCbcSha1, SHA256, key 16, iv 16, mac 20, TLS1_0, TLS1_2),
    suite!(TLS_ECDHE_ECDSA_WITH_AES_256_CBC_SHA, "TLS_ECDHE_ECDSA_WITH_AES_256_CBC_SHA",
        EcdheEcdsa, AesCbcSha1, SHA256, key 32, iv 16, mac 20, TLS1_0, TLS1_2),
    suite!(TLS_RSA_WITH_AES_128_CBC_SHA, "TLS_RSA_WITH_AES_128_CBC_SHA",
        Rsa, AesCbcSha1, SHA256, key 16, iv 16, mac 20, TLS1_0, TLS1_2),
    suite!(TLS_RSA_WITH_AES_256_CBC_SHA, "TLS_RSA_WITH_AES_256_CBC_SHA",
        Rsa, AesCbcSha1, SHA256, key 32, iv 16, mac 20, TLS1_0, TLS1_2),
    suite!(TLS_ECDHE_RSA_WITH_RC4_128_SHA, "TLS_ECDHE_RSA_WITH_RC4_128_SHA",
        EcdheRsa, Rc4Sha1, SHA256, key 16, iv 0, mac 20, TLS1_0, TLS1_2),
    suite!(TLS_RSA_WITH_RC4_128_SHA, "TLS_RSA_WITH_RC4_128_SHA",
        Rsa, Rc4Sha1, SHA256, key 16, iv 0, mac 20, TLS1_0, TLS1_2),
];

/// Default preference order offered by clients and honored by servers.
pub static DEFAULT_SUITES: &[u16] = &[
    TLS_AES_128_GCM_SHA256,
    TLS_AES_256_GCM_SHA384,
    TLS_CHACHA20_POLY1305_SHA256,
    TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256,
    TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256,
    TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384,
    TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384,
    TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256,
    TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256,
    TLS_ECDHE_ECDSA_WITH_AES_128_CBC_SHA,
    TLS_ECDHE_RSA_WITH_AES_128_CBC_SHA,
    TLS_RSA_WITH_AES_128_GCM_SHA256,
    TLS_RSA_WITH_AES_128_CBC_SHA,
    TLS_RSA_WITH_AES_256_CBC_SHA,
];

/// Look up a suite by its wire ID.
pub fn suite_by_id(id: u16) -> Option<&'static CipherSuite> {
    ALL_SUITES.iter().find(|s| s.id == id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup() {
        let s = suite_by_id(TLS_AES_128_GCM_SHA256).unwrap();
        assert!(s.is_tls13());
        assert!(s.is_aead());
        assert_eq!(s.hash, HashAlgorithm::SHA256);
        assert!(suite_by_id(0x0000).is_none());
    }

    #[test]
    fn version_gating() {
        let gcm12 = suite_by_id(TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256).unwrap();
        assert!(gcm12.supports_version(Version::TLS1_2, false));
        assert!(!gcm12.supports_version(Version::TLS1_1, false));
        assert!(!gcm12.supports_version(Version::TLS1_3, false));

        let cbc = suite_by_id(TLS_RSA_WITH_AES_128_CBC_SHA).unwrap();
        assert!(cbc.supports_version(Version::TLS1_0, false));
        assert!(cbc.supports_version(Version::TLS1_2, true));
        // DTLS has no TLS 1.0 equivalent.
        assert!(!cbc.supports_version(Version::TLS1_0, true));

        let rc4 = suite_by_id(TLS_RSA_WITH_RC4_128_SHA).unwrap();
        assert!(rc4.supports_version(Version::TLS1_1, false));
        assert!(!rc4.supports_version(Version::TLS1_1, true));
    }

    #[test]
    fn explicit_nonce_only_for_tls12_gcm() {
        let gcm12 = suite_by_id(TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256).unwrap();
        let gcm13 = suite_by_id(TLS_AES_128_GCM_SHA256).unwrap();
        let chacha = suite_by_id(TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256).unwrap();
        assert!(gcm12.explicit_nonce(Version::TLS1_2));
        assert!(!gcm13.explicit_nonce(Version::TLS1_3));
        assert!(!chacha.explicit_nonce(Version::TLS1_2));
    }

    #[test]
    fn default_preferences_resolve() {
        for id in DEFAULT_SUITES {
            assert!(suite_by_id(*id).is_some(), "missing suite {:04x}", id);
        }
    }
}

//! Full client/server handshakes across every supported (version, suite)
//! pair, over the stream transport.

mod common;

use std::sync::Arc;

use common::{handshake_and_chat, ECDSA_CRED, RSA_CRED};
use timpl::{suites, Config, Version};

fn config_for(version: Version, suite: u16) -> Arc<Config> {
    Arc::new(
        Config::builder()
            .versions(version, version)
            .cipher_suites(vec![suite])
            .credential(ECDSA_CRED.clone())
            .credential(RSA_CRED.clone())
            .build()
            .unwrap(),
    )
}

#[test]
fn matrix_tls13() {
    for suite in [
        suites::TLS_AES_128_GCM_SHA256,
        suites::TLS_AES_256_GCM_SHA384,
        suites::TLS_CHACHA20_POLY1305_SHA256,
    ] {
        let (client, server) = handshake_and_chat(
            config_for(Version::TLS1_3, suite),
            config_for(Version::TLS1_3, suite),
            false,
        );
        assert_eq!(client.version, Version::TLS1_3, "suite {:04x}", suite);
        assert_eq!(client.cipher_suite, suite);
        assert_eq!(server.version, Version::TLS1_3);
        assert_eq!(server.cipher_suite, suite);
        assert_eq!(client.peer_cert_count, 1);
        assert_eq!(server.peer_cert_count, 0);
    }
}

#[test]
fn matrix_tls12_aead() {
    for suite in [
        suites::TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256,
        suites::TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384,
        suites::TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256,
        suites::TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384,
        suites::TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256,
        suites::TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256,
        suites::TLS_RSA_WITH_AES_128_GCM_SHA256,
    ] {
        let (client, server) = handshake_and_chat(
            config_for(Version::TLS1_2, suite),
            config_for(Version::TLS1_2, suite),
            false,
        );
        assert_eq!(client.version, Version::TLS1_2, "suite {:04x}", suite);
        assert_eq!(client.cipher_suite, suite);
        assert_eq!(server.cipher_suite, suite);
        assert!(!client.did_resume);
    }
}

#[test]
fn matrix_legacy_versions_cbc_and_rc4() {
    for version in [Version::TLS1_0, Version::TLS1_1, Version::TLS1_2] {
        for suite in [
            suites::TLS_ECDHE_RSA_WITH_AES_128_CBC_SHA,
            suites::TLS_ECDHE_RSA_WITH_AES_256_CBC_SHA,
            suites::TLS_ECDHE_ECDSA_WITH_AES_128_CBC_SHA,
            suites::TLS_RSA_WITH_AES_128_CBC_SHA,
            suites::TLS_RSA_WITH_AES_256_CBC_SHA,
            suites::TLS_RSA_WITH_RC4_128_SHA,
            suites::TLS_ECDHE_RSA_WITH_RC4_128_SHA,
        ] {
            let (client, server) = handshake_and_chat(
                config_for(version, suite),
                config_for(version, suite),
                false,
            );
            assert_eq!(client.version, version, "suite {:04x}", suite);
            assert_eq!(server.version, version);
            assert_eq!(client.cipher_suite, suite);
        }
    }
}

#[test]
fn version_negotiation_picks_highest_common() {
    let client = Arc::new(
        Config::builder()
            .versions(Version::TLS1_0, Version::TLS1_3)
            .credential(ECDSA_CRED.clone())
            .build()
            .unwrap(),
    );
    let server = Arc::new(
        Config::builder()
            .versions(Version::TLS1_0, Version::TLS1_2)
            .credential(ECDSA_CRED.clone())
            .credential(RSA_CRED.clone())
            .build()
            .unwrap(),
    );
    let (c, s) = handshake_and_chat(client, server, false);
    assert_eq!(c.version, Version::TLS1_2);
    assert_eq!(s.version, Version::TLS1_2);
}

#[test]
fn alpn_negotiated() {
    let client = Arc::new(
        Config::builder()
            .versions(Version::TLS1_3, Version::TLS1_3)
            .alpn_protocols(vec![b"h2".to_vec(), b"http/1.1".to_vec()])
            .build()
            .unwrap(),
    );
    let server = Arc::new(
        Config::builder()
            .versions(Version::TLS1_3, Version::TLS1_3)
            .alpn_protocols(vec![b"http/1.1".to_vec()])
            .credential(ECDSA_CRED.clone())
            .build()
            .unwrap(),
    );
    let (c, s) = handshake_and_chat(client, server, false);
    assert_eq!(c.alpn.as_deref(), Some(&b"http/1.1"[..]));
    assert_eq!(s.alpn.as_deref(), Some(&b"http/1.1"[..]));
}

#[test]
fn alpn_negotiated_tls12() {
    let client = Arc::new(
        Config::builder()
            .versions(Version::TLS1_2, Version::TLS1_2)
            .alpn_protocols(vec![b"h2".to_vec()])
            .build()
            .unwrap(),
    );
    let server = Arc::new(
        Config::builder()
            .versions(Version::TLS1_2, Version::TLS1_2)
            .alpn_protocols(vec![b"h2".to_vec()])
            .credential(ECDSA_CRED.clone())
            .build()
            .unwrap(),
    );
    let (c, _) = handshake_and_chat(client, server, false);
    assert_eq!(c.alpn.as_deref(), Some(&b"h2"[..]));
}

#[test]
fn large_application_writes_round_trip() {
    // Multi-record payloads (> 16384 bytes) split and reassemble.
    let config = config_for(Version::TLS1_3, suites::TLS_AES_128_GCM_SHA256);
    let payload: Vec<u8> = (0..40_000u32).map(|i| i as u8).collect();
    let expected = payload.clone();
    let (sent, received): (usize, Vec<u8>) = common::run_pair(
        config.clone(),
        config,
        false,
        move |mut conn| {
            conn.handshake().unwrap();
            conn.write(&payload).unwrap()
        },
        move |mut conn| {
            conn.handshake().unwrap();
            let mut out = Vec::new();
            let mut buf = [0u8; 4096];
            while out.len() < 40_000 {
                let n = conn.read(&mut buf).unwrap();
                out.extend_from_slice(&buf[..n]);
            }
            out
        },
    );
    assert_eq!(sent, 40_000);
    assert_eq!(received, expected);
}

#[test]
fn exporters_agree() {
    for version in [Version::TLS1_2, Version::TLS1_3] {
        let config = Arc::new(
            Config::builder()
                .versions(version, version)
                .credential(ECDSA_CRED.clone())
                .build()
                .unwrap(),
        );
        let (client_ekm, server_ekm) = common::run_pair(
            config.clone(),
            config,
            false,
            |mut conn| {
                conn.handshake().unwrap();
                conn.write(b"x").unwrap();
                conn.export_keying_material(b"test-label", b"ctx", 32).unwrap()
            },
            |mut conn| {
                conn.handshake().unwrap();
                let mut buf = [0u8; 8];
                conn.read(&mut buf).unwrap();
                conn.export_keying_material(b"test-label", b"ctx", 32).unwrap()
            },
        );
        assert_eq!(client_ekm, server_ekm, "{}", version);
        assert_eq!(client_ekm.len(), 32);
    }
}

//! DTLS handshakes: datagram framing, fragmentation, ChangeCipherSpec
//! packing and sequence-number tolerance.

mod common;

use std::sync::Arc;

use common::{handshake_and_chat, run_pair, ECDSA_CRED, RSA_CRED};
use timpl::{suites, Config, TestKnobs, Version};

fn dtls_config(version: Version, suite: u16) -> Arc<Config> {
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
fn dtls12_handshake_matrix() {
    for suite in [
        suites::TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256,
        suites::TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384,
        suites::TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256,
        suites::TLS_ECDHE_RSA_WITH_AES_128_CBC_SHA,
        suites::TLS_RSA_WITH_AES_128_CBC_SHA,
    ] {
        let (c, s) = handshake_and_chat(
            dtls_config(Version::TLS1_2, suite),
            dtls_config(Version::TLS1_2, suite),
            true,
        );
        assert_eq!(c.version, Version::TLS1_2, "suite {:04x}", suite);
        assert_eq!(c.cipher_suite, suite);
        assert_eq!(s.cipher_suite, suite);
    }
}

#[test]
fn dtls11_handshake() {
    let suite = suites::TLS_ECDHE_RSA_WITH_AES_128_CBC_SHA;
    let (c, _) = handshake_and_chat(
        dtls_config(Version::TLS1_1, suite),
        dtls_config(Version::TLS1_1, suite),
        true,
    );
    assert_eq!(c.version, Version::TLS1_1);
}

#[test]
fn dtls13_handshake_matrix() {
    for suite in [
        suites::TLS_AES_128_GCM_SHA256,
        suites::TLS_AES_256_GCM_SHA384,
        suites::TLS_CHACHA20_POLY1305_SHA256,
    ] {
        let (c, s) = handshake_and_chat(
            dtls_config(Version::TLS1_3, suite),
            dtls_config(Version::TLS1_3, suite),
            true,
        );
        assert_eq!(c.version, Version::TLS1_3, "suite {:04x}", suite);
        assert_eq!(s.cipher_suite, suite);
    }
}

#[test]
fn small_fragments_reassemble() {
    // A tight fragment cap forces every handshake message (the certificate
    // especially) through multi-fragment reassembly.
    let build = || {
        Arc::new(
            Config::builder()
                .versions(Version::TLS1_2, Version::TLS1_2)
                .cipher_suites(vec![suites::TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256])
                .credential(ECDSA_CRED.clone())
                .mtu(320)
                .knobs(TestKnobs {
                    max_fragment_len: Some(64),
                    ..TestKnobs::default()
                })
                .build()
                .unwrap(),
        )
    };
    let (c, s) = handshake_and_chat(build(), build(), true);
    assert_eq!(c.version, Version::TLS1_2);
    assert_eq!(s.version, Version::TLS1_2);
}

#[test]
fn packed_change_cipher_spec() {
    let build = || {
        Arc::new(
            Config::builder()
                .versions(Version::TLS1_2, Version::TLS1_2)
                .cipher_suites(vec![suites::TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256])
                .credential(ECDSA_CRED.clone())
                .knobs(TestKnobs {
                    pack_change_cipher_spec: true,
                    ..TestKnobs::default()
                })
                .build()
                .unwrap(),
        )
    };
    let (c, _) = handshake_and_chat(build(), build(), true);
    assert_eq!(c.version, Version::TLS1_2);
}

#[test]
fn dtls_tolerates_sequence_gaps() {
    // DTLS carries sequence numbers on the wire: a remap that only moves
    // forward reads as packet loss, which a datagram peer accepts.
    let client = Arc::new(
        Config::builder()
            .versions(Version::TLS1_2, Version::TLS1_2)
            .cipher_suites(vec![suites::TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256])
            .knobs(TestKnobs {
                sequence_number_mapping: Some(|seq| seq * 3 + 7),
                ..TestKnobs::default()
            })
            .build()
            .unwrap(),
    );
    let server = dtls_config(
        Version::TLS1_2,
        suites::TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256,
    );
    let (c, s) = handshake_and_chat(client, server, true);
    assert_eq!(c.version, Version::TLS1_2);
    assert_eq!(s.version, Version::TLS1_2);
}

#[test]
fn dtls12_resumption_by_ticket() {
    let client = Arc::new(
        Config::builder()
            .versions(Version::TLS1_2, Version::TLS1_2)
            .cipher_suites(vec![suites::TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256])
            .session_cache(Arc::new(timpl::session::SessionCache::new()))
            .build()
            .unwrap(),
    );
    let server = dtls_config(
        Version::TLS1_2,
        suites::TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256,
    );
    let (first, _) = handshake_and_chat(client.clone(), server.clone(), true);
    assert!(!first.did_resume);
    let (second, second_server) = handshake_and_chat(client, server, true);
    assert!(second.did_resume);
    assert!(second_server.did_resume);
}

#[test]
fn dtls13_application_data_verbatim() {
    let config = dtls_config(Version::TLS1_3, suites::TLS_AES_128_GCM_SHA256);
    let payload = vec![0xA5u8; 900];
    let expected = payload.clone();
    let ((), received) = run_pair(
        config.clone(),
        config,
        true,
        move |mut conn| {
            conn.handshake().unwrap();
            conn.write(&payload).unwrap();
        },
        move |mut conn| {
            conn.handshake().unwrap();
            let mut buf = vec![0u8; 2048];
            let n = conn.read(&mut buf).unwrap();
            buf.truncate(n);
            buf
        },
    );
    assert_eq!(received, expected);
}

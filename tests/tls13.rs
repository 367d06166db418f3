//! TLS 1.3 specifics: HelloRetryRequest, client authentication, KeyUpdate
//! and downgrade-sentinel detection.

mod common;

use std::sync::Arc;

use common::{handshake_and_chat, run_pair, ECDSA_CRED};
use timpl::{AlertDescription, ClientAuthPolicy, Config, Error, NamedGroup, TestKnobs, Version};

fn tls13_config() -> timpl::ConfigBuilder {
    Config::builder().versions(Version::TLS1_3, Version::TLS1_3)
}

#[test]
fn hello_retry_request_on_group_mismatch() {
    // The client's key share is X25519, but the server only speaks P-256,
    // which the client also offered. One retry completes the handshake.
    let client = Arc::new(
        tls13_config()
            .groups(vec![NamedGroup::X25519, NamedGroup::Secp256r1])
            .build()
            .unwrap(),
    );
    let server = Arc::new(
        tls13_config()
            .groups(vec![NamedGroup::Secp256r1])
            .credential(ECDSA_CRED.clone())
            .build()
            .unwrap(),
    );
    let (c, s) = handshake_and_chat(client, server, false);
    assert_eq!(c.version, Version::TLS1_3);
    assert_eq!(s.version, Version::TLS1_3);
}

#[test]
fn forced_hello_retry_request() {
    let client = Arc::new(
        tls13_config()
            .groups(vec![NamedGroup::X25519, NamedGroup::Secp256r1])
            .build()
            .unwrap(),
    );
    let server = Arc::new(
        tls13_config()
            .credential(ECDSA_CRED.clone())
            .knobs(TestKnobs {
                force_hello_retry_request: true,
                ..TestKnobs::default()
            })
            .build()
            .unwrap(),
    );
    let (c, _) = handshake_and_chat(client, server, false);
    assert_eq!(c.version, Version::TLS1_3);
}

#[test]
fn second_hello_retry_rejected_by_client() {
    let client = Arc::new(
        tls13_config()
            .groups(vec![NamedGroup::X25519, NamedGroup::Secp256r1])
            .build()
            .unwrap(),
    );
    let server = Arc::new(
        tls13_config()
            .credential(ECDSA_CRED.clone())
            .knobs(TestKnobs {
                force_second_hello_retry: true,
                ..TestKnobs::default()
            })
            .build()
            .unwrap(),
    );
    let (client_result, server_result) = run_pair(
        client,
        server,
        false,
        |mut conn| conn.handshake(),
        |mut conn| conn.handshake(),
    );
    assert!(
        matches!(client_result, Err(Error::UnexpectedMessage(_))),
        "client accepted a second HelloRetryRequest: {:?}",
        client_result
    );
    assert!(server_result.is_err());
}

#[test]
fn client_certificate_flow() {
    let client = Arc::new(
        tls13_config()
            .credential(ECDSA_CRED.clone())
            .build()
            .unwrap(),
    );
    let server = Arc::new(
        tls13_config()
            .credential(ECDSA_CRED.clone())
            .client_auth(ClientAuthPolicy::Require)
            .build()
            .unwrap(),
    );
    let (c, s) = handshake_and_chat(client, server, false);
    assert_eq!(s.peer_cert_count, 1);
    assert_eq!(c.peer_cert_count, 1);
}

#[test]
fn missing_client_certificate_tls13() {
    // No credential on the client; the server requires one. The server's
    // handshake fails and the client observes certificate_required on its
    // first read.
    let client = Arc::new(tls13_config().build().unwrap());
    let server = Arc::new(
        tls13_config()
            .credential(ECDSA_CRED.clone())
            .client_auth(ClientAuthPolicy::Require)
            .build()
            .unwrap(),
    );
    let (client_result, server_result) = run_pair(
        client,
        server,
        false,
        |mut conn| {
            conn.handshake()?;
            let mut buf = [0u8; 16];
            conn.read(&mut buf).map(|_| ())
        },
        |mut conn| conn.handshake(),
    );
    assert_eq!(server_result, Err(Error::CertificateRequired));
    assert_eq!(
        client_result,
        Err(Error::PeerAlert(AlertDescription::CertificateRequired))
    );
}

#[test]
fn missing_client_certificate_tls12() {
    let client = Arc::new(
        Config::builder()
            .versions(Version::TLS1_2, Version::TLS1_2)
            .build()
            .unwrap(),
    );
    let server = Arc::new(
        Config::builder()
            .versions(Version::TLS1_2, Version::TLS1_2)
            .credential(ECDSA_CRED.clone())
            .client_auth(ClientAuthPolicy::Require)
            .build()
            .unwrap(),
    );
    let (client_result, server_result) = run_pair(
        client,
        server,
        false,
        |mut conn| conn.handshake(),
        |mut conn| conn.handshake(),
    );
    assert!(matches!(server_result, Err(Error::HandshakeFailure(_))));
    assert_eq!(
        client_result,
        Err(Error::PeerAlert(AlertDescription::HandshakeFailure))
    );
}

#[test]
fn client_certificate_tls12() {
    let client = Arc::new(
        Config::builder()
            .versions(Version::TLS1_2, Version::TLS1_2)
            .credential(ECDSA_CRED.clone())
            .build()
            .unwrap(),
    );
    let server = Arc::new(
        Config::builder()
            .versions(Version::TLS1_2, Version::TLS1_2)
            .credential(ECDSA_CRED.clone())
            .client_auth(ClientAuthPolicy::Require)
            .build()
            .unwrap(),
    );
    let (_, s) = handshake_and_chat(client, server, false);
    assert_eq!(s.peer_cert_count, 1);
}

#[test]
fn key_update_round_trip() {
    let config = Arc::new(
        tls13_config()
            .credential(ECDSA_CRED.clone())
            .build()
            .unwrap(),
    );
    run_pair(
        config.clone(),
        config,
        false,
        |mut conn| {
            conn.handshake().unwrap();
            conn.send_key_update(true).unwrap();
            conn.write(b"post-rekey").unwrap();
            let mut buf = [0u8; 32];
            let n = conn.read(&mut buf).unwrap();
            assert_eq!(&buf[..n], b"echoed");
        },
        |mut conn| {
            conn.handshake().unwrap();
            let mut buf = [0u8; 32];
            let n = conn.read(&mut buf).unwrap();
            assert_eq!(&buf[..n], b"post-rekey");
            conn.write(b"echoed").unwrap();
        },
    );
}

#[test]
fn downgrade_sentinel_detected() {
    // A 1.2-capped server plants the 1.3 downgrade sentinel; a 1.3-capable
    // client must abort.
    let client = Arc::new(
        Config::builder()
            .versions(Version::TLS1_2, Version::TLS1_3)
            .build()
            .unwrap(),
    );
    let server = Arc::new(
        Config::builder()
            .versions(Version::TLS1_2, Version::TLS1_2)
            .credential(ECDSA_CRED.clone())
            .knobs(TestKnobs {
                send_downgrade_sentinel: true,
                ..TestKnobs::default()
            })
            .build()
            .unwrap(),
    );
    let (client_result, _server_result) = run_pair(
        client,
        server,
        false,
        |mut conn| conn.handshake(),
        |mut conn| conn.handshake(),
    );
    assert!(
        matches!(client_result, Err(Error::IllegalParameter(_))),
        "downgrade sentinel not detected: {:?}",
        client_result
    );
}

#[test]
fn sequence_remap_breaks_stream_records() {
    // Remapped sequence numbers desynchronize the implicit TLS counters;
    // the peer must fail the record MAC.
    let client = Arc::new(
        tls13_config()
            .knobs(TestKnobs {
                sequence_number_mapping: Some(|seq| seq * 2 + 5),
                ..TestKnobs::default()
            })
            .build()
            .unwrap(),
    );
    let server = Arc::new(
        tls13_config()
            .credential(ECDSA_CRED.clone())
            .build()
            .unwrap(),
    );
    let (_client_result, server_result) = run_pair(
        client,
        server,
        false,
        |mut conn| conn.handshake(),
        |mut conn| conn.handshake(),
    );
    assert!(
        matches!(server_result, Err(Error::BadRecordMac)),
        "remapped sequence accepted: {:?}",
        server_result
    );
}

use std::io;

use thiserror::Error;

use crate::types::{AlertDescription, AlertLevel};

/// Errors produced by the engine.
///
/// Errors are `Clone` because a failed handshake poisons the connection: the
/// same error is handed back on every subsequent call (transport errors are
/// therefore stored by message, not as `io::Error`).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum Error {
    /// Unparsable or internally inconsistent message.
    #[error("decode error: {0}")]
    Decode(String),

    /// A well-formed message arrived where the protocol does not allow it.
    #[error("unexpected message: {0}")]
    UnexpectedMessage(String),

    /// A field value violates the protocol.
    #[error("illegal parameter: {0}")]
    IllegalParameter(String),

    /// No cipher suite acceptable to both peers.
    #[error("no shared cipher suite")]
    NoSharedCipher,

    /// No key exchange group acceptable to both peers.
    #[error("no shared key exchange group")]
    NoSharedGroup,

    /// Credential selection found no signature algorithm both sides accept.
    #[error("no common signature algorithms")]
    NoCommonSignatureAlgorithms,

    /// Credential selection found no certificate chaining to a requested issuer.
    #[error("no credential matches the requested issuers")]
    NoMatchingIssuer,

    /// Credential selection rejected an ECDSA certificate on an unoffered curve.
    #[error("certificate curve not offered by peer")]
    WrongCurve,

    /// Credential key type fits none of the offered cipher suites.
    #[error("unknown certificate type")]
    UnknownCertificateType,

    /// Generic negotiation failure.
    #[error("handshake failure: {0}")]
    HandshakeFailure(String),

    /// ALPN lists did not intersect.
    #[error("no common application protocol")]
    NoApplicationProtocol,

    /// Record failed to decrypt or its MAC/padding did not verify.
    #[error("bad record MAC")]
    BadRecordMac,

    /// A handshake signature or Finished MAC did not verify.
    #[error("decrypt error: {0}")]
    DecryptError(String),

    /// Peer certificate was unusable.
    #[error("bad certificate: {0}")]
    BadCertificate(String),

    /// Client authentication was required but no certificate arrived.
    #[error("client certificate required")]
    CertificateRequired,

    /// Version negotiation failed or a record carried the wrong version.
    #[error("protocol version: {0}")]
    ProtocolVersion(String),

    /// Record larger than the protocol allows.
    #[error("record overflow")]
    RecordOverflow,

    /// Sequence number wrapped under a single cipher epoch.
    #[error("sequence number wraparound")]
    SequenceOverflow,

    /// Local usage or state error.
    #[error("internal error: {0}")]
    Internal(String),

    /// Invalid configuration.
    #[error("config error: {0}")]
    Config(String),

    /// Transport read/write failure. No alert is sent for these.
    #[error("transport: {0}")]
    Transport(String),

    /// The peer sent a fatal alert.
    #[error("remote alert: {0}")]
    PeerAlert(AlertDescription),

    /// The peer closed the connection cleanly.
    #[error("connection closed by peer")]
    CloseNotify,
}

impl Error {
    /// The alert to send the peer for this error, if any.
    ///
    /// Transport errors and peer-initiated conditions produce no alert: the
    /// peer either caused them or will never see one.
    pub fn alert(&self) -> Option<(AlertLevel, AlertDescription)> {
        use AlertDescription as A;
        let desc = match self {
            Error::Decode(_) => A::DecodeError,
            Error::UnexpectedMessage(_) => A::UnexpectedMessage,
            Error::IllegalParameter(_) => A::IllegalParameter,
            Error::NoSharedCipher
            | Error::NoSharedGroup
            | Error::NoCommonSignatureAlgorithms
            | Error::NoMatchingIssuer
            | Error::WrongCurve
            | Error::UnknownCertificateType
            | Error::HandshakeFailure(_) => A::HandshakeFailure,
            Error::NoApplicationProtocol => A::NoApplicationProtocol,
            Error::BadRecordMac => A::BadRecordMac,
            Error::DecryptError(_) => A::DecryptError,
            Error::BadCertificate(_) => A::BadCertificate,
            Error::CertificateRequired => A::CertificateRequired,
            Error::ProtocolVersion(_) => A::ProtocolVersion,
            Error::RecordOverflow => A::RecordOverflow,
            Error::SequenceOverflow | Error::Internal(_) => A::InternalError,
            Error::Config(_) => A::InternalError,
            Error::Transport(_) | Error::PeerAlert(_) | Error::CloseNotify => return None,
        };
        Some((AlertLevel::Fatal, desc))
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Transport(e.to_string())
    }
}

impl<I> From<nom::Err<nom::error::Error<I>>> for Error {
    fn from(e: nom::Err<nom::error::Error<I>>) -> Self {
        let what = match e {
            nom::Err::Incomplete(_) => "truncated input",
            nom::Err::Error(_) => "malformed input",
            nom::Err::Failure(_) => "invalid structure",
        };
        Error::Decode(what.to_string())
    }
}

//! Handshake message codecs.
//!
//! Each message type parses from and serializes to the exact wire bytes.
//! Handshake bodies never include the handshake header; the connection
//! layer frames them (4 bytes for TLS, 12 for DTLS) and feeds the
//! TLS-framed encoding to the transcript.

mod certificate;
pub(crate) mod certificate_request;
mod certificate_verify;
mod client_hello;
mod client_key_exchange;
pub(crate) mod extensions;
mod finished;
mod server_hello;
mod server_key_exchange;
mod session_ticket;

pub use certificate::{Certificate12, Certificate13, CertificateEntry};
pub use certificate_request::{CertificateRequest12, CertificateRequest13, CLIENT_CERT_TYPE_ECDSA_SIGN, CLIENT_CERT_TYPE_RSA_SIGN};
pub use certificate_verify::CertificateVerify;
pub use client_hello::ClientHello;
pub use client_key_exchange::ClientKeyExchange;
pub use extensions::{KeyShareEntry, PskIdentity, PskOffer, PSK_MODE_DHE_KE};
pub use finished::{EncryptedExtensions, Finished, KeyUpdate};
pub use server_hello::{
    HelloVerifyRequest, ServerHello, DOWNGRADE_TLS12, DOWNGRADE_TLS13, HELLO_RETRY_REQUEST_RANDOM,
};
pub use server_key_exchange::{ServerEcdheParams, ServerKeyExchange};
pub use session_ticket::{NewSessionTicket12, NewSessionTicket13};

use nom::bytes::complete::take;
use nom::number::complete::{be_u16, be_u24, be_u8};
use nom::IResult;

use crate::codec::{put_u16, put_u24, put_u8, vec_u16, LengthPrefix};
use crate::types::{AlertDescription, AlertLevel, ExtensionType, HandshakeType};
use crate::Error;

/// TLS handshake header: 1-byte type, 3-byte length.
pub const TLS_HANDSHAKE_HEADER_LEN: usize = 4;
/// DTLS adds message_seq (2), fragment_offset (3) and fragment_length (3).
pub const DTLS_HANDSHAKE_HEADER_LEN: usize = 12;

/// A complete handshake message: parsed header fields plus its body, and
/// the TLS-framed encoding destined for the transcript.
#[derive(Debug, Clone)]
pub struct HandshakeMessage {
    pub typ: HandshakeType,
    pub body: Vec<u8>,
}

impl HandshakeMessage {
    pub fn new(typ: HandshakeType, body: Vec<u8>) -> HandshakeMessage {
        HandshakeMessage { typ, body }
    }

    /// TLS framing: used on stream transports and fed to the transcript on
    /// both transports.
    pub fn tls_encoding(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(TLS_HANDSHAKE_HEADER_LEN + self.body.len());
        put_u8(&mut out, self.typ.as_u8());
        put_u24(&mut out, self.body.len() as u32);
        out.extend_from_slice(&self.body);
        out
    }
}

/// DTLS fragment header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DtlsFragmentHeader {
    pub typ: HandshakeType,
    pub length: u32,
    pub message_seq: u16,
    pub fragment_offset: u32,
    pub fragment_length: u32,
}

impl DtlsFragmentHeader {
    pub fn parse(input: &[u8]) -> IResult<&[u8], DtlsFragmentHeader> {
        let (input, typ) = HandshakeType::parse(input)?;
        let (input, length) = be_u24(input)?;
        let (input, message_seq) = be_u16(input)?;
        let (input, fragment_offset) = be_u24(input)?;
        let (input, fragment_length) = be_u24(input)?;
        Ok((
            input,
            DtlsFragmentHeader {
                typ,
                length,
                message_seq,
                fragment_offset,
                fragment_length,
            },
        ))
    }

    pub fn serialize(&self, out: &mut Vec<u8>) {
        put_u8(out, self.typ.as_u8());
        put_u24(out, self.length);
        put_u16(out, self.message_seq);
        put_u24(out, self.fragment_offset);
        put_u24(out, self.fragment_length);
    }
}

/// One raw extension: type plus opaque payload. Typed accessors live on the
/// messages that carry them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extension {
    pub typ: ExtensionType,
    pub data: Vec<u8>,
}

impl Extension {
    pub fn new(typ: ExtensionType, data: Vec<u8>) -> Extension {
        Extension { typ, data }
    }

    pub fn parse(input: &[u8]) -> IResult<&[u8], Extension> {
        let (input, typ) = ExtensionType::parse(input)?;
        let (input, data) = vec_u16(input)?;
        Ok((
            input,
            Extension {
                typ,
                data: data.to_vec(),
            },
        ))
    }

    pub fn serialize(&self, out: &mut Vec<u8>) {
        put_u16(out, self.typ.as_u16());
        let mark = LengthPrefix::u16(out);
        out.extend_from_slice(&self.data);
        mark.finish(out);
    }
}

/// Parse a u16-length-prefixed extension block.
pub(crate) fn parse_extensions(input: &[u8]) -> IResult<&[u8], Vec<Extension>> {
    let (input, mut block) = vec_u16(input)?;
    let mut extensions = Vec::new();
    while !block.is_empty() {
        let (rest, ext) = Extension::parse(block)?;
        extensions.push(ext);
        block = rest;
    }
    Ok((input, extensions))
}

pub(crate) fn serialize_extensions(out: &mut Vec<u8>, extensions: &[Extension]) {
    let mark = LengthPrefix::u16(out);
    for ext in extensions {
        ext.serialize(out);
    }
    mark.finish(out);
}

pub(crate) fn find_extension<'a>(
    extensions: &'a [Extension],
    typ: ExtensionType,
) -> Option<&'a [u8]> {
    extensions
        .iter()
        .find(|e| e.typ == typ)
        .map(|e| e.data.as_slice())
}

/// An alert record body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Alert {
    pub level: AlertLevel,
    pub description: AlertDescription,
}

impl Alert {
    pub fn parse_body(body: &[u8]) -> Result<Alert, Error> {
        if body.len() != 2 {
            return Err(Error::Decode("alert body must be 2 bytes".to_string()));
        }
        Ok(Alert {
            level: AlertLevel::from_u8(body[0]),
            description: AlertDescription::from_u8(body[1]),
        })
    }

    pub fn serialize(&self) -> [u8; 2] {
        [self.level.as_u8(), self.description.as_u8()]
    }
}

/// Parse a TLS-framed handshake message from a buffer, if one is complete.
/// Returns the message and the number of bytes consumed.
pub fn parse_tls_handshake(buf: &[u8]) -> Result<Option<(HandshakeMessage, usize)>, Error> {
    if buf.len() < TLS_HANDSHAKE_HEADER_LEN {
        return Ok(None);
    }
    let typ = HandshakeType::from_u8(buf[0]);
    let length = u32::from_be_bytes([0, buf[1], buf[2], buf[3]]) as usize;
    if length > MAX_HANDSHAKE_LEN {
        return Err(Error::Decode(format!("oversized handshake message ({})", length)));
    }
    if buf.len() < TLS_HANDSHAKE_HEADER_LEN + length {
        return Ok(None);
    }
    let body = buf[TLS_HANDSHAKE_HEADER_LEN..TLS_HANDSHAKE_HEADER_LEN + length].to_vec();
    Ok(Some((
        HandshakeMessage::new(typ, body),
        TLS_HANDSHAKE_HEADER_LEN + length,
    )))
}

/// Sanity bound on handshake message length (certificates can be large, but
/// nothing legitimate approaches this).
pub const MAX_HANDSHAKE_LEN: usize = 0x40000;

pub(crate) fn take_opaque8(input: &[u8]) -> IResult<&[u8], Vec<u8>> {
    let (input, len) = be_u8(input)?;
    let (input, data) = take(len as usize)(input)?;
    Ok((input, data.to_vec()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tls_framing_round_trip() {
        let msg = HandshakeMessage::new(HandshakeType::Finished, vec![1, 2, 3]);
        let framed = msg.tls_encoding();
        assert_eq!(framed, vec![20, 0, 0, 3, 1, 2, 3]);
        let (parsed, used) = parse_tls_handshake(&framed).unwrap().unwrap();
        assert_eq!(used, framed.len());
        assert_eq!(parsed.typ, HandshakeType::Finished);
        assert_eq!(parsed.body, vec![1, 2, 3]);
    }

    #[test]
    fn incomplete_handshake_returns_none() {
        assert!(parse_tls_handshake(&[20, 0, 0]).unwrap().is_none());
        assert!(parse_tls_handshake(&[20, 0, 0, 5, 1, 2]).unwrap().is_none());
    }

    #[test]
    fn dtls_fragment_header_round_trip() {
        let hdr = DtlsFragmentHeader {
            typ: HandshakeType::ClientHello,
            length: 300,
            message_seq: 2,
            fragment_offset: 100,
            fragment_length: 150,
        };
        let mut out = Vec::new();
        hdr.serialize(&mut out);
        assert_eq!(out.len(), DTLS_HANDSHAKE_HEADER_LEN);
        let (rest, parsed) = DtlsFragmentHeader::parse(&out).unwrap();
        assert!(rest.is_empty());
        assert_eq!(parsed, hdr);
    }

    #[test]
    fn extension_block_round_trip() {
        let exts = vec![
            Extension::new(ExtensionType::ServerName, vec![0, 1, 2]),
            Extension::new(ExtensionType::KeyShare, vec![]),
        ];
        let mut out = Vec::new();
        serialize_extensions(&mut out, &exts);
        let (rest, parsed) = parse_extensions(&out).unwrap();
        assert!(rest.is_empty());
        assert_eq!(parsed, exts);
        assert_eq!(
            find_extension(&parsed, ExtensionType::KeyShare),
            Some(&[][..])
        );
        assert_eq!(find_extension(&parsed, ExtensionType::Cookie), None);
    }
}

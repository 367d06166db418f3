use nom::number::complete::{be_u16, be_u8};
use nom::IResult;

use crate::codec::{put_u16, put_u8, vec_u16, vec_u8, LengthPrefix};
use crate::types::{CompressionMethod, ExtensionType};

use super::extensions::KeyShareEntry;
use super::{find_extension, parse_extensions, serialize_extensions, Extension};

/// The fixed random value that turns a ServerHello into a
/// HelloRetryRequest (RFC 8446 section 4.1.3).
pub const HELLO_RETRY_REQUEST_RANDOM: [u8; 32] = [
    0xCF, 0x21, 0xAD, 0x74, 0xE5, 0x9A, 0x61, 0x11, 0xBE, 0x1D, 0x8C, 0x02, 0x1E, 0x65, 0xB8,
    0x91, 0xC2, 0xA2, 0x11, 0x16, 0x7A, 0xBB, 0x8C, 0x5E, 0x07, 0x9E, 0x09, 0xE2, 0xC8, 0xA8,
    0x33, 0x9C,
];

/// Sentinels occupying the last 8 bytes of ServerHello.random when a
/// server negotiated a lower version than its best (RFC 8446 section 4.1.3).
pub const DOWNGRADE_TLS13: [u8; 8] = [0x44, 0x4F, 0x57, 0x4E, 0x47, 0x52, 0x44, 0x01];
pub const DOWNGRADE_TLS12: [u8; 8] = [0x44, 0x4F, 0x57, 0x4E, 0x47, 0x52, 0x44, 0x00];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerHello {
    pub server_version: u16,
    pub random: [u8; 32],
    pub session_id: Vec<u8>,
    pub cipher_suite: u16,
    pub compression_method: CompressionMethod,
    pub extensions: Vec<Extension>,
}

impl ServerHello {
    pub fn parse(input: &[u8]) -> IResult<&[u8], ServerHello> {
        let (input, server_version) = be_u16(input)?;
        let (input, random) = nom::bytes::complete::take(32usize)(input)?;
        let (input, session_id) = vec_u8(input)?;
        let (input, cipher_suite) = be_u16(input)?;
        let (input, compression_method) = CompressionMethod::parse(input)?;
        let (input, extensions) = if input.is_empty() {
            (input, Vec::new())
        } else {
            parse_extensions(input)?
        };
        Ok((
            input,
            ServerHello {
                server_version,
                random: random.try_into().expect("32-byte take"),
                session_id: session_id.to_vec(),
                cipher_suite,
                compression_method,
                extensions,
            },
        ))
    }

    pub fn serialize(&self, out: &mut Vec<u8>) {
        put_u16(out, self.server_version);
        out.extend_from_slice(&self.random);
        let mark = LengthPrefix::u8(out);
        out.extend_from_slice(&self.session_id);
        mark.finish(out);
        put_u16(out, self.cipher_suite);
        put_u8(out, self.compression_method.as_u8());
        if !self.extensions.is_empty() {
            serialize_extensions(out, &self.extensions);
        }
    }

    pub fn is_hello_retry_request(&self) -> bool {
        self.random == HELLO_RETRY_REQUEST_RANDOM
    }

    fn ext(&self, typ: ExtensionType) -> Option<&[u8]> {
        find_extension(&self.extensions, typ)
    }

    pub fn has_extension(&self, typ: ExtensionType) -> bool {
        self.ext(typ).is_some()
    }

    /// The negotiated wire version from supported_versions, if present.
    pub fn selected_version(&self) -> Option<u16> {
        let data = self.ext(ExtensionType::SupportedVersions)?;
        be_u16::<_, nom::error::Error<&[u8]>>(data).ok().map(|(_, v)| v)
    }

    /// The server's key_share entry (ServerHello form: a single entry).
    pub fn key_share(&self) -> Option<KeyShareEntry> {
        let data = self.ext(ExtensionType::KeyShare)?;
        KeyShareEntry::parse(data).ok().map(|(_, e)| e)
    }

    /// The group in a HelloRetryRequest key_share (just the group id).
    pub fn retry_group(&self) -> Option<u16> {
        let data = self.ext(ExtensionType::KeyShare)?;
        be_u16::<_, nom::error::Error<&[u8]>>(data).ok().map(|(_, g)| g)
    }

    pub fn cookie(&self) -> Option<Vec<u8>> {
        let data = self.ext(ExtensionType::Cookie)?;
        vec_u16(data).ok().map(|(_, c)| c.to_vec())
    }

    /// The accepted PSK index from pre_shared_key.
    pub fn selected_psk(&self) -> Option<u16> {
        let data = self.ext(ExtensionType::PreSharedKey)?;
        be_u16::<_, nom::error::Error<&[u8]>>(data).ok().map(|(_, v)| v)
    }

    pub fn extended_master_secret(&self) -> bool {
        self.has_extension(ExtensionType::ExtendedMasterSecret)
    }

    pub fn offers_session_ticket(&self) -> bool {
        self.has_extension(ExtensionType::SessionTicket)
    }

    pub fn alpn_protocol(&self) -> Option<Vec<u8>> {
        let data = self.ext(ExtensionType::Alpn)?;
        super::extensions::parse_alpn_list(data)
            .ok()
            .and_then(|(_, mut protocols)| {
                if protocols.len() == 1 {
                    Some(protocols.remove(0))
                } else {
                    None
                }
            })
    }
}

/// DTLS HelloVerifyRequest: version plus a stateless cookie.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HelloVerifyRequest {
    pub server_version: u16,
    pub cookie: Vec<u8>,
}

impl HelloVerifyRequest {
    pub fn parse(input: &[u8]) -> IResult<&[u8], HelloVerifyRequest> {
        let (input, server_version) = be_u16(input)?;
        let (input, cookie) = vec_u8(input)?;
        Ok((
            input,
            HelloVerifyRequest {
                server_version,
                cookie: cookie.to_vec(),
            },
        ))
    }

    pub fn serialize(&self, out: &mut Vec<u8>) {
        put_u16(out, self.server_version);
        let mark = LengthPrefix::u8(out);
        out.extend_from_slice(&self.cookie);
        mark.finish(out);
    }

}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let hello = ServerHello {
            server_version: 0x0303,
            random: [3; 32],
            session_id: vec![],
            cipher_suite: 0x1301,
            compression_method: CompressionMethod::Null,
            extensions: vec![Extension::new(
                ExtensionType::SupportedVersions,
                vec![0x03, 0x04],
            )],
        };
        let mut out = Vec::new();
        hello.serialize(&mut out);
        let (rest, parsed) = ServerHello::parse(&out).unwrap();
        assert!(rest.is_empty());
        assert_eq!(parsed, hello);
        assert_eq!(parsed.selected_version(), Some(0x0304));
        assert!(!parsed.is_hello_retry_request());
    }

    #[test]
    fn hrr_detection_by_random() {
        let mut hello = ServerHello {
            server_version: 0x0303,
            random: HELLO_RETRY_REQUEST_RANDOM,
            session_id: vec![],
            cipher_suite: 0x1301,
            compression_method: CompressionMethod::Null,
            extensions: vec![Extension::new(ExtensionType::KeyShare, vec![0x00, 0x17])],
        };
        assert!(hello.is_hello_retry_request());
        assert_eq!(hello.retry_group(), Some(0x0017));
        hello.random[0] ^= 1;
        assert!(!hello.is_hello_retry_request());
    }

    #[test]
    fn hello_verify_round_trip() {
        let hvr = HelloVerifyRequest {
            server_version: 0xFEFF,
            cookie: vec![0xAB; 20],
        };
        let mut out = Vec::new();
        hvr.serialize(&mut out);
        let (rest, parsed) = HelloVerifyRequest::parse(&out).unwrap();
        assert!(rest.is_empty());
        assert_eq!(parsed, hvr);
    }
}

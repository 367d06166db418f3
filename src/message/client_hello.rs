use nom::number::complete::be_u16;
use nom::IResult;

use crate::codec::{put_u16, put_u8, vec_u16, vec_u8, LengthPrefix};
use crate::types::{CompressionMethod, ExtensionType, NamedGroup, SignatureScheme};

use super::extensions::{
    parse_alpn_list, parse_named_group_list, parse_psk_modes, parse_server_name,
    parse_supported_versions_list, parse_u16_list, KeyShareEntry, PskOffer,
};
use super::{find_extension, parse_extensions, serialize_extensions, Extension};

/// ClientHello. The cookie field only exists on the DTLS wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientHello {
    pub client_version: u16,
    pub random: [u8; 32],
    pub session_id: Vec<u8>,
    /// DTLS-only HelloVerifyRequest cookie; `None` on stream transports.
    pub cookie: Option<Vec<u8>>,
    pub cipher_suites: Vec<u16>,
    pub compression_methods: Vec<CompressionMethod>,
    pub extensions: Vec<Extension>,
}

impl ClientHello {
    pub fn parse(input: &[u8], is_dtls: bool) -> IResult<&[u8], ClientHello> {
        let (input, client_version) = be_u16(input)?;
        let (input, random) = nom::bytes::complete::take(32usize)(input)?;
        let (input, session_id) = vec_u8(input)?;
        let (input, cookie) = if is_dtls {
            let (input, cookie) = vec_u8(input)?;
            (input, Some(cookie.to_vec()))
        } else {
            (input, None)
        };
        let (input, mut suite_block) = vec_u16(input)?;
        let mut cipher_suites = Vec::new();
        while !suite_block.is_empty() {
            let (rest, id) = be_u16(suite_block)?;
            cipher_suites.push(id);
            suite_block = rest;
        }
        let (input, comp_block) = vec_u8(input)?;
        let compression_methods = comp_block
            .iter()
            .map(|b| CompressionMethod::from_u8(*b))
            .collect();
        let (input, extensions) = if input.is_empty() {
            (input, Vec::new())
        } else {
            parse_extensions(input)?
        };

        Ok((
            input,
            ClientHello {
                client_version,
                random: random.try_into().expect("32-byte take"),
                session_id: session_id.to_vec(),
                cookie,
                cipher_suites,
                compression_methods,
                extensions,
            },
        ))
    }

    pub fn serialize(&self, out: &mut Vec<u8>) {
        put_u16(out, self.client_version);
        out.extend_from_slice(&self.random);
        let mark = LengthPrefix::u8(out);
        out.extend_from_slice(&self.session_id);
        mark.finish(out);
        if let Some(cookie) = &self.cookie {
            let mark = LengthPrefix::u8(out);
            out.extend_from_slice(cookie);
            mark.finish(out);
        }
        let mark = LengthPrefix::u16(out);
        for suite in &self.cipher_suites {
            put_u16(out, *suite);
        }
        mark.finish(out);
        let mark = LengthPrefix::u8(out);
        for m in &self.compression_methods {
            put_u8(out, m.as_u8());
        }
        mark.finish(out);
        if !self.extensions.is_empty() {
            serialize_extensions(out, &self.extensions);
        }
    }

    fn ext(&self, typ: ExtensionType) -> Option<&[u8]> {
        find_extension(&self.extensions, typ)
    }

    pub fn has_extension(&self, typ: ExtensionType) -> bool {
        self.ext(typ).is_some()
    }

    pub fn server_name(&self) -> Option<Vec<u8>> {
        let data = self.ext(ExtensionType::ServerName)?;
        parse_server_name(data).ok().map(|(_, name)| name)
    }

    pub fn supported_groups(&self) -> Vec<NamedGroup> {
        self.ext(ExtensionType::SupportedGroups)
            .and_then(|d| parse_named_group_list(d).ok())
            .map(|(_, groups)| groups)
            .unwrap_or_default()
    }

    pub fn signature_schemes(&self) -> Vec<SignatureScheme> {
        self.ext(ExtensionType::SignatureAlgorithms)
            .and_then(|d| parse_u16_list(d).ok())
            .map(|(_, ids)| ids.into_iter().map(SignatureScheme::from_u16).collect())
            .unwrap_or_default()
    }

    pub fn alpn_protocols(&self) -> Vec<Vec<u8>> {
        self.ext(ExtensionType::Alpn)
            .and_then(|d| parse_alpn_list(d).ok())
            .map(|(_, p)| p)
            .unwrap_or_default()
    }

    /// Logical wire versions from supported_versions, in client preference
    /// order. Empty when the extension is absent.
    pub fn supported_versions(&self) -> Vec<u16> {
        self.ext(ExtensionType::SupportedVersions)
            .and_then(|d| parse_supported_versions_list(d).ok())
            .map(|(_, v)| v)
            .unwrap_or_default()
    }

    pub fn key_shares(&self) -> Vec<KeyShareEntry> {
        self.ext(ExtensionType::KeyShare)
            .and_then(|d| KeyShareEntry::parse_list(d).ok())
            .map(|(_, entries)| entries)
            .unwrap_or_default()
    }

    pub fn psk_offer(&self) -> Option<PskOffer> {
        let data = self.ext(ExtensionType::PreSharedKey)?;
        PskOffer::parse(data).ok().map(|(_, offer)| offer)
    }

    pub fn psk_modes(&self) -> Vec<u8> {
        self.ext(ExtensionType::PskKeyExchangeModes)
            .and_then(|d| parse_psk_modes(d).ok())
            .map(|(_, m)| m)
            .unwrap_or_default()
    }

    pub fn session_ticket(&self) -> Option<&[u8]> {
        self.ext(ExtensionType::SessionTicket)
    }

    pub fn cookie_extension(&self) -> Option<Vec<u8>> {
        let data = self.ext(ExtensionType::Cookie)?;
        vec_u16(data).ok().map(|(_, c)| c.to_vec())
    }

    /// DER distinguished names from certificate_authorities, the client's
    /// trust-anchor constraint on the server's credential.
    pub fn certificate_authorities(&self) -> Vec<Vec<u8>> {
        let Some(data) = self.ext(ExtensionType::CertificateAuthorities) else {
            return Vec::new();
        };
        let Ok((_, mut block)) = vec_u16(data) else {
            return Vec::new();
        };
        let mut cas = Vec::new();
        while !block.is_empty() {
            let Ok((rest, name)) = vec_u16(block) else {
                return cas;
            };
            cas.push(name.to_vec());
            block = rest;
        }
        cas
    }

    pub fn offers_extended_master_secret(&self) -> bool {
        self.has_extension(ExtensionType::ExtendedMasterSecret)
    }

    pub fn offers_early_data(&self) -> bool {
        self.has_extension(ExtensionType::EarlyData)
    }

    /// The serialized hello truncated just before the PSK binder list, the
    /// input to binder computation. `None` if no PSK offer is present.
    pub fn truncated_for_binders(&self) -> Option<Vec<u8>> {
        let offer = self.psk_offer()?;
        let binder_lens: Vec<usize> = offer.binders.iter().map(|b| b.len()).collect();
        let mut full = Vec::new();
        self.serialize(&mut full);
        let cut = full.len() - PskOffer::binders_wire_len(&binder_lens);
        Some(full[..cut].to_vec())
    }

    /// Compare two hellos for the HelloRetryRequest rule: the retry hello
    /// must be identical except for the cookie, key_share and PSK
    /// (binder) extensions. Returns the name of the first illegal
    /// difference, if any.
    pub fn illegal_retry_difference(&self, retry: &ClientHello) -> Option<&'static str> {
        if self.client_version != retry.client_version {
            return Some("client_version");
        }
        if self.random != retry.random {
            return Some("random");
        }
        if self.session_id != retry.session_id {
            return Some("session_id");
        }
        if self.cipher_suites != retry.cipher_suites {
            return Some("cipher_suites");
        }
        if self.compression_methods != retry.compression_methods {
            return Some("compression_methods");
        }

        let changeable = [
            ExtensionType::Cookie,
            ExtensionType::KeyShare,
            ExtensionType::PreSharedKey,
            ExtensionType::EarlyData,
        ];
        let filter = |extensions: &[Extension]| -> Vec<Extension> {
            extensions
                .iter()
                .filter(|e| !changeable.contains(&e.typ))
                .cloned()
                .collect()
        };
        if filter(&self.extensions) != filter(&retry.extensions) {
            return Some("extensions");
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::extensions::serialize_named_group_list;

    fn sample(is_dtls: bool) -> ClientHello {
        let mut groups = Vec::new();
        serialize_named_group_list(
            &[NamedGroup::X25519, NamedGroup::Secp256r1],
            &mut groups,
        );
        ClientHello {
            client_version: 0x0303,
            random: [7; 32],
            session_id: vec![1; 32],
            cookie: if is_dtls { Some(vec![9; 16]) } else { None },
            cipher_suites: vec![0x1301, 0xC02F],
            compression_methods: vec![CompressionMethod::Null],
            extensions: vec![Extension::new(ExtensionType::SupportedGroups, groups)],
        }
    }

    #[test]
    fn round_trip_tls_and_dtls() {
        for is_dtls in [false, true] {
            let hello = sample(is_dtls);
            let mut out = Vec::new();
            hello.serialize(&mut out);
            let (rest, parsed) = ClientHello::parse(&out, is_dtls).unwrap();
            assert!(rest.is_empty());
            assert_eq!(parsed, hello);
        }
    }

    #[test]
    fn typed_accessors() {
        let hello = sample(false);
        assert_eq!(
            hello.supported_groups(),
            vec![NamedGroup::X25519, NamedGroup::Secp256r1]
        );
        assert!(hello.signature_schemes().is_empty());
        assert!(!hello.offers_extended_master_secret());
    }

    #[test]
    fn retry_diff_allows_cookie_and_key_share() {
        let first = sample(false);
        let mut retry = first.clone();
        retry
            .extensions
            .push(Extension::new(ExtensionType::Cookie, vec![0, 1, 0xAB]));
        retry
            .extensions
            .push(Extension::new(ExtensionType::KeyShare, vec![0, 0]));
        assert_eq!(first.illegal_retry_difference(&retry), None);
    }

    #[test]
    fn retry_diff_rejects_changed_suites() {
        let first = sample(false);
        let mut retry = first.clone();
        retry.cipher_suites = vec![0x1301];
        assert_eq!(
            first.illegal_retry_difference(&retry),
            Some("cipher_suites")
        );
    }

    #[test]
    fn retry_diff_rejects_changed_random() {
        let first = sample(false);
        let mut retry = first.clone();
        retry.random[0] ^= 1;
        assert_eq!(first.illegal_retry_difference(&retry), Some("random"));
    }
}

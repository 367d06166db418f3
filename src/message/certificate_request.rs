use nom::IResult;

use crate::codec::{put_u16, vec_u16, vec_u8, LengthPrefix};
use crate::types::{ExtensionType, SignatureScheme, Version};

use super::extensions::parse_u16_list;
use super::{find_extension, parse_extensions, serialize_extensions, take_opaque8, Extension};

pub const CLIENT_CERT_TYPE_RSA_SIGN: u8 = 1;
pub const CLIENT_CERT_TYPE_ECDSA_SIGN: u8 = 64;

/// Pre-1.3 CertificateRequest. The signature_algorithms block only exists
/// from TLS 1.2.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateRequest12 {
    pub certificate_types: Vec<u8>,
    pub signature_schemes: Vec<SignatureScheme>,
    pub certificate_authorities: Vec<Vec<u8>>,
}

impl CertificateRequest12 {
    pub fn parse(input: &[u8], version: Version) -> IResult<&[u8], CertificateRequest12> {
        let (input, certificate_types) = vec_u8(input)?;
        let (input, signature_schemes) = if version >= Version::TLS1_2 {
            let (input, ids) = parse_u16_list(input)?;
            (
                input,
                ids.into_iter().map(SignatureScheme::from_u16).collect(),
            )
        } else {
            (input, Vec::new())
        };
        let (input, mut ca_block) = vec_u16(input)?;
        let mut certificate_authorities = Vec::new();
        while !ca_block.is_empty() {
            let (rest, name) = vec_u16(ca_block)?;
            certificate_authorities.push(name.to_vec());
            ca_block = rest;
        }
        Ok((
            input,
            CertificateRequest12 {
                certificate_types: certificate_types.to_vec(),
                signature_schemes,
                certificate_authorities,
            },
        ))
    }

    pub fn serialize(&self, out: &mut Vec<u8>, version: Version) {
        let mark = LengthPrefix::u8(out);
        out.extend_from_slice(&self.certificate_types);
        mark.finish(out);
        if version >= Version::TLS1_2 {
            let mark = LengthPrefix::u16(out);
            for scheme in &self.signature_schemes {
                put_u16(out, scheme.as_u16());
            }
            mark.finish(out);
        }
        let mark = LengthPrefix::u16(out);
        for ca in &self.certificate_authorities {
            let m = LengthPrefix::u16(out);
            out.extend_from_slice(ca);
            m.finish(out);
        }
        mark.finish(out);
    }
}

/// TLS 1.3 CertificateRequest: context plus extension block; the
/// constraints all live in extensions.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CertificateRequest13 {
    pub context: Vec<u8>,
    pub extensions: Vec<Extension>,
}

impl CertificateRequest13 {
    pub fn parse(input: &[u8]) -> IResult<&[u8], CertificateRequest13> {
        let (input, context) = take_opaque8(input)?;
        let (input, extensions) = parse_extensions(input)?;
        Ok((
            input,
            CertificateRequest13 {
                context,
                extensions,
            },
        ))
    }

    pub fn serialize(&self, out: &mut Vec<u8>) {
        let mark = LengthPrefix::u8(out);
        out.extend_from_slice(&self.context);
        mark.finish(out);
        serialize_extensions(out, &self.extensions);
    }

    pub fn with_signature_schemes(schemes: &[SignatureScheme]) -> CertificateRequest13 {
        let mut data = Vec::new();
        let mark = LengthPrefix::u16(&mut data);
        for scheme in schemes {
            put_u16(&mut data, scheme.as_u16());
        }
        mark.finish(&mut data);
        CertificateRequest13 {
            context: Vec::new(),
            extensions: vec![Extension::new(ExtensionType::SignatureAlgorithms, data)],
        }
    }

    pub fn signature_schemes(&self) -> Vec<SignatureScheme> {
        find_extension(&self.extensions, ExtensionType::SignatureAlgorithms)
            .and_then(|d| parse_u16_list(d).ok())
            .map(|(_, ids)| ids.into_iter().map(SignatureScheme::from_u16).collect())
            .unwrap_or_default()
    }

    pub fn certificate_authorities(&self) -> Vec<Vec<u8>> {
        let Some(data) = find_extension(&self.extensions, ExtensionType::CertificateAuthorities)
        else {
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
}

pub(crate) fn default_certificate_types() -> Vec<u8> {
    vec![CLIENT_CERT_TYPE_RSA_SIGN, CLIENT_CERT_TYPE_ECDSA_SIGN]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tls12_round_trip_with_schemes() {
        let req = CertificateRequest12 {
            certificate_types: default_certificate_types(),
            signature_schemes: vec![
                SignatureScheme::ECDSA_SECP256R1_SHA256,
                SignatureScheme::RSA_PKCS1_SHA256,
            ],
            certificate_authorities: vec![vec![0x30, 0x0B]],
        };
        let mut out = Vec::new();
        req.serialize(&mut out, Version::TLS1_2);
        let (rest, parsed) = CertificateRequest12::parse(&out, Version::TLS1_2).unwrap();
        assert!(rest.is_empty());
        assert_eq!(parsed, req);
    }

    #[test]
    fn tls10_has_no_signature_schemes() {
        let req = CertificateRequest12 {
            certificate_types: vec![CLIENT_CERT_TYPE_RSA_SIGN],
            signature_schemes: vec![],
            certificate_authorities: vec![],
        };
        let mut out = Vec::new();
        req.serialize(&mut out, Version::TLS1_0);
        let (rest, parsed) = CertificateRequest12::parse(&out, Version::TLS1_0).unwrap();
        assert!(rest.is_empty());
        assert_eq!(parsed, req);
    }

    #[test]
    fn tls13_round_trip() {
        let req = CertificateRequest13::with_signature_schemes(&[
            SignatureScheme::ECDSA_SECP256R1_SHA256,
        ]);
        let mut out = Vec::new();
        req.serialize(&mut out);
        let (rest, parsed) = CertificateRequest13::parse(&out).unwrap();
        assert!(rest.is_empty());
        assert_eq!(
            parsed.signature_schemes(),
            vec![SignatureScheme::ECDSA_SECP256R1_SHA256]
        );
        assert!(parsed.certificate_authorities().is_empty());
    }
}

use nom::IResult;

use crate::codec::{put_u16, vec_u16, LengthPrefix};
use crate::types::{SignatureScheme, Version};

/// CertificateVerify. The scheme field appears from TLS 1.2; before that
/// the algorithm is implied by the key type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateVerify {
    pub scheme: Option<SignatureScheme>,
    pub signature: Vec<u8>,
}

impl CertificateVerify {
    pub fn parse(input: &[u8], version: Version) -> IResult<&[u8], CertificateVerify> {
        let (input, scheme) = if version >= Version::TLS1_2 {
            let (input, scheme) = SignatureScheme::parse(input)?;
            (input, Some(scheme))
        } else {
            (input, None)
        };
        let (input, signature) = vec_u16(input)?;
        Ok((
            input,
            CertificateVerify {
                scheme,
                signature: signature.to_vec(),
            },
        ))
    }

    pub fn serialize(&self, out: &mut Vec<u8>) {
        if let Some(scheme) = self.scheme {
            put_u16(out, scheme.as_u16());
        }
        let mark = LengthPrefix::u16(out);
        out.extend_from_slice(&self.signature);
        mark.finish(out);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_tls12() {
        let cv = CertificateVerify {
            scheme: Some(SignatureScheme::ECDSA_SECP256R1_SHA256),
            signature: vec![1, 2, 3, 4],
        };
        let mut out = Vec::new();
        cv.serialize(&mut out);
        let (rest, parsed) = CertificateVerify::parse(&out, Version::TLS1_2).unwrap();
        assert!(rest.is_empty());
        assert_eq!(parsed, cv);
    }

    #[test]
    fn round_trip_legacy() {
        let cv = CertificateVerify {
            scheme: None,
            signature: vec![9; 70],
        };
        let mut out = Vec::new();
        cv.serialize(&mut out);
        let (rest, parsed) = CertificateVerify::parse(&out, Version::TLS1_0).unwrap();
        assert!(rest.is_empty());
        assert_eq!(parsed, cv);
    }
}

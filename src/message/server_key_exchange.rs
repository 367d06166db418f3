use nom::number::complete::be_u8;
use nom::IResult;

use crate::codec::{put_u16, put_u8, vec_u16, vec_u8, LengthPrefix};
use crate::types::{NamedGroup, SignatureScheme, Version};

const CURVE_TYPE_NAMED: u8 = 3;

/// The ECDHE parameter block of a ServerKeyExchange: named curve plus the
/// server's public share. This is also the byte range the signature covers
/// (together with both randoms).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerEcdheParams {
    pub group: NamedGroup,
    pub public: Vec<u8>,
}

impl ServerEcdheParams {
    pub fn parse(input: &[u8]) -> IResult<&[u8], ServerEcdheParams> {
        let (input, curve_type) = be_u8(input)?;
        if curve_type != CURVE_TYPE_NAMED {
            return Err(nom::Err::Failure(nom::error::Error::new(
                input,
                nom::error::ErrorKind::Tag,
            )));
        }
        let (input, group) = NamedGroup::parse(input)?;
        let (input, public) = vec_u8(input)?;
        Ok((
            input,
            ServerEcdheParams {
                group,
                public: public.to_vec(),
            },
        ))
    }

    pub fn serialize(&self, out: &mut Vec<u8>) {
        put_u8(out, CURVE_TYPE_NAMED);
        put_u16(out, self.group.as_u16());
        let mark = LengthPrefix::u8(out);
        out.extend_from_slice(&self.public);
        mark.finish(out);
    }
}

/// ServerKeyExchange for the ECDHE suites: signed curve parameters.
///
/// `params_raw` preserves the exact parameter bytes as received, since the
/// peer's signature is computed over them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerKeyExchange {
    pub params: ServerEcdheParams,
    pub params_raw: Vec<u8>,
    pub scheme: Option<SignatureScheme>,
    pub signature: Vec<u8>,
}

impl ServerKeyExchange {
    pub fn parse(input: &[u8], version: Version) -> IResult<&[u8], ServerKeyExchange> {
        let start = input;
        let (input, params) = ServerEcdheParams::parse(input)?;
        let params_raw = start[..start.len() - input.len()].to_vec();
        let (input, scheme) = if version >= Version::TLS1_2 {
            let (input, scheme) = SignatureScheme::parse(input)?;
            (input, Some(scheme))
        } else {
            (input, None)
        };
        let (input, signature) = vec_u16(input)?;
        Ok((
            input,
            ServerKeyExchange {
                params,
                params_raw,
                scheme,
                signature: signature.to_vec(),
            },
        ))
    }

    pub fn serialize(&self, out: &mut Vec<u8>) {
        self.params.serialize(out);
        if let Some(scheme) = self.scheme {
            put_u16(out, scheme.as_u16());
        }
        let mark = LengthPrefix::u16(out);
        out.extend_from_slice(&self.signature);
        mark.finish(out);
    }

    /// The blob the signature covers: client_random ‖ server_random ‖ params.
    pub fn signed_blob(
        client_random: &[u8; 32],
        server_random: &[u8; 32],
        params_raw: &[u8],
    ) -> Vec<u8> {
        let mut blob = Vec::with_capacity(64 + params_raw.len());
        blob.extend_from_slice(client_random);
        blob.extend_from_slice(server_random);
        blob.extend_from_slice(params_raw);
        blob
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_tls12() {
        let params = ServerEcdheParams {
            group: NamedGroup::X25519,
            public: vec![0xAB; 32],
        };
        let mut params_raw = Vec::new();
        params.serialize(&mut params_raw);
        let skx = ServerKeyExchange {
            params,
            params_raw,
            scheme: Some(SignatureScheme::ECDSA_SECP256R1_SHA256),
            signature: vec![1, 2, 3],
        };
        let mut out = Vec::new();
        skx.serialize(&mut out);
        let (rest, parsed) = ServerKeyExchange::parse(&out, Version::TLS1_2).unwrap();
        assert!(rest.is_empty());
        assert_eq!(parsed, skx);
    }

    #[test]
    fn round_trip_tls11_without_scheme() {
        let params = ServerEcdheParams {
            group: NamedGroup::Secp256r1,
            public: vec![0x04; 65],
        };
        let mut params_raw = Vec::new();
        params.serialize(&mut params_raw);
        let skx = ServerKeyExchange {
            params,
            params_raw,
            scheme: None,
            signature: vec![7; 40],
        };
        let mut out = Vec::new();
        skx.serialize(&mut out);
        let (rest, parsed) = ServerKeyExchange::parse(&out, Version::TLS1_1).unwrap();
        assert!(rest.is_empty());
        assert_eq!(parsed, skx);
    }

    #[test]
    fn rejects_unnamed_curve_type() {
        // explicit_prime curves (type 1) are not supported.
        let body = [1u8, 0, 23, 1, 0xAA, 0, 0];
        assert!(ServerEcdheParams::parse(&body).is_err());
    }

    #[test]
    fn signed_blob_layout() {
        let blob = ServerKeyExchange::signed_blob(&[1; 32], &[2; 32], &[3, 4]);
        assert_eq!(blob.len(), 66);
        assert_eq!(&blob[..32], &[1; 32][..]);
        assert_eq!(&blob[32..64], &[2; 32][..]);
        assert_eq!(&blob[64..], &[3, 4]);
    }
}

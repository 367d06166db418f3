use nom::IResult;

use crate::codec::{vec_u16, vec_u8, LengthPrefix};

/// ClientKeyExchange. The body framing depends on the negotiated key
/// exchange: an ECDHE share carries a u8 length, an RSA-encrypted
/// premaster a u16 length.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientKeyExchange {
    Ecdhe { public: Vec<u8> },
    Rsa { encrypted_premaster: Vec<u8> },
}

impl ClientKeyExchange {
    pub fn parse_ecdhe(input: &[u8]) -> IResult<&[u8], ClientKeyExchange> {
        let (input, public) = vec_u8(input)?;
        Ok((
            input,
            ClientKeyExchange::Ecdhe {
                public: public.to_vec(),
            },
        ))
    }

    pub fn parse_rsa(input: &[u8]) -> IResult<&[u8], ClientKeyExchange> {
        let (input, encrypted) = vec_u16(input)?;
        Ok((
            input,
            ClientKeyExchange::Rsa {
                encrypted_premaster: encrypted.to_vec(),
            },
        ))
    }

    pub fn serialize(&self, out: &mut Vec<u8>) {
        match self {
            ClientKeyExchange::Ecdhe { public } => {
                let mark = LengthPrefix::u8(out);
                out.extend_from_slice(public);
                mark.finish(out);
            }
            ClientKeyExchange::Rsa {
                encrypted_premaster,
            } => {
                let mark = LengthPrefix::u16(out);
                out.extend_from_slice(encrypted_premaster);
                mark.finish(out);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ecdhe_round_trip() {
        let ckx = ClientKeyExchange::Ecdhe {
            public: vec![0x04; 65],
        };
        let mut out = Vec::new();
        ckx.serialize(&mut out);
        assert_eq!(out[0], 65);
        let (rest, parsed) = ClientKeyExchange::parse_ecdhe(&out).unwrap();
        assert!(rest.is_empty());
        assert_eq!(parsed, ckx);
    }

    #[test]
    fn rsa_round_trip() {
        let ckx = ClientKeyExchange::Rsa {
            encrypted_premaster: vec![0xEE; 256],
        };
        let mut out = Vec::new();
        ckx.serialize(&mut out);
        assert_eq!(&out[..2], &[0x01, 0x00]);
        let (rest, parsed) = ClientKeyExchange::parse_rsa(&out).unwrap();
        assert!(rest.is_empty());
        assert_eq!(parsed, ckx);
    }
}

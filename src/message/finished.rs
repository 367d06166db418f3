use nom::number::complete::be_u8;
use nom::IResult;

use super::{parse_extensions, serialize_extensions, Extension};

/// Finished: the verify_data, whose length depends on the version (12
/// bytes pre-1.3, the transcript hash length in 1.3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Finished {
    pub verify_data: Vec<u8>,
}

impl Finished {
    pub fn parse_body(body: &[u8]) -> Finished {
        Finished {
            verify_data: body.to_vec(),
        }
    }

    pub fn serialize(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.verify_data);
    }
}

/// TLS 1.3 EncryptedExtensions.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EncryptedExtensions {
    pub extensions: Vec<Extension>,
}

impl EncryptedExtensions {
    pub fn parse(input: &[u8]) -> IResult<&[u8], EncryptedExtensions> {
        let (input, extensions) = parse_extensions(input)?;
        Ok((input, EncryptedExtensions { extensions }))
    }

    pub fn serialize(&self, out: &mut Vec<u8>) {
        serialize_extensions(out, &self.extensions);
    }
}

/// TLS 1.3 KeyUpdate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyUpdate {
    pub update_requested: bool,
}

impl KeyUpdate {
    pub fn parse(input: &[u8]) -> IResult<&[u8], KeyUpdate> {
        let (input, v) = be_u8(input)?;
        if v > 1 {
            return Err(nom::Err::Failure(nom::error::Error::new(
                input,
                nom::error::ErrorKind::Tag,
            )));
        }
        Ok((
            input,
            KeyUpdate {
                update_requested: v == 1,
            },
        ))
    }

    pub fn serialize(&self, out: &mut Vec<u8>) {
        out.push(if self.update_requested { 1 } else { 0 });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ExtensionType;

    #[test]
    fn finished_is_opaque() {
        let f = Finished {
            verify_data: vec![1; 12],
        };
        let mut out = Vec::new();
        f.serialize(&mut out);
        assert_eq!(Finished::parse_body(&out), f);
    }

    #[test]
    fn encrypted_extensions_round_trip() {
        let ee = EncryptedExtensions {
            extensions: vec![Extension::new(ExtensionType::Alpn, vec![0, 3, 2, b'h', b'2'])],
        };
        let mut out = Vec::new();
        ee.serialize(&mut out);
        let (rest, parsed) = EncryptedExtensions::parse(&out).unwrap();
        assert!(rest.is_empty());
        assert_eq!(parsed, ee);
    }

    #[test]
    fn key_update_values() {
        let mut out = Vec::new();
        KeyUpdate {
            update_requested: true,
        }
        .serialize(&mut out);
        let (_, parsed) = KeyUpdate::parse(&out).unwrap();
        assert!(parsed.update_requested);
        assert!(KeyUpdate::parse(&[2]).is_err());
    }
}

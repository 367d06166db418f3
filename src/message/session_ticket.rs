use nom::number::complete::be_u32;
use nom::IResult;

use crate::codec::{put_u32, vec_u16, LengthPrefix};
use crate::types::ExtensionType;

use super::{find_extension, parse_extensions, serialize_extensions, take_opaque8, Extension};

/// Pre-1.3 NewSessionTicket (RFC 5077).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewSessionTicket12 {
    pub lifetime_hint: u32,
    pub ticket: Vec<u8>,
}

impl NewSessionTicket12 {
    pub fn parse(input: &[u8]) -> IResult<&[u8], NewSessionTicket12> {
        let (input, lifetime_hint) = be_u32(input)?;
        let (input, ticket) = vec_u16(input)?;
        Ok((
            input,
            NewSessionTicket12 {
                lifetime_hint,
                ticket: ticket.to_vec(),
            },
        ))
    }

    pub fn serialize(&self, out: &mut Vec<u8>) {
        put_u32(out, self.lifetime_hint);
        let mark = LengthPrefix::u16(out);
        out.extend_from_slice(&self.ticket);
        mark.finish(out);
    }
}

/// TLS 1.3 NewSessionTicket (RFC 8446 section 4.6.1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewSessionTicket13 {
    pub lifetime: u32,
    pub age_add: u32,
    pub nonce: Vec<u8>,
    pub ticket: Vec<u8>,
    pub extensions: Vec<Extension>,
}

impl NewSessionTicket13 {
    pub fn parse(input: &[u8]) -> IResult<&[u8], NewSessionTicket13> {
        let (input, lifetime) = be_u32(input)?;
        let (input, age_add) = be_u32(input)?;
        let (input, nonce) = take_opaque8(input)?;
        let (input, ticket) = vec_u16(input)?;
        let (input, extensions) = parse_extensions(input)?;
        Ok((
            input,
            NewSessionTicket13 {
                lifetime,
                age_add,
                nonce,
                ticket: ticket.to_vec(),
                extensions,
            },
        ))
    }

    pub fn serialize(&self, out: &mut Vec<u8>) {
        put_u32(out, self.lifetime);
        put_u32(out, self.age_add);
        let mark = LengthPrefix::u8(out);
        out.extend_from_slice(&self.nonce);
        mark.finish(out);
        let mark = LengthPrefix::u16(out);
        out.extend_from_slice(&self.ticket);
        mark.finish(out);
        serialize_extensions(out, &self.extensions);
    }

    /// max_early_data_size from the early_data extension, if present.
    pub fn max_early_data(&self) -> Option<u32> {
        let data = find_extension(&self.extensions, ExtensionType::EarlyData)?;
        be_u32::<_, nom::error::Error<&[u8]>>(data).ok().map(|(_, v)| v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tls12_round_trip() {
        let t = NewSessionTicket12 {
            lifetime_hint: 7200,
            ticket: vec![0xAB; 100],
        };
        let mut out = Vec::new();
        t.serialize(&mut out);
        let (rest, parsed) = NewSessionTicket12::parse(&out).unwrap();
        assert!(rest.is_empty());
        assert_eq!(parsed, t);
    }

    #[test]
    fn tls13_round_trip_with_early_data() {
        let t = NewSessionTicket13 {
            lifetime: 86400,
            age_add: 0x12345678,
            nonce: vec![0, 1],
            ticket: vec![0xCD; 64],
            extensions: vec![Extension::new(
                ExtensionType::EarlyData,
                0x4000u32.to_be_bytes().to_vec(),
            )],
        };
        let mut out = Vec::new();
        t.serialize(&mut out);
        let (rest, parsed) = NewSessionTicket13::parse(&out).unwrap();
        assert!(rest.is_empty());
        assert_eq!(parsed, t);
        assert_eq!(parsed.max_early_data(), Some(0x4000));
    }
}

//! Typed payloads for the extensions the engine produces and consumes.

use nom::bytes::complete::take;
use nom::number::complete::{be_u16, be_u32, be_u8};
use nom::IResult;

use crate::codec::{put_u16, put_u32, put_u8, vec_u16, vec_u8, LengthPrefix};
use crate::types::NamedGroup;

pub const PSK_MODE_DHE_KE: u8 = 1;

/// One key_share entry: group plus opaque share bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyShareEntry {
    pub group: NamedGroup,
    pub key_exchange: Vec<u8>,
}

impl KeyShareEntry {
    pub fn parse(input: &[u8]) -> IResult<&[u8], KeyShareEntry> {
        let (input, group) = NamedGroup::parse(input)?;
        let (input, key_exchange) = vec_u16(input)?;
        Ok((
            input,
            KeyShareEntry {
                group,
                key_exchange: key_exchange.to_vec(),
            },
        ))
    }

    pub fn serialize(&self, out: &mut Vec<u8>) {
        put_u16(out, self.group.as_u16());
        let mark = LengthPrefix::u16(out);
        out.extend_from_slice(&self.key_exchange);
        mark.finish(out);
    }

    /// Parse the ClientHello form: a u16-length-prefixed list of entries.
    pub fn parse_list(input: &[u8]) -> IResult<&[u8], Vec<KeyShareEntry>> {
        let (input, mut block) = vec_u16(input)?;
        let mut entries = Vec::new();
        while !block.is_empty() {
            let (rest, entry) = KeyShareEntry::parse(block)?;
            entries.push(entry);
            block = rest;
        }
        Ok((input, entries))
    }

    pub fn serialize_list(entries: &[KeyShareEntry], out: &mut Vec<u8>) {
        let mark = LengthPrefix::u16(out);
        for entry in entries {
            entry.serialize(out);
        }
        mark.finish(out);
    }
}

/// One offered PSK identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PskIdentity {
    pub identity: Vec<u8>,
    pub obfuscated_ticket_age: u32,
}

/// The pre_shared_key offer in a ClientHello: identities plus binders.
///
/// The binder list hangs off the end of the ClientHello; its byte length is
/// what the binder MAC truncation is measured against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PskOffer {
    pub identities: Vec<PskIdentity>,
    pub binders: Vec<Vec<u8>>,
}

impl PskOffer {
    pub fn parse(input: &[u8]) -> IResult<&[u8], PskOffer> {
        let (input, mut ident_block) = vec_u16(input)?;
        let mut identities = Vec::new();
        while !ident_block.is_empty() {
            let (rest, identity) = vec_u16(ident_block)?;
            let (rest, age) = be_u32(rest)?;
            identities.push(PskIdentity {
                identity: identity.to_vec(),
                obfuscated_ticket_age: age,
            });
            ident_block = rest;
        }

        let (input, mut binder_block) = vec_u16(input)?;
        let mut binders = Vec::new();
        while !binder_block.is_empty() {
            let (rest, binder) = vec_u8(binder_block)?;
            binders.push(binder.to_vec());
            binder_block = rest;
        }

        Ok((
            input,
            PskOffer {
                identities,
                binders,
            },
        ))
    }

    pub fn serialize(&self, out: &mut Vec<u8>) {
        let mark = LengthPrefix::u16(out);
        for id in &self.identities {
            let m = LengthPrefix::u16(out);
            out.extend_from_slice(&id.identity);
            m.finish(out);
            put_u32(out, id.obfuscated_ticket_age);
        }
        mark.finish(out);
        Self::serialize_binders(&self.binders, out);
    }

    pub fn serialize_binders(binders: &[Vec<u8>], out: &mut Vec<u8>) {
        let mark = LengthPrefix::u16(out);
        for binder in binders {
            let m = LengthPrefix::u8(out);
            out.extend_from_slice(binder);
            m.finish(out);
        }
        mark.finish(out);
    }

    /// Wire length of the binder list for `binder_lens` binder sizes. The
    /// ClientHello is truncated by this much when computing binders.
    pub fn binders_wire_len(binder_lens: &[usize]) -> usize {
        2 + binder_lens.iter().map(|l| 1 + l).sum::<usize>()
    }
}

/// supported_versions, client form: u8-length list of u16 versions.
pub fn parse_supported_versions_list(input: &[u8]) -> IResult<&[u8], Vec<u16>> {
    let (input, mut block) = vec_u8(input)?;
    let mut versions = Vec::new();
    while !block.is_empty() {
        let (rest, v) = be_u16(block)?;
        versions.push(v);
        block = rest;
    }
    Ok((input, versions))
}

pub fn serialize_supported_versions_list(versions: &[u16], out: &mut Vec<u8>) {
    let mark = LengthPrefix::u8(out);
    for v in versions {
        put_u16(out, *v);
    }
    mark.finish(out);
}

/// supported_groups: u16-length list of u16 group ids.
pub fn parse_named_group_list(input: &[u8]) -> IResult<&[u8], Vec<NamedGroup>> {
    let (input, mut block) = vec_u16(input)?;
    let mut groups = Vec::new();
    while !block.is_empty() {
        let (rest, g) = NamedGroup::parse(block)?;
        groups.push(g);
        block = rest;
    }
    Ok((input, groups))
}

pub fn serialize_named_group_list(groups: &[NamedGroup], out: &mut Vec<u8>) {
    let mark = LengthPrefix::u16(out);
    for g in groups {
        put_u16(out, g.as_u16());
    }
    mark.finish(out);
}

/// signature_algorithms: u16-length list of u16 scheme ids.
pub fn parse_u16_list(input: &[u8]) -> IResult<&[u8], Vec<u16>> {
    let (input, mut block) = vec_u16(input)?;
    let mut values = Vec::new();
    while !block.is_empty() {
        let (rest, v) = be_u16(block)?;
        values.push(v);
        block = rest;
    }
    Ok((input, values))
}

pub fn serialize_u16_list(values: &[u16], out: &mut Vec<u8>) {
    let mark = LengthPrefix::u16(out);
    for v in values {
        put_u16(out, *v);
    }
    mark.finish(out);
}

/// ALPN protocol list: u16 block of u8-length strings.
pub fn parse_alpn_list(input: &[u8]) -> IResult<&[u8], Vec<Vec<u8>>> {
    let (input, mut block) = vec_u16(input)?;
    let mut protocols = Vec::new();
    while !block.is_empty() {
        let (rest, p) = vec_u8(block)?;
        protocols.push(p.to_vec());
        block = rest;
    }
    Ok((input, protocols))
}

pub fn serialize_alpn_list(protocols: &[Vec<u8>], out: &mut Vec<u8>) {
    let mark = LengthPrefix::u16(out);
    for p in protocols {
        let m = LengthPrefix::u8(out);
        out.extend_from_slice(p);
        m.finish(out);
    }
    mark.finish(out);
}

/// server_name: we only produce/consume the single host_name form.
pub fn parse_server_name(input: &[u8]) -> IResult<&[u8], Vec<u8>> {
    let (input, mut block) = vec_u16(input)?;
    // name_type 0 (host_name) followed by the name.
    let (rest, name_type) = be_u8(block)?;
    block = rest;
    if name_type != 0 {
        let (_, name) = take(0usize)(block)?;
        return Ok((input, name.to_vec()));
    }
    let (_, name) = vec_u16(block)?;
    Ok((input, name.to_vec()))
}

pub fn serialize_server_name(name: &[u8], out: &mut Vec<u8>) {
    let mark = LengthPrefix::u16(out);
    put_u8(out, 0);
    let m = LengthPrefix::u16(out);
    out.extend_from_slice(name);
    m.finish(out);
    mark.finish(out);
}

/// psk_key_exchange_modes: u8-length list of modes.
pub fn parse_psk_modes(input: &[u8]) -> IResult<&[u8], Vec<u8>> {
    let (input, block) = vec_u8(input)?;
    Ok((input, block.to_vec()))
}

pub fn serialize_psk_modes(modes: &[u8], out: &mut Vec<u8>) {
    let mark = LengthPrefix::u8(out);
    out.extend_from_slice(modes);
    mark.finish(out);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_share_list_round_trip() {
        let entries = vec![
            KeyShareEntry {
                group: NamedGroup::X25519,
                key_exchange: vec![0xAA; 32],
            },
            KeyShareEntry {
                group: NamedGroup::Secp256r1,
                key_exchange: vec![0x04; 65],
            },
        ];
        let mut out = Vec::new();
        KeyShareEntry::serialize_list(&entries, &mut out);
        let (rest, parsed) = KeyShareEntry::parse_list(&out).unwrap();
        assert!(rest.is_empty());
        assert_eq!(parsed, entries);
    }

    #[test]
    fn psk_offer_round_trip() {
        let offer = PskOffer {
            identities: vec![PskIdentity {
                identity: vec![1, 2, 3],
                obfuscated_ticket_age: 0xDEADBEEF,
            }],
            binders: vec![vec![0x55; 32]],
        };
        let mut out = Vec::new();
        offer.serialize(&mut out);
        let (rest, parsed) = PskOffer::parse(&out).unwrap();
        assert!(rest.is_empty());
        assert_eq!(parsed, offer);
    }

    #[test]
    fn binder_truncation_length() {
        // One 32-byte binder: 2 (list len) + 1 (binder len) + 32.
        assert_eq!(PskOffer::binders_wire_len(&[32]), 35);
    }

    #[test]
    fn alpn_round_trip() {
        let protos = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
        let mut out = Vec::new();
        serialize_alpn_list(&protos, &mut out);
        let (rest, parsed) = parse_alpn_list(&out).unwrap();
        assert!(rest.is_empty());
        assert_eq!(parsed, protos);
    }

    #[test]
    fn server_name_round_trip() {
        let mut out = Vec::new();
        serialize_server_name(b"example.test", &mut out);
        let (_, name) = parse_server_name(&out).unwrap();
        assert_eq!(name, b"example.test");
    }
}

use nom::IResult;

use crate::codec::{vec_u24, LengthPrefix};

use super::{parse_extensions, serialize_extensions, take_opaque8, Extension};

/// Pre-1.3 Certificate: a bare list of DER certificates.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Certificate12 {
    pub chain: Vec<Vec<u8>>,
}

impl Certificate12 {
    pub fn parse(input: &[u8]) -> IResult<&[u8], Certificate12> {
        let (input, mut block) = vec_u24(input)?;
        let mut chain = Vec::new();
        while !block.is_empty() {
            let (rest, cert) = vec_u24(block)?;
            chain.push(cert.to_vec());
            block = rest;
        }
        Ok((input, Certificate12 { chain }))
    }

    pub fn serialize(&self, out: &mut Vec<u8>) {
        let mark = LengthPrefix::u24(out);
        for cert in &self.chain {
            let m = LengthPrefix::u24(out);
            out.extend_from_slice(cert);
            m.finish(out);
        }
        mark.finish(out);
    }
}

/// One TLS 1.3 certificate entry: DER certificate plus per-entry extensions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateEntry {
    pub cert: Vec<u8>,
    pub extensions: Vec<Extension>,
}

/// TLS 1.3 Certificate: request context plus entries.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Certificate13 {
    pub context: Vec<u8>,
    pub entries: Vec<CertificateEntry>,
}

impl Certificate13 {
    pub fn parse(input: &[u8]) -> IResult<&[u8], Certificate13> {
        let (input, context) = take_opaque8(input)?;
        let (input, mut block) = vec_u24(input)?;
        let mut entries = Vec::new();
        while !block.is_empty() {
            let (rest, cert) = vec_u24(block)?;
            let (rest, extensions) = parse_extensions(rest)?;
            entries.push(CertificateEntry {
                cert: cert.to_vec(),
                extensions,
            });
            block = rest;
        }
        Ok((input, Certificate13 { context, entries }))
    }

    pub fn serialize(&self, out: &mut Vec<u8>) {
        let mark = LengthPrefix::u8(out);
        out.extend_from_slice(&self.context);
        mark.finish(out);
        let mark = LengthPrefix::u24(out);
        for entry in &self.entries {
            let m = LengthPrefix::u24(out);
            out.extend_from_slice(&entry.cert);
            m.finish(out);
            serialize_extensions(out, &entry.extensions);
        }
        mark.finish(out);
    }

    pub fn from_chain(chain: &[Vec<u8>]) -> Certificate13 {
        Certificate13 {
            context: Vec::new(),
            entries: chain
                .iter()
                .map(|cert| CertificateEntry {
                    cert: cert.clone(),
                    extensions: Vec::new(),
                })
                .collect(),
        }
    }

    pub fn chain(&self) -> Vec<Vec<u8>> {
        self.entries.iter().map(|e| e.cert.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tls12_round_trip() {
        let msg = Certificate12 {
            chain: vec![vec![0x30, 0x82, 0x01], vec![0x30, 0x10]],
        };
        let mut out = Vec::new();
        msg.serialize(&mut out);
        let (rest, parsed) = Certificate12::parse(&out).unwrap();
        assert!(rest.is_empty());
        assert_eq!(parsed, msg);
    }

    #[test]
    fn tls12_empty_chain() {
        let msg = Certificate12 { chain: vec![] };
        let mut out = Vec::new();
        msg.serialize(&mut out);
        assert_eq!(out, vec![0, 0, 0]);
        let (_, parsed) = Certificate12::parse(&out).unwrap();
        assert!(parsed.chain.is_empty());
    }

    #[test]
    fn tls13_round_trip() {
        let msg = Certificate13::from_chain(&[vec![1, 2, 3]]);
        let mut out = Vec::new();
        msg.serialize(&mut out);
        let (rest, parsed) = Certificate13::parse(&out).unwrap();
        assert!(rest.is_empty());
        assert_eq!(parsed, msg);
        assert_eq!(parsed.chain(), vec![vec![1, 2, 3]]);
    }
}

//! Byte-level helpers shared by the record layer and the message codecs.
//!
//! Parsing uses nom combinators; serialization appends big-endian bytes to a
//! `Vec<u8>` with backpatched length prefixes.

use nom::bytes::complete::take;
use nom::number::complete::{be_u16, be_u24, be_u8};
use nom::IResult;

/// Read a u8-length-prefixed byte vector.
pub fn vec_u8(input: &[u8]) -> IResult<&[u8], &[u8]> {
    let (input, len) = be_u8(input)?;
    take(len as usize)(input)
}

/// Read a u16-length-prefixed byte vector.
pub fn vec_u16(input: &[u8]) -> IResult<&[u8], &[u8]> {
    let (input, len) = be_u16(input)?;
    take(len as usize)(input)
}

/// Read a u24-length-prefixed byte vector.
pub fn vec_u24(input: &[u8]) -> IResult<&[u8], &[u8]> {
    let (input, len) = be_u24(input)?;
    take(len as usize)(input)
}

pub fn put_u8(out: &mut Vec<u8>, v: u8) {
    out.push(v);
}

pub fn put_u16(out: &mut Vec<u8>, v: u16) {
    out.extend_from_slice(&v.to_be_bytes());
}

pub fn put_u24(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_be_bytes()[1..]);
}

pub fn put_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_be_bytes());
}

/// A reserved length prefix, backpatched when the enclosed data is complete.
///
/// ```ignore
/// let mark = LengthPrefix::u16(&mut out);
/// // ... append body ...
/// mark.finish(&mut out);
/// ```
#[must_use]
pub struct LengthPrefix {
    at: usize,
    size: usize,
}

impl LengthPrefix {
    pub fn u8(out: &mut Vec<u8>) -> LengthPrefix {
        let at = out.len();
        out.push(0);
        LengthPrefix { at, size: 1 }
    }

    pub fn u16(out: &mut Vec<u8>) -> LengthPrefix {
        let at = out.len();
        out.extend_from_slice(&[0, 0]);
        LengthPrefix { at, size: 2 }
    }

    pub fn u24(out: &mut Vec<u8>) -> LengthPrefix {
        let at = out.len();
        out.extend_from_slice(&[0, 0, 0]);
        LengthPrefix { at, size: 3 }
    }

    /// Backpatch the length of everything appended since the mark.
    pub fn finish(self, out: &mut Vec<u8>) {
        let len = out.len() - self.at - self.size;
        match self.size {
            1 => out[self.at] = len as u8,
            2 => out[self.at..self.at + 2].copy_from_slice(&(len as u16).to_be_bytes()),
            3 => out[self.at..self.at + 3].copy_from_slice(&(len as u32).to_be_bytes()[1..]),
            _ => unreachable!(),
        }
    }
}

/// Require the parser to consume all of `input`.
pub fn parse_all<'a, T>(
    input: &'a [u8],
    parser: impl Fn(&'a [u8]) -> IResult<&'a [u8], T>,
) -> Result<T, crate::Error> {
    let (rest, value) = parser(input)?;
    if !rest.is_empty() {
        return Err(crate::Error::Decode("trailing bytes".to_string()));
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn u24_round_trip() {
        let mut out = Vec::new();
        put_u24(&mut out, 0x012345);
        assert_eq!(out, [0x01, 0x23, 0x45]);
        let (rest, v) = be_u24::<_, nom::error::Error<&[u8]>>(&out[..]).unwrap();
        assert!(rest.is_empty());
        assert_eq!(v, 0x012345);
    }

    #[test]
    fn length_prefix_backpatch() {
        let mut out = vec![0xAA];
        let mark = LengthPrefix::u16(&mut out);
        out.extend_from_slice(b"hello");
        mark.finish(&mut out);
        assert_eq!(out, [0xAA, 0x00, 0x05, b'h', b'e', b'l', b'l', b'o']);
    }

    #[test]
    fn vec_parsers() {
        let data = [0x02, 0xAB, 0xCD, 0xFF];
        let (rest, v) = vec_u8(&data).unwrap();
        assert_eq!(v, &[0xAB, 0xCD]);
        assert_eq!(rest, &[0xFF]);

        let data = [0x00, 0x01, 0x42];
        let (rest, v) = vec_u16(&data).unwrap();
        assert_eq!(v, &[0x42]);
        assert!(rest.is_empty());

        assert!(vec_u16(&[0x00, 0x05, 0x01]).is_err());
    }
}

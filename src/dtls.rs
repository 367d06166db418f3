//! DTLS message framing: fragmenting outbound handshake messages,
//! reassembling inbound fragments, and the flight bookkeeping used by the
//! test-driven retransmission hook.
//!
//! Reassembly is deliberately strict for a test peer: fragments must arrive
//! for the exact message sequence expected, and each fragment's offset must
//! equal the bytes already assembled. Out-of-order delivery is the
//! transport simulator's job to produce, and a protocol error to accept.

use log::debug;

use crate::message::{DtlsFragmentHeader, HandshakeMessage, DTLS_HANDSHAKE_HEADER_LEN, MAX_HANDSHAKE_LEN};
use crate::types::HandshakeType;
use crate::Error;

/// Split one handshake message into serialized fragments (header included),
/// each carrying at most `max_fragment` body bytes.
pub fn fragment_message(
    typ: HandshakeType,
    body: &[u8],
    message_seq: u16,
    max_fragment: usize,
) -> Vec<Vec<u8>> {
    assert!(max_fragment > 0);
    let mut fragments = Vec::new();
    let total = body.len() as u32;
    let mut offset = 0usize;
    loop {
        let fragment_len = usize::min(max_fragment, body.len() - offset);
        let header = DtlsFragmentHeader {
            typ,
            length: total,
            message_seq,
            fragment_offset: offset as u32,
            fragment_length: fragment_len as u32,
        };
        let mut out = Vec::with_capacity(DTLS_HANDSHAKE_HEADER_LEN + fragment_len);
        header.serialize(&mut out);
        out.extend_from_slice(&body[offset..offset + fragment_len]);
        fragments.push(out);
        offset += fragment_len;
        if offset >= body.len() {
            break;
        }
    }
    fragments
}

struct Partial {
    typ: HandshakeType,
    total: u32,
    body: Vec<u8>,
}

/// In-order reassembly of inbound handshake fragments.
pub struct Assembler {
    next_seq: u16,
    partial: Option<Partial>,
}

impl Assembler {
    pub fn new() -> Assembler {
        Assembler {
            next_seq: 0,
            partial: None,
        }
    }

    /// Feed the fragments in one record payload. Completed messages are
    /// appended to `out`.
    pub fn add_record_payload(
        &mut self,
        mut payload: &[u8],
        out: &mut Vec<HandshakeMessage>,
    ) -> Result<(), Error> {
        while !payload.is_empty() {
            let (rest, header) = DtlsFragmentHeader::parse(payload)
                .map_err(|_| Error::Decode("bad DTLS fragment header".to_string()))?;
            let fragment_len = header.fragment_length as usize;
            if rest.len() < fragment_len {
                return Err(Error::Decode("truncated DTLS fragment".to_string()));
            }
            let (fragment, rest) = rest.split_at(fragment_len);
            self.add_fragment(&header, fragment, out)?;
            payload = rest;
        }
        Ok(())
    }

    fn add_fragment(
        &mut self,
        header: &DtlsFragmentHeader,
        fragment: &[u8],
        out: &mut Vec<HandshakeMessage>,
    ) -> Result<(), Error> {
        if header.length as usize > MAX_HANDSHAKE_LEN {
            return Err(Error::Decode(format!(
                "oversized handshake message ({})",
                header.length
            )));
        }
        if header.fragment_offset + header.fragment_length > header.length {
            return Err(Error::Decode("fragment exceeds message length".to_string()));
        }
        if header.message_seq != self.next_seq {
            return Err(Error::UnexpectedMessage(format!(
                "handshake fragment seq {} != expected {}",
                header.message_seq, self.next_seq
            )));
        }

        let partial = match &mut self.partial {
            Some(partial) => {
                if partial.typ != header.typ || partial.total != header.length {
                    return Err(Error::UnexpectedMessage(
                        "fragment header changed mid-message".to_string(),
                    ));
                }
                partial
            }
            None => {
                self.partial = Some(Partial {
                    typ: header.typ,
                    total: header.length,
                    body: Vec::with_capacity(header.length as usize),
                });
                self.partial.as_mut().expect("just set")
            }
        };

        // Strict in-order: the fragment must start exactly where assembly
        // stopped.
        if header.fragment_offset as usize != partial.body.len() {
            return Err(Error::UnexpectedMessage(format!(
                "fragment offset {} != assembled {}",
                header.fragment_offset,
                partial.body.len()
            )));
        }
        partial.body.extend_from_slice(fragment);

        if partial.body.len() == partial.total as usize {
            let partial = self.partial.take().expect("checked above");
            debug!(
                "reassembled {:?} ({} bytes, seq {})",
                partial.typ,
                partial.body.len(),
                self.next_seq
            );
            self.next_seq = self.next_seq.wrapping_add(1);
            out.push(HandshakeMessage::new(partial.typ, partial.body));
        }
        Ok(())
    }
}

impl Default for Assembler {
    fn default() -> Self {
        Self::new()
    }
}

/// One entry of an outbound flight, kept for simulated-timeout
/// retransmission. Entries record the epoch they were sent under; only
/// flights wholly within the current epoch can be replayed.
#[derive(Debug, Clone)]
pub enum FlightEntry {
    Handshake {
        typ: HandshakeType,
        body: Vec<u8>,
        message_seq: u16,
        epoch: u16,
    },
    ChangeCipherSpec {
        epoch: u16,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(assembler: &mut Assembler, fragments: &[Vec<u8>]) -> Result<Vec<HandshakeMessage>, Error> {
        let mut out = Vec::new();
        for fragment in fragments {
            assembler.add_record_payload(fragment, &mut out)?;
        }
        Ok(out)
    }

    #[test]
    fn fragment_sizes_one_maxminus1_max() {
        let body: Vec<u8> = (0..=255u8).cycle().take(700).collect();
        for max in [1usize, body.len() - 1, body.len()] {
            let fragments = fragment_message(HandshakeType::Certificate, &body, 0, max);
            let mut assembler = Assembler::new();
            let msgs = collect(&mut assembler, &fragments).unwrap();
            assert_eq!(msgs.len(), 1, "max {}", max);
            assert_eq!(msgs[0].typ, HandshakeType::Certificate);
            assert_eq!(msgs[0].body, body, "max {}", max);
            assert_eq!(assembler.next_seq, 1);
        }
    }

    #[test]
    fn wrong_offset_rejected() {
        let body = vec![0xAA; 100];
        let fragments = fragment_message(HandshakeType::ClientHello, &body, 0, 40);
        let mut assembler = Assembler::new();
        let mut out = Vec::new();
        assembler.add_record_payload(&fragments[0], &mut out).unwrap();
        // Skipping fragment 1 breaks the offset invariant.
        let err = assembler
            .add_record_payload(&fragments[2], &mut out)
            .unwrap_err();
        assert!(matches!(err, Error::UnexpectedMessage(_)));
    }

    #[test]
    fn wrong_message_seq_rejected() {
        let fragments = fragment_message(HandshakeType::ClientHello, &[1, 2, 3], 5, 64);
        let mut assembler = Assembler::new();
        let mut out = Vec::new();
        assert!(matches!(
            assembler.add_record_payload(&fragments[0], &mut out),
            Err(Error::UnexpectedMessage(_))
        ));
    }

    #[test]
    fn multiple_fragments_in_one_record_payload() {
        let a = fragment_message(HandshakeType::ServerHello, &[1; 50], 0, 64);
        let b = fragment_message(HandshakeType::EncryptedExtensions, &[2; 10], 1, 64);
        let mut packed = a[0].clone();
        packed.extend_from_slice(&b[0]);

        let mut assembler = Assembler::new();
        let mut out = Vec::new();
        assembler.add_record_payload(&packed, &mut out).unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].typ, HandshakeType::ServerHello);
        assert_eq!(out[1].typ, HandshakeType::EncryptedExtensions);
    }

    #[test]
    fn zero_length_message_completes_immediately() {
        let fragments = fragment_message(HandshakeType::ServerHelloDone, &[], 0, 64);
        assert_eq!(fragments.len(), 1);
        let mut assembler = Assembler::new();
        let msgs = collect(&mut assembler, &fragments).unwrap();
        assert_eq!(msgs.len(), 1);
        assert!(msgs[0].body.is_empty());
    }

    #[test]
    fn header_change_mid_message_rejected() {
        let body = vec![0x55; 80];
        let fragments = fragment_message(HandshakeType::Certificate, &body, 0, 40);
        let mut assembler = Assembler::new();
        let mut out = Vec::new();
        assembler.add_record_payload(&fragments[0], &mut out).unwrap();

        // Re-declare the total length on the second fragment.
        let (_, mut header) = DtlsFragmentHeader::parse(&fragments[1]).unwrap();
        header.length += 8;
        let mut forged = Vec::new();
        header.serialize(&mut forged);
        forged.extend_from_slice(&fragments[1][DTLS_HANDSHAKE_HEADER_LEN..]);
        assert!(assembler.add_record_payload(&forged, &mut out).is_err());
    }
}

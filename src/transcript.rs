//! Running transcript hash over all handshake messages.
//!
//! Messages are buffered raw until the cipher suite (and with it the hash)
//! is known, then fed into an incremental digest. The raw log is retained
//! for the cases that need to re-hash the whole transcript under another
//! algorithm: pre-1.3 CertificateVerify and the extended-master-secret
//! session hash.
//!
//! Every handshake message must be added exactly once, in the order sent or
//! received, before any digest is read. DTLS callers re-encode messages
//! with the 4-byte TLS header first so both transports hash identical
//! bytes.

use md5::Md5;
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha384};

use crate::types::{HandshakeType, HashAlgorithm};

#[derive(Clone)]
enum RunningHash {
    Sha256(Sha256),
    Sha384(Sha384),
    /// TLS ≤ 1.1 keeps both digests and concatenates them.
    Md5Sha1(Md5, Sha1),
}

impl RunningHash {
    fn new(alg: HashAlgorithm) -> RunningHash {
        match alg {
            HashAlgorithm::SHA256 => RunningHash::Sha256(Sha256::new()),
            HashAlgorithm::SHA384 => RunningHash::Sha384(Sha384::new()),
            HashAlgorithm::MD5SHA1 => RunningHash::Md5Sha1(Md5::new(), Sha1::new()),
            HashAlgorithm::SHA1 => RunningHash::Md5Sha1(Md5::new(), Sha1::new()),
        }
    }

    fn update(&mut self, data: &[u8]) {
        match self {
            RunningHash::Sha256(h) => h.update(data),
            RunningHash::Sha384(h) => h.update(data),
            RunningHash::Md5Sha1(m, s) => {
                m.update(data);
                s.update(data);
            }
        }
    }

    fn finalize(self) -> Vec<u8> {
        match self {
            RunningHash::Sha256(h) => h.finalize().to_vec(),
            RunningHash::Sha384(h) => h.finalize().to_vec(),
            RunningHash::Md5Sha1(m, s) => {
                let mut out = m.finalize().to_vec();
                out.extend_from_slice(&s.finalize());
                out
            }
        }
    }
}

pub struct Transcript {
    buffer: Vec<u8>,
    hash: Option<RunningHash>,
    alg: Option<HashAlgorithm>,
}

impl Transcript {
    pub fn new() -> Transcript {
        Transcript {
            buffer: Vec::new(),
            hash: None,
            alg: None,
        }
    }

    /// Feed one handshake message, as the exact bytes on the wire.
    pub fn add(&mut self, raw: &[u8]) {
        self.buffer.extend_from_slice(raw);
        if let Some(hash) = &mut self.hash {
            hash.update(raw);
        }
    }

    /// The suite hash is now known; start incremental hashing over
    /// everything buffered so far.
    pub fn start_hash(&mut self, alg: HashAlgorithm) {
        let mut hash = RunningHash::new(alg);
        hash.update(&self.buffer);
        self.hash = Some(hash);
        self.alg = Some(alg);
    }

    pub fn algorithm(&self) -> Option<HashAlgorithm> {
        self.alg
    }

    /// Current digest. Must not be called before [`Transcript::start_hash`].
    pub fn current_hash(&self) -> Vec<u8> {
        self.hash
            .clone()
            .expect("transcript hash read before suite selection")
            .finalize()
    }

    /// Digest as if `extra` had also been added. Used for PSK binders,
    /// which cover the ClientHello truncated before the binder list.
    pub fn hash_given(&self, extra: &[u8]) -> Vec<u8> {
        let mut hash = self
            .hash
            .clone()
            .expect("transcript hash read before suite selection");
        hash.update(extra);
        hash.finalize()
    }

    /// Re-hash the whole raw transcript under a different algorithm.
    /// Needed for pre-1.3 CertificateVerify, where the signature hash can
    /// differ from the PRF hash.
    pub fn hash_with(&self, alg: HashAlgorithm) -> Vec<u8> {
        let mut hash = RunningHash::new(alg);
        hash.update(&self.buffer);
        hash.finalize()
    }

    /// The raw transcript bytes accumulated so far.
    pub fn raw(&self) -> &[u8] {
        &self.buffer
    }

    /// HelloRetryRequest transcript rule (RFC 8446 section 4.4.1): replace
    /// everything so far with a synthetic message_hash message containing
    /// the digest of the old transcript.
    pub fn rollup_for_hrr(&mut self) {
        let alg = self.alg.expect("HRR rollup before suite selection");
        let old_hash = self.current_hash();

        let mut synthetic = Vec::with_capacity(4 + old_hash.len());
        synthetic.push(HandshakeType::MessageHash.as_u8());
        synthetic.extend_from_slice(&(old_hash.len() as u32).to_be_bytes()[1..]);
        synthetic.extend_from_slice(&old_hash);

        self.buffer = synthetic.clone();
        let mut hash = RunningHash::new(alg);
        hash.update(&synthetic);
        self.hash = Some(hash);
    }
}

impl Default for Transcript {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffered_and_incremental_agree() {
        let mut early = Transcript::new();
        early.add(b"client hello bytes");
        early.start_hash(HashAlgorithm::SHA256);
        early.add(b"server hello bytes");

        let mut late = Transcript::new();
        late.add(b"client hello bytes");
        late.add(b"server hello bytes");
        late.start_hash(HashAlgorithm::SHA256);

        assert_eq!(early.current_hash(), late.current_hash());
    }

    #[test]
    fn hash_given_does_not_mutate() {
        let mut t = Transcript::new();
        t.add(b"one");
        t.start_hash(HashAlgorithm::SHA256);
        let before = t.current_hash();
        let given = t.hash_given(b"two");
        assert_ne!(before, given);
        assert_eq!(t.current_hash(), before);

        t.add(b"two");
        assert_eq!(t.current_hash(), given);
    }

    #[test]
    fn md5sha1_is_36_bytes() {
        let mut t = Transcript::new();
        t.add(b"legacy");
        t.start_hash(HashAlgorithm::MD5SHA1);
        assert_eq!(t.current_hash().len(), 36);
    }

    #[test]
    fn hrr_rollup_replaces_transcript() {
        let mut t = Transcript::new();
        t.add(b"first client hello");
        t.start_hash(HashAlgorithm::SHA256);
        let ch1_hash = t.current_hash();

        t.rollup_for_hrr();

        // The transcript now starts with message_hash(254) framing the old digest.
        let mut expected = Transcript::new();
        let mut synthetic = vec![254, 0, 0, 32];
        synthetic.extend_from_slice(&ch1_hash);
        expected.add(&synthetic);
        expected.start_hash(HashAlgorithm::SHA256);

        assert_eq!(t.current_hash(), expected.current_hash());
        assert_eq!(t.raw(), &synthetic[..]);
    }
}

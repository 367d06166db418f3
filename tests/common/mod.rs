//! Shared test plumbing: an in-memory pipe transport (stream or datagram
//! flavored) and lazily-generated credentials.

use std::io::{self, Read, Write};
use std::sync::mpsc::{channel, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use once_cell::sync::Lazy;
use timpl::certificate::{self, Credential};
use timpl::{Config, Conn};

pub static ECDSA_CRED: Lazy<Credential> =
    Lazy::new(|| certificate::generate_self_signed("timpl test ecdsa").unwrap());

pub static RSA_CRED: Lazy<Credential> =
    Lazy::new(|| certificate::generate_self_signed_rsa("timpl test rsa").unwrap());

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// One end of an in-memory connection. Stream mode concatenates writes;
/// datagram mode preserves write boundaries, one packet per read.
pub struct Pipe {
    tx: Sender<Vec<u8>>,
    rx: Receiver<Vec<u8>>,
    pending: Vec<u8>,
    datagram: bool,
}

pub fn pipe_pair(datagram: bool) -> (Pipe, Pipe) {
    let (atx, brx) = channel();
    let (btx, arx) = channel();
    (
        Pipe {
            tx: atx,
            rx: arx,
            pending: Vec::new(),
            datagram,
        },
        Pipe {
            tx: btx,
            rx: brx,
            pending: Vec::new(),
            datagram,
        },
    )
}

impl Read for Pipe {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if !self.pending.is_empty() {
            let n = usize::min(buf.len(), self.pending.len());
            buf[..n].copy_from_slice(&self.pending[..n]);
            self.pending.drain(..n);
            return Ok(n);
        }
        let packet = match self.rx.recv_timeout(Duration::from_secs(20)) {
            Ok(packet) => packet,
            Err(RecvTimeoutError::Disconnected) => return Ok(0),
            Err(RecvTimeoutError::Timeout) => {
                return Err(io::Error::new(io::ErrorKind::TimedOut, "pipe timeout"))
            }
        };
        if self.datagram {
            let n = usize::min(buf.len(), packet.len());
            buf[..n].copy_from_slice(&packet[..n]);
            Ok(n)
        } else {
            self.pending = packet;
            self.read(buf)
        }
    }
}

impl Write for Pipe {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.tx
            .send(buf.to_vec())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "peer gone"))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Run a client and a server against each other over a fresh pipe pair.
pub fn run_pair<C, S, CR, SR>(
    client_config: Arc<Config>,
    server_config: Arc<Config>,
    datagram: bool,
    client_fn: C,
    server_fn: S,
) -> (CR, SR)
where
    C: FnOnce(Conn) -> CR + Send,
    S: FnOnce(Conn) -> SR + Send,
    CR: Send,
    SR: Send,
{
    init_logging();
    let (client_pipe, server_pipe) = pipe_pair(datagram);
    thread::scope(|scope| {
        let server = scope.spawn(move || {
            let conn = if datagram {
                Conn::dtls_server(Box::new(server_pipe), server_config)
            } else {
                Conn::server(Box::new(server_pipe), server_config)
            };
            server_fn(conn)
        });
        let client_conn = if datagram {
            Conn::dtls_client(Box::new(client_pipe), client_config)
        } else {
            Conn::client(Box::new(client_pipe), client_config)
        };
        let client = client_fn(client_conn);
        (client, server.join().expect("server thread panicked"))
    })
}

/// Handshake both sides and exchange one round of application data each
/// way. Returns (negotiated version, suite, did_resume) seen by each side.
pub fn handshake_and_chat(
    client_config: Arc<Config>,
    server_config: Arc<Config>,
    datagram: bool,
) -> (ConnSummary, ConnSummary) {
    run_pair(
        client_config,
        server_config,
        datagram,
        |mut conn| {
            conn.handshake().expect("client handshake");
            conn.write(b"hello from client").unwrap();
            let mut buf = [0u8; 64];
            let n = conn.read(&mut buf).unwrap();
            assert_eq!(&buf[..n], b"hello from server");
            ConnSummary::of(&conn)
        },
        |mut conn| {
            conn.handshake().expect("server handshake");
            let mut buf = [0u8; 64];
            let n = conn.read(&mut buf).unwrap();
            assert_eq!(&buf[..n], b"hello from client");
            conn.write(b"hello from server").unwrap();
            ConnSummary::of(&conn)
        },
    )
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnSummary {
    pub version: timpl::Version,
    pub cipher_suite: u16,
    pub did_resume: bool,
    pub alpn: Option<Vec<u8>>,
    pub peer_cert_count: usize,
}

impl ConnSummary {
    pub fn of(conn: &Conn) -> ConnSummary {
        ConnSummary {
            version: conn.version().expect("negotiated version"),
            cipher_suite: conn.cipher_suite().expect("negotiated suite"),
            did_resume: conn.did_resume(),
            alpn: conn.alpn_protocol().map(|p| p.to_vec()),
            peer_cert_count: conn.peer_certificates().len(),
        }
    }
}

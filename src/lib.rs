//! A from-scratch TLS/DTLS protocol engine used as a test peer.
//!
//! timpl speaks TLS 1.0 through 1.3 and DTLS 1.0/1.2/1.3 at the wire
//! level, as both client and server, with the deliberately anomalous
//! behaviors ([`TestKnobs`]) needed to exercise another implementation's
//! error paths. It is not a production TLS stack: it favors strictness,
//! observability and protocol-violating configurability over throughput.
//!
//! ```no_run
//! use std::sync::Arc;
//! use timpl::{certificate, Config, Conn};
//!
//! let credential = certificate::generate_self_signed("test server").unwrap();
//! let config = Arc::new(Config::builder().credential(credential).build().unwrap());
//! let tcp = std::net::TcpStream::connect("127.0.0.1:4433").unwrap();
//! let mut conn = Conn::client(Box::new(tcp), config);
//! conn.handshake().unwrap();
//! conn.write(b"ping").unwrap();
//! ```

#![forbid(unsafe_code)]
#![warn(clippy::all)]

pub mod certificate;
mod client;
mod codec;
mod config;
mod conn;
mod crypto;
mod dtls;
mod error;
mod message;
mod record;
mod server;
pub mod session;
pub mod suites;
mod transcript;
pub mod types;

pub use config::{ClientAuthPolicy, Config, ConfigBuilder, TestKnobs};
pub use conn::{Conn, Transport};
pub use error::Error;
pub use types::{AlertDescription, NamedGroup, Version};

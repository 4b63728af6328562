//! # FTP/FTPS transfer engine
//!
//! Client side of RFC 959 with the extensions a transfer engine needs:
//! - **RFC 2228 / 4217**: AUTH TLS / FTPS (Explicit & Implicit), PBSZ/PROT
//! - **RFC 3659**: SIZE, MDTM, REST STREAM
//! - **RFC 2389**: FEAT negotiation
//! - **RFC 2428**: EPSV / EPRT (IPv6-ready)
//!
//! Architecture:
//! - `types`: data structures, enums, config, `FtpReply`
//! - `error`: FTP-specific error type
//! - `protocol`: line codec, reply assembly, stale-data probe, deadlines
//! - `connection`: DNS + ordered TCP connect
//! - `tls`: `TlsProvider` and the rustls implementation
//! - `handshake`: banner, AUTH TLS, USER/PASS, PBSZ/PROT, FEAT
//! - `capabilities`: FEAT parsing, `ServerQuirks`
//! - `control`: control channel with reconnect and stale-data recovery
//! - `transfer`: data channel negotiation (PASV/EPSV/PORT/EPRT)
//! - `data_channel`: per-command data socket and its final reply
//! - `throttle`: rate limiting and chunk sizing
//! - `transfer_loop`: chunked, resumable download/upload pump
//! - `properties`: SIZE, MDTM, HASH
//! - `verify`: post-transfer verification
//! - `client`: `FtpClient` façade
//! - `directory`: mkdir, rmdir, rename, delete
//! - `file_ops`: download/upload with existence policy, verify and retry
//! - `queue`: concurrent batch transfers over cloned connections

pub mod types;
pub mod error;
pub mod protocol;
pub mod connection;
pub mod tls;
pub mod handshake;
pub mod capabilities;
pub mod control;
pub mod transfer;
pub mod data_channel;
pub mod throttle;
pub mod transfer_loop;
pub mod properties;
pub mod verify;
pub mod client;
pub mod directory;
pub mod file_ops;
pub mod queue;

// Re-exports for lib.rs consumers
pub use types::*;
pub use error::{FtpError, FtpErrorKind, FtpResult};
pub use capabilities::{FtpCapability, NoQuirks, ServerFeatures, ServerQuirks};
pub use client::FtpClient;
pub use control::ControlChannel;
pub use data_channel::DataChannel;
pub use queue::{TransferOutcome, TransferQueue, TransferRequest};
pub use tls::{RustlsProvider, TlsProvider};
pub use transfer::{open_data_channel, open_data_channel_at, Restart};
pub use transfer_loop::{TransferJob, Unseekable, UploadSource};
pub use verify::{FtpHash, LocalSide, ServerVerifier, VerificationProvider};

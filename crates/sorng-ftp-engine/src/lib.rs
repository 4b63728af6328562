//! **sorng-ftp-engine**: FTP/FTPS client transfer engine.
//!
//! | Module | Purpose |
//! |---|---|
//! | [`ftp::control`] | Control channel: command/reply, reconnect, stale-data recovery |
//! | [`ftp::transfer`] | Data channel negotiation with EPSV→PASV / EPRT→PORT fallback |
//! | [`ftp::transfer_loop`] | Chunked, rate-limited, resumable transfer pump |
//! | [`ftp::file_ops`] | `download_file` / `upload_file` with verification and retry |
//! | [`ftp::queue`] | Bounded-concurrency batch transfers |

pub mod ftp;

pub use ftp::*;

//! FTP-specific error type.

use crate::ftp::types::FtpReply;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;

/// Categorised FTP error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FtpError {
    pub kind: FtpErrorKind,
    pub message: String,
    /// FTP response code that triggered the error, if any.
    pub code: Option<u16>,
    pub session_id: Option<String>,
    /// Underlying socket error, kept to decide whether a transfer may resume.
    #[serde(skip)]
    pub io_kind: Option<io::ErrorKind>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum FtpErrorKind {
    /// TCP / DNS resolution failure.
    ConnectionFailed,
    /// AUTH TLS / TLS handshake failure.
    TlsFailed,
    /// Wrong username/password.
    AuthFailed,
    /// Server returned a 4xx/5xx for a command.
    CommandRejected,
    /// Data channel could not be established (PASV/PORT failed).
    DataChannelFailed,
    /// Transfer aborted, incomplete, or its data socket failed.
    TransferFailed,
    /// Server sent an un-parseable response.
    ProtocolError,
    /// An I/O error on the local side (file read/write).
    IoError,
    /// Operation timed out.
    Timeout,
    /// Control connection is gone.
    Disconnected,
    /// Permission denied on the server.
    PermissionDenied,
    /// File/directory not found on the server.
    NotFound,
    /// Disk quota exceeded.
    QuotaExceeded,
    /// Post-transfer verification did not match.
    VerificationFailed,
    /// Operation cancelled by the caller.
    Cancelled,
    /// Config / parameter validation error.
    InvalidConfig,
    /// Catch-all.
    Unknown,
}

pub type FtpResult<T> = Result<T, FtpError>;

// ── Construction helpers ─────────────────────────────────────────────

impl FtpError {
    pub fn new(kind: FtpErrorKind, msg: impl Into<String>) -> Self {
        Self {
            kind,
            message: msg.into(),
            code: None,
            session_id: None,
            io_kind: None,
        }
    }

    pub fn with_code(mut self, code: u16) -> Self {
        self.code = Some(code);
        self
    }

    pub fn with_session(mut self, id: impl Into<String>) -> Self {
        self.session_id = Some(id.into());
        self
    }

    pub fn with_io_kind(mut self, kind: io::ErrorKind) -> Self {
        self.io_kind = Some(kind);
        self
    }

    // ── Convenience constructors ─────────────────────────────────

    pub fn connection_failed(msg: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::ConnectionFailed, msg)
    }

    pub fn tls_failed(msg: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::TlsFailed, msg)
    }

    pub fn auth_failed(msg: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::AuthFailed, msg)
    }

    pub fn command_rejected(code: u16, msg: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::CommandRejected, msg).with_code(code)
    }

    pub fn data_channel(msg: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::DataChannelFailed, msg)
    }

    pub fn transfer_failed(msg: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::TransferFailed, msg)
    }

    pub fn protocol_error(msg: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::ProtocolError, msg)
    }

    pub fn io_error(msg: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::IoError, msg)
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::Timeout, msg)
    }

    pub fn disconnected(msg: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::Disconnected, msg)
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::NotFound, msg)
    }

    pub fn verification_failed(msg: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::VerificationFailed, msg)
    }

    pub fn cancelled(msg: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::Cancelled, msg)
    }

    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::InvalidConfig, msg)
    }

    /// A failure on the data socket, keeping the socket error kind.
    pub fn data_io(context: &str, e: &io::Error) -> Self {
        let kind = if e.kind() == io::ErrorKind::TimedOut {
            FtpErrorKind::Timeout
        } else {
            FtpErrorKind::TransferFailed
        };
        Self::new(kind, format!("{}: {}", context, e)).with_io_kind(e.kind())
    }

    /// Classify a non-success reply into the most appropriate error kind.
    pub fn from_reply(reply: &FtpReply) -> Self {
        let text = reply.text();
        let code = match reply.code_u16() {
            Some(code) => code,
            None => {
                return Self::disconnected(format!(
                    "No reply to '{}'",
                    reply.command
                ))
            }
        };
        let kind = match code {
            421 => FtpErrorKind::Disconnected,
            425 | 426 => FtpErrorKind::DataChannelFailed,
            430 | 530 => FtpErrorKind::AuthFailed,
            450 | 550 => {
                let lower = text.to_lowercase();
                if lower.contains("permission") || lower.contains("denied") {
                    FtpErrorKind::PermissionDenied
                } else if lower.contains("not found") || lower.contains("no such") {
                    FtpErrorKind::NotFound
                } else if lower.contains("quota") {
                    FtpErrorKind::QuotaExceeded
                } else {
                    FtpErrorKind::CommandRejected
                }
            }
            451 | 452 | 552 => FtpErrorKind::TransferFailed,
            500..=504 => FtpErrorKind::CommandRejected,
            _ if code >= 400 => FtpErrorKind::CommandRejected,
            _ => FtpErrorKind::Unknown,
        };
        let message = if reply.command.is_empty() {
            text
        } else {
            format!("{} -> {}", reply.command, text)
        };
        Self::new(kind, message).with_code(code)
    }

    // ── Classification ───────────────────────────────────────────

    pub fn is_cancelled(&self) -> bool {
        self.kind == FtpErrorKind::Cancelled
    }

    pub fn is_timeout(&self) -> bool {
        self.kind == FtpErrorKind::Timeout
    }

    /// Socket-level failure (control or data), as opposed to a server
    /// reply or a local problem.
    pub fn is_transport(&self) -> bool {
        matches!(
            self.kind,
            FtpErrorKind::ConnectionFailed
                | FtpErrorKind::Disconnected
                | FtpErrorKind::Timeout
                | FtpErrorKind::DataChannelFailed
                | FtpErrorKind::TransferFailed
                | FtpErrorKind::TlsFailed
        ) && self.code.is_none()
    }

    /// A dropped data connection that a transfer may pick up again with REST.
    pub fn is_resumable(&self) -> bool {
        self.is_transport()
            && matches!(
                self.io_kind,
                Some(io::ErrorKind::ConnectionReset)
                    | Some(io::ErrorKind::ConnectionAborted)
                    | Some(io::ErrorKind::BrokenPipe)
                    | Some(io::ErrorKind::UnexpectedEof)
            )
    }
}

impl fmt::Display for FtpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(code) = self.code {
            write!(f, "[FTP {:?} {}] {}", self.kind, code, self.message)
        } else {
            write!(f, "[FTP {:?}] {}", self.kind, self.message)
        }
    }
}

impl std::error::Error for FtpError {}

impl From<io::Error> for FtpError {
    fn from(e: io::Error) -> Self {
        if e.kind() == io::ErrorKind::TimedOut {
            Self::timeout(format!("I/O timeout: {}", e)).with_io_kind(e.kind())
        } else {
            Self::io_error(e.to_string()).with_io_kind(e.kind())
        }
    }
}

impl From<FtpError> for String {
    fn from(e: FtpError) -> String {
        e.to_string()
    }
}

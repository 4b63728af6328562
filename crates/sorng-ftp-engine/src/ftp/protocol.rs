//! Low-level FTP command/reply codec (RFC 959 §4).
//!
//! Handles:
//! - Sending FTP commands terminated with `\r\n` in the session encoding
//! - Assembling single-line and multi-line replies
//! - Draining asynchronous keep-alive replies after a transfer
//! - Probing the socket for unsolicited (stale) bytes
//! - Racing every socket await against cancellation and a deadline

use crate::ftp::error::{FtpError, FtpResult};
use crate::ftp::types::{FtpReply, TextEncoding};
use futures::FutureExt;
use lazy_static::lazy_static;
use regex::Regex;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::Instant;
use tokio_rustls::client::TlsStream;
use tokio_util::sync::CancellationToken;

lazy_static! {
    static ref REPLY_LINE: Regex =
        Regex::new(r"^(?P<code>[0-9]{3})(?P<sep>[- ])?(?P<message>.*)$").unwrap();
}

/// Abstraction over plain TCP or TLS-wrapped read half.
pub enum ReadHalf {
    Plain(BufReader<OwnedReadHalf>),
    Tls(BufReader<tokio::io::ReadHalf<TlsStream<TcpStream>>>),
}

/// Abstraction over plain TCP or TLS-wrapped write half.
pub enum WriteHalf {
    Plain(OwnedWriteHalf),
    Tls(tokio::io::WriteHalf<TlsStream<TcpStream>>),
}

/// Result of looking for unread bytes before sending a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StaleData {
    Clean,
    Data(String),
    /// The server closed the connection while idle.
    Closed,
}

/// The FTP command/reply codec operating on split halves.
pub struct FtpCodec {
    reader: ReadHalf,
    writer: WriteHalf,
    /// Partial line carried across a cancelled read.
    line_buf: Vec<u8>,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    encoding: TextEncoding,
    /// Socket reads and writes since the codec was created.
    io_ops: u64,
}

impl FtpCodec {
    /// Create a codec from a plain TCP stream.
    pub fn from_tcp(stream: TcpStream, encoding: TextEncoding) -> FtpResult<Self> {
        let local_addr = stream.local_addr()?;
        let peer_addr = stream.peer_addr()?;
        let (rd, wr) = stream.into_split();
        Ok(Self {
            reader: ReadHalf::Plain(BufReader::new(rd)),
            writer: WriteHalf::Plain(wr),
            line_buf: Vec::new(),
            local_addr,
            peer_addr,
            encoding,
            io_ops: 0,
        })
    }

    /// Create a codec from a TLS-wrapped TCP stream.
    pub fn from_tls(stream: TlsStream<TcpStream>, encoding: TextEncoding) -> FtpResult<Self> {
        let local_addr = stream.get_ref().0.local_addr()?;
        let peer_addr = stream.get_ref().0.peer_addr()?;
        let (rd, wr) = tokio::io::split(stream);
        Ok(Self {
            reader: ReadHalf::Tls(BufReader::new(rd)),
            writer: WriteHalf::Tls(wr),
            line_buf: Vec::new(),
            local_addr,
            peer_addr,
            encoding,
            io_ops: 0,
        })
    }

    /// Reunite the plain halves so the socket can be wrapped in TLS
    /// (after `AUTH TLS` → 234).
    pub fn into_tcp(self) -> FtpResult<TcpStream> {
        let rd = match self.reader {
            ReadHalf::Plain(br) => {
                if !br.buffer().is_empty() || !self.line_buf.is_empty() {
                    return Err(FtpError::protocol_error(
                        "Unexpected plaintext after AUTH TLS reply",
                    ));
                }
                br.into_inner()
            }
            ReadHalf::Tls(_) => {
                return Err(FtpError::protocol_error(
                    "Cannot upgrade: connection is already TLS",
                ))
            }
        };
        let wr = match self.writer {
            WriteHalf::Plain(w) => w,
            WriteHalf::Tls(_) => {
                return Err(FtpError::protocol_error(
                    "Cannot upgrade: connection is already TLS",
                ))
            }
        };
        rd.reunite(wr)
            .map_err(|e| FtpError::protocol_error(format!("Reunite failed: {}", e)))
    }

    pub fn is_encrypted(&self) -> bool {
        matches!(self.reader, ReadHalf::Tls(_))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn io_ops(&self) -> u64 {
        self.io_ops
    }

    pub fn set_encoding(&mut self, encoding: TextEncoding) {
        self.encoding = encoding;
    }

    /// Send a raw FTP command (without trailing CRLF; it is added here).
    pub async fn send_command(&mut self, cmd: &str) -> FtpResult<()> {
        let mut line = self.encoding.encode(cmd);
        line.extend_from_slice(b"\r\n");
        match &mut self.writer {
            WriteHalf::Plain(w) => {
                w.write_all(&line).await?;
                w.flush().await?;
            }
            WriteHalf::Tls(w) => {
                w.write_all(&line).await?;
                w.flush().await?;
            }
        }
        self.io_ops += 1;
        log::trace!(">>> {}", mask_command(cmd));
        Ok(())
    }

    /// Read a single line from the control channel, without the CRLF.
    async fn read_line(&mut self) -> FtpResult<String> {
        let n = match &mut self.reader {
            ReadHalf::Plain(r) => r.read_until(b'\n', &mut self.line_buf).await?,
            ReadHalf::Tls(r) => r.read_until(b'\n', &mut self.line_buf).await?,
        };
        if n == 0 && self.line_buf.is_empty() {
            return Err(FtpError::disconnected("Server closed connection")
                .with_io_kind(io::ErrorKind::UnexpectedEof));
        }
        self.io_ops += 1;
        let raw = std::mem::take(&mut self.line_buf);
        let line = self
            .encoding
            .decode(&raw)
            .trim_end_matches(['\r', '\n'])
            .to_string();
        log::trace!("<<< {}", line);
        Ok(line)
    }

    /// Read one complete reply (possibly multi-line).
    ///
    /// ```text
    /// 220-Welcome to my FTP server
    /// 220-This is line 2
    /// 220 End of greeting
    /// ```
    pub async fn read_reply(&mut self) -> FtpResult<FtpReply> {
        let mut assembler = ReplyAssembler::default();
        loop {
            let line = self.read_line().await?;
            match assembler.push(&line) {
                LineOutcome::Continue => {}
                LineOutcome::Complete(reply) => return Ok(reply),
                LineOutcome::Malformed => {
                    return Err(FtpError::protocol_error(format!(
                        "Malformed reply line: '{}'",
                        line
                    )))
                }
            }
        }
    }

    /// Read replies for up to `window`, skipping keep-alive echoes and
    /// folding superseded preliminary replies into the info lines of the
    /// first completion/negative reply, which is returned.
    ///
    /// Servers usually answer NOOPs sent mid-transfer only after the final
    /// transfer reply, so once that reply is in hand reading continues until
    /// `expected_echoes` echoes have been consumed or the window closes.
    /// Returns the reply and the number of echoes consumed.
    pub async fn read_reply_draining(
        &mut self,
        window: Duration,
        expected_echoes: u32,
    ) -> FtpResult<(FtpReply, u32)> {
        let deadline = Instant::now() + window;
        let mut carried: Vec<String> = Vec::new();
        let mut pending: Option<FtpReply> = None;
        let mut terminal: Option<FtpReply> = None;
        let mut echoes = 0u32;

        loop {
            if terminal.is_some() && echoes >= expected_echoes {
                break;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            let mut reply = match tokio::time::timeout(remaining, self.read_reply()).await {
                Ok(reply) => reply?,
                Err(_) => break,
            };
            if is_keepalive_echo(&reply) {
                log::debug!("Discarding keep-alive reply: {}", reply.status_line());
                echoes += 1;
                continue;
            }
            if terminal.is_some() {
                log::warn!("Discarding unexpected reply after transfer: {}", reply.status_line());
                continue;
            }
            if let Some(mut prev) = pending.take() {
                carried.append(&mut prev.info_lines);
                carried.push(prev.status_line());
            }
            if reply.is_preliminary() {
                pending = Some(reply);
                continue;
            }
            carried.append(&mut reply.info_lines);
            reply.info_lines = std::mem::take(&mut carried);
            terminal = Some(reply);
        }

        let reply = match (terminal, pending) {
            (Some(reply), _) => reply,
            (None, Some(mut last)) => {
                carried.append(&mut last.info_lines);
                last.info_lines = carried;
                last
            }
            (None, None) => FtpReply::none(),
        };
        Ok((reply, echoes))
    }

    /// Collect whatever bytes are already readable without waiting.
    pub fn probe_stale(&mut self) -> FtpResult<StaleData> {
        let mut stale = std::mem::take(&mut self.line_buf);
        loop {
            let polled = match &mut self.reader {
                ReadHalf::Plain(r) => r.fill_buf().now_or_never().map(|res| res.map(|b| b.to_vec())),
                ReadHalf::Tls(r) => r.fill_buf().now_or_never().map(|res| res.map(|b| b.to_vec())),
            };
            match polled {
                None => break,
                Some(Ok(bytes)) if bytes.is_empty() => return Ok(StaleData::Closed),
                Some(Ok(bytes)) => {
                    match &mut self.reader {
                        ReadHalf::Plain(r) => r.consume(bytes.len()),
                        ReadHalf::Tls(r) => r.consume(bytes.len()),
                    }
                    self.io_ops += 1;
                    stale.extend_from_slice(&bytes);
                }
                Some(Err(e)) => return Err(e.into()),
            }
        }
        if stale.is_empty() {
            Ok(StaleData::Clean)
        } else {
            Ok(StaleData::Data(self.encoding.decode(&stale)))
        }
    }

    /// Best-effort close (sends TLS close_notify when encrypted).
    pub async fn shutdown(&mut self) {
        let _ = match &mut self.writer {
            WriteHalf::Plain(w) => w.shutdown().await,
            WriteHalf::Tls(w) => w.shutdown().await,
        };
    }
}

// ─── Reply assembly ──────────────────────────────────────────────────

/// What a single line did to the reply being assembled.
#[derive(Debug, PartialEq, Eq)]
pub enum LineOutcome {
    Continue,
    Complete(FtpReply),
    Malformed,
}

/// Line-by-line reply state machine.
///
/// Inside a multi-line block every line that is not `<opening code><space>`
/// is an info line, including lines carrying a different code.
#[derive(Debug, Default)]
pub struct ReplyAssembler {
    code: Option<String>,
    multiline: bool,
    info_lines: Vec<String>,
}

impl ReplyAssembler {
    pub fn push(&mut self, line: &str) -> LineOutcome {
        let parsed = REPLY_LINE.captures(line).map(|caps| {
            (
                caps["code"].to_string(),
                caps.name("sep").map(|m| m.as_str()),
                caps["message"].to_string(),
            )
        });

        if self.multiline {
            if let Some((code, sep, message)) = &parsed {
                if *sep == Some(" ") && self.code.as_deref() == Some(code.as_str()) {
                    return self.complete(code.clone(), message.clone());
                }
            }
            self.info_lines.push(line.to_string());
            return LineOutcome::Continue;
        }

        match parsed {
            Some((code, Some("-"), _)) => {
                self.code = Some(code);
                self.multiline = true;
                self.info_lines.push(line.to_string());
                LineOutcome::Continue
            }
            Some((code, _, message)) => self.complete(code, message),
            None if line.trim().is_empty() => LineOutcome::Continue,
            None => LineOutcome::Malformed,
        }
    }

    fn complete(&mut self, code: String, message: String) -> LineOutcome {
        let reply = FtpReply {
            code: Some(code),
            message,
            info_lines: std::mem::take(&mut self.info_lines),
            command: String::new(),
        };
        self.code = None;
        self.multiline = false;
        LineOutcome::Complete(reply)
    }
}

/// Replies to NOOPs sent during a transfer.
fn is_keepalive_echo(reply: &FtpReply) -> bool {
    match reply.code.as_deref() {
        Some("200") => reply.message.to_uppercase().contains("NOOP"),
        Some("500") => true,
        _ => false,
    }
}

/// Hide the password in logged commands.
pub fn mask_command(cmd: &str) -> String {
    if cmd.get(..5).is_some_and(|verb| verb.eq_ignore_ascii_case("PASS ")) {
        "PASS ***".to_string()
    } else {
        cmd.to_string()
    }
}

// ─── Deadlines ───────────────────────────────────────────────────────

/// Run `fut` unless `cancel` fires first or `limit` elapses.
pub async fn guarded<T, F>(
    cancel: &CancellationToken,
    limit: Option<Duration>,
    what: &str,
    fut: F,
) -> FtpResult<T>
where
    F: Future<Output = FtpResult<T>>,
{
    match limit {
        Some(limit) => tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(FtpError::cancelled(format!("{} cancelled", what))),
            res = tokio::time::timeout(limit, fut) => match res {
                Ok(inner) => inner,
                Err(_) => Err(FtpError::timeout(format!("{} timed out after {:?}", what, limit))
                    .with_io_kind(io::ErrorKind::TimedOut)),
            },
        },
        None => tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(FtpError::cancelled(format!("{} cancelled", what))),
            res = fut => res,
        },
    }
}

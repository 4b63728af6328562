//! The control channel: one command, one reply, with transparent recovery.
//!
//! Before a command goes out the channel makes sure the socket is usable:
//! it reconnects when the socket is gone, when an encrypted session has
//! carried too many operations, or when unsolicited bytes are waiting.
//! Reconnection caches the working directory first and restores it (and the
//! data type) afterwards, then sends the original command. It happens at
//! most once per call.

use crate::ftp::capabilities::{FtpCapability, NoQuirks, ServerFeatures, ServerQuirks};
use crate::ftp::error::{FtpError, FtpResult};
use crate::ftp::handshake;
use crate::ftp::protocol::{guarded, mask_command, FtpCodec, StaleData};
use crate::ftp::tls::{RustlsProvider, TlsProvider};
use crate::ftp::types::*;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::time::Instant;
use tokio_rustls::client::TlsStream;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Commands that open a sequence the server expects to finish on the same
/// connection.
const CRITICAL_START: &[&str] = &["EPSV", "PASV", "EPRT", "PORT", "PRET", "REST"];
/// Commands that close such a sequence.
const CRITICAL_END: &[&str] = &[
    "ABOR", "LIST", "NLST", "MLSD", "STOR", "STOU", "APPE", "RETR",
];

/// Mutable per-connection state. Lives exactly as long as the
/// `ControlChannel`; the socket underneath may be replaced.
#[derive(Debug, Clone, Default)]
pub struct SessionState {
    pub last_working_dir: Option<String>,
    pub current_data_type: Option<TransferType>,
    pub in_critical_sequence: bool,
    pub epsv_not_supported: bool,
    /// Stale checks are off while a handshake is running.
    pub allow_stale_check: bool,
    /// A data channel was opened and its final reply not read yet.
    pub pending_data_reply: bool,
    /// NOOPs written mid-transfer whose echoes have not been read yet.
    pub unanswered_noops: u32,
    pub last_command: Option<String>,
    pub last_command_at: Option<Instant>,
    pub banner: Option<String>,
    pub reconnects: u32,
}

pub struct ControlChannel {
    session_id: String,
    config: FtpConnectionConfig,
    codec: Option<FtpCodec>,
    tls: Arc<dyn TlsProvider>,
    quirks: Arc<dyn ServerQuirks>,
    features: ServerFeatures,
    cancel: CancellationToken,
    state: SessionState,
}

impl ControlChannel {
    pub fn new(
        config: FtpConnectionConfig,
        tls: Arc<dyn TlsProvider>,
        quirks: Arc<dyn ServerQuirks>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            session_id: Uuid::new_v4().to_string(),
            config,
            codec: None,
            tls,
            quirks,
            features: ServerFeatures::default(),
            cancel,
            state: SessionState::default(),
        }
    }

    /// Channel with the rustls provider and no quirks.
    pub fn with_defaults(config: FtpConnectionConfig) -> FtpResult<Self> {
        let tls = Arc::new(RustlsProvider::new(config.accept_invalid_certs)?);
        Ok(Self::new(
            config,
            tls,
            Arc::new(NoQuirks),
            CancellationToken::new(),
        ))
    }

    // ─── Connect / reconnect ─────────────────────────────────────

    pub async fn connect(&mut self) -> FtpResult<()> {
        self.config.validate()?;
        self.establish(false).await
    }

    /// Reconnect now if the socket was torn down.
    pub async fn ensure_connected(&mut self) -> FtpResult<()> {
        if self.codec.is_none() {
            self.reconnect("not connected").await?;
        }
        Ok(())
    }

    async fn establish(&mut self, reconnect: bool) -> FtpResult<()> {
        self.state.in_critical_sequence = true;
        self.state.allow_stale_check = false;
        self.state.pending_data_reply = false;
        self.state.unanswered_noops = 0;

        let res = self.login_and_restore(reconnect).await;
        self.state.in_critical_sequence = false;
        self.state.allow_stale_check = true;
        res
    }

    async fn login_and_restore(&mut self, reconnect: bool) -> FtpResult<()> {
        let established = handshake::login(&self.config, self.tls.as_ref(), &self.cancel)
            .await
            .map_err(|e| e.with_session(self.session_id.clone()))?;
        self.codec = Some(established.codec);
        self.features = established.features;
        self.state.banner = Some(established.banner);

        if reconnect {
            if let Some(data_type) = self.state.current_data_type {
                self.raw_execute(data_type.command()).await?.into_result()?;
            }
            if let Some(dir) = self.state.last_working_dir.clone() {
                let reply = self.raw_execute(&format!("CWD {}", dir)).await?;
                if !reply.success() {
                    log::warn!("Could not restore working directory {}: {}", dir, reply.status_line());
                    self.state.last_working_dir = None;
                }
            }
        } else {
            let data_type = self.config.transfer_type;
            self.raw_execute(data_type.command()).await?.into_result()?;
            self.state.current_data_type = Some(data_type);
            if let Some(dir) = self.config.initial_directory.clone() {
                self.raw_execute(&format!("CWD {}", dir)).await?.into_result()?;
                self.state.last_working_dir = None;
            }
        }
        Ok(())
    }

    /// Why the socket must be replaced before the next command, if at all.
    async fn reconnect_reason(&mut self) -> FtpResult<Option<&'static str>> {
        if self.codec.is_none() {
            return Ok(Some("not connected"));
        }

        if self.state.pending_data_reply {
            self.state.pending_data_reply = false;
            let reply = self.read_reply(false).await?;
            log::warn!(
                "Discarded unread transfer reply before next command: {}",
                reply.status_line()
            );
        }

        let Some(codec) = self.codec.as_mut() else {
            return Ok(Some("not connected"));
        };

        if codec.is_encrypted()
            && self.config.tls_session_length > 0
            && !self.state.in_critical_sequence
            && codec.io_ops() > self.config.tls_session_length
        {
            return Ok(Some("TLS session length exceeded"));
        }

        if self.config.stale_data_check && self.state.allow_stale_check {
            match codec.probe_stale() {
                Ok(StaleData::Clean) => {}
                Ok(StaleData::Data(text)) => {
                    log::warn!("Stale data on control channel: {}", text.trim());
                    return Ok(Some("stale data on control channel"));
                }
                Ok(StaleData::Closed) => return Ok(Some("server closed the connection")),
                Err(e) => {
                    log::warn!("Stale data probe failed: {}", e);
                    return Ok(Some("control socket error"));
                }
            }
        }
        Ok(None)
    }

    async fn reconnect(&mut self, reason: &str) -> FtpResult<()> {
        log::warn!("Reconnecting session {}: {}", self.session_id, reason);
        if self.codec.is_some() && self.state.last_working_dir.is_none() {
            self.state.in_critical_sequence = true;
            if let Ok(reply) = self.raw_execute("PWD").await {
                if reply.success() {
                    self.state.last_working_dir = parse_pwd(&reply.message).ok();
                }
            }
        }
        self.disconnect().await;
        self.state.reconnects += 1;
        self.establish(true).await
    }

    // ─── Commands ────────────────────────────────────────────────

    /// Send `command` and read its reply. A negative reply is returned as a
    /// value; only socket and protocol failures are errors.
    pub async fn execute(&mut self, command: &str) -> FtpResult<FtpReply> {
        if self.codec.is_none() && is_verb(command, "QUIT") {
            return Ok(FtpReply {
                code: Some("200".into()),
                message: "Connection already closed.".into(),
                info_lines: Vec::new(),
                command: command.to_string(),
            });
        }

        if let Some(reason) = self.reconnect_reason().await? {
            self.reconnect(reason).await?;
        }

        let reply = self.raw_execute(command).await?;
        self.after_execute(command, &reply);
        if is_verb(command, "QUIT") {
            self.disconnect().await;
        }
        Ok(reply)
    }

    /// Send without any precondition checks.
    async fn raw_execute(&mut self, command: &str) -> FtpResult<FtpReply> {
        let masked = mask_command(command);
        log::info!("> {}", masked);
        self.send(command).await?;
        let mut reply = self.read_reply(false).await?;
        reply.command = masked;
        Ok(reply)
    }

    async fn send(&mut self, command: &str) -> FtpResult<()> {
        let codec = self
            .codec
            .as_mut()
            .ok_or_else(|| FtpError::disconnected("Control connection is closed"))?;
        let res = guarded(
            &self.cancel,
            Some(self.config.read_timeout()),
            "Sending command",
            codec.send_command(command),
        )
        .await;
        match res {
            Ok(()) => {
                self.state.last_command = Some(mask_command(command));
                self.state.last_command_at = Some(Instant::now());
                Ok(())
            }
            Err(e) => {
                self.teardown();
                Err(e.with_session(self.session_id.clone()))
            }
        }
    }

    /// Read one reply. In drain mode keep-alive echoes are skipped and
    /// preliminary replies are superseded by the next one.
    pub async fn read_reply(&mut self, drain: bool) -> FtpResult<FtpReply> {
        let expected_echoes = self.state.unanswered_noops;
        let codec = self
            .codec
            .as_mut()
            .ok_or_else(|| FtpError::disconnected("Control connection is closed"))?;
        let res = if drain {
            let window = self.config.drain_window();
            let drained = guarded(
                &self.cancel,
                Some(window + self.config.read_timeout()),
                "Draining replies",
                codec.read_reply_draining(window, expected_echoes),
            )
            .await;
            drained.map(|(reply, echoes)| {
                // Late echoes are left to the stale-data check.
                self.state.unanswered_noops = 0;
                if echoes < expected_echoes {
                    log::debug!(
                        "{} keep-alive replies outstanding after drain",
                        expected_echoes - echoes
                    );
                }
                reply
            })
        } else {
            guarded(
                &self.cancel,
                Some(self.config.read_timeout()),
                "Reading reply",
                codec.read_reply(),
            )
            .await
        };
        match res {
            Ok(reply) => {
                for line in &reply.info_lines {
                    log::debug!("< {}", line);
                }
                log::info!("< {}", reply.status_line());
                Ok(reply)
            }
            Err(e) => {
                self.teardown();
                Err(e.with_session(self.session_id.clone()))
            }
        }
    }

    fn after_execute(&mut self, command: &str, reply: &FtpReply) {
        if !reply.success() {
            return;
        }
        let upper = command.trim().to_uppercase();
        let verb = upper.split_whitespace().next().unwrap_or("");
        match verb {
            "CWD" | "CDUP" | "XCWD" => self.state.last_working_dir = None,
            "TYPE" if upper == "TYPE I" => self.state.current_data_type = Some(TransferType::Binary),
            "TYPE" if upper == "TYPE A" => self.state.current_data_type = Some(TransferType::Ascii),
            _ => {}
        }
        if self.config.tls_session_length > 0 {
            if CRITICAL_START.contains(&verb) {
                self.state.in_critical_sequence = true;
            } else if CRITICAL_END.contains(&verb) {
                self.state.in_critical_sequence = false;
            }
        }
    }

    /// Write a NOOP without waiting for its reply (used mid-transfer; the
    /// echo is drained when the transfer's final reply is read).
    pub async fn send_keepalive(&mut self) -> FtpResult<()> {
        self.send("NOOP").await?;
        self.state.unanswered_noops += 1;
        Ok(())
    }

    // ─── Session helpers ─────────────────────────────────────────

    /// Current directory, cached until the next CWD.
    pub async fn get_working_directory(&mut self) -> FtpResult<String> {
        if let Some(dir) = &self.state.last_working_dir {
            return Ok(dir.clone());
        }
        let reply = self.execute("PWD").await?.into_result()?;
        let dir = parse_pwd(&reply.message)?;
        self.state.last_working_dir = Some(dir.clone());
        Ok(dir)
    }

    pub async fn set_working_directory(&mut self, path: &str) -> FtpResult<()> {
        self.execute(&format!("CWD {}", path)).await?.into_result()?;
        Ok(())
    }

    /// Switch TYPE unless already in `data_type`.
    pub async fn set_data_type(&mut self, data_type: TransferType) -> FtpResult<()> {
        if self.state.current_data_type == Some(data_type) && self.is_connected() {
            return Ok(());
        }
        self.execute(data_type.command()).await?.into_result()?;
        self.state.current_data_type = Some(data_type);
        Ok(())
    }

    pub async fn noop(&mut self) -> FtpResult<FtpReply> {
        self.execute("NOOP").await?.into_result()
    }

    /// Gracefully close the session.
    pub async fn quit(&mut self) -> FtpResult<()> {
        if self.codec.is_some() {
            if let Err(e) = self.raw_execute("QUIT").await {
                log::debug!("QUIT failed: {}", e);
            }
        }
        self.disconnect().await;
        Ok(())
    }

    /// Drop the socket without QUIT.
    pub async fn disconnect(&mut self) {
        if let Some(mut codec) = self.codec.take() {
            codec.shutdown().await;
        }
        self.state.pending_data_reply = false;
        self.state.unanswered_noops = 0;
    }

    /// Forget the socket after a failure; the next command reconnects.
    pub(crate) fn teardown(&mut self) {
        if self.codec.take().is_some() {
            log::debug!("Control socket of session {} torn down", self.session_id);
        }
        self.state.pending_data_reply = false;
        self.state.unanswered_noops = 0;
    }

    pub(crate) async fn activate_tls(&self, tcp: TcpStream) -> FtpResult<TlsStream<TcpStream>> {
        guarded(
            &self.cancel,
            Some(self.config.data_connect_timeout()),
            "Data channel TLS handshake",
            self.tls.activate(tcp, &self.config.host),
        )
        .await
    }

    // ─── Accessors ───────────────────────────────────────────────

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn config(&self) -> &FtpConnectionConfig {
        &self.config
    }

    pub fn is_connected(&self) -> bool {
        self.codec.is_some()
    }

    pub fn is_encrypted(&self) -> bool {
        self.codec.as_ref().map(|c| c.is_encrypted()).unwrap_or(false)
    }

    pub fn local_addr(&self) -> FtpResult<SocketAddr> {
        self.codec
            .as_ref()
            .map(|c| c.local_addr())
            .ok_or_else(|| FtpError::disconnected("Control connection is closed"))
    }

    pub fn peer_addr(&self) -> FtpResult<SocketAddr> {
        self.codec
            .as_ref()
            .map(|c| c.peer_addr())
            .ok_or_else(|| FtpError::disconnected("Control connection is closed"))
    }

    pub fn has_feature(&self, cap: FtpCapability) -> bool {
        self.features.has(cap)
    }

    pub fn features(&self) -> &ServerFeatures {
        &self.features
    }

    pub fn quirks(&self) -> &Arc<dyn ServerQuirks> {
        &self.quirks
    }

    pub fn tls_provider(&self) -> &Arc<dyn TlsProvider> {
        &self.tls
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn set_cancel_token(&mut self, cancel: CancellationToken) {
        self.cancel = cancel;
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub(crate) fn state_mut(&mut self) -> &mut SessionState {
        &mut self.state
    }

    pub fn session_info(&self) -> FtpSessionInfo {
        FtpSessionInfo {
            id: self.session_id.clone(),
            host: self.config.host.clone(),
            port: self.config.port,
            username: self.config.username.clone(),
            security: self.config.security,
            connected: self.is_connected(),
            encrypted: self.is_encrypted(),
            working_directory: self.state.last_working_dir.clone(),
            data_type: self.state.current_data_type,
            server_banner: self.state.banner.clone(),
            features: self.features.raw_features.clone(),
            reconnects: self.state.reconnects,
            label: self.config.label.clone(),
        }
    }
}

fn is_verb(command: &str, verb: &str) -> bool {
    command
        .split_whitespace()
        .next()
        .map(|v| v.eq_ignore_ascii_case(verb))
        .unwrap_or(false)
}

/// Parse `257 "/some/path"` into the path string.
pub(crate) fn parse_pwd(text: &str) -> FtpResult<String> {
    if let Some(start) = text.find('"') {
        if let Some(end) = text[start + 1..].find('"') {
            return Ok(text[start + 1..start + 1 + end].to_string());
        }
    }
    // Some servers answer without quotes.
    let trimmed = text.trim();
    if trimmed.starts_with('/') {
        return Ok(trimmed
            .split_whitespace()
            .next()
            .unwrap_or(trimmed)
            .to_string());
    }
    Err(FtpError::protocol_error(format!("Cannot parse PWD: {}", text)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pwd_parsing() {
        assert_eq!(parse_pwd("\"/pub/files\" is current directory").unwrap(), "/pub/files");
        assert_eq!(parse_pwd("/home/bob").unwrap(), "/home/bob");
        assert!(parse_pwd("current directory unknown").is_err());
    }

    #[test]
    fn verb_matching() {
        assert!(is_verb("quit", "QUIT"));
        assert!(is_verb("RETR file.bin", "RETR"));
        assert!(!is_verb("QUITE", "QUIT"));
        assert!(!is_verb("", "QUIT"));
    }

    #[tokio::test]
    async fn quit_while_disconnected_is_synthetic() {
        let mut config = FtpConnectionConfig::default();
        config.host = "127.0.0.1".into();
        let mut control = ControlChannel::with_defaults(config).unwrap();
        let reply = control.execute("QUIT").await.unwrap();
        assert_eq!(reply.code.as_deref(), Some("200"));
        assert_eq!(reply.message, "Connection already closed.");
        assert!(!control.is_connected());
    }

    #[test]
    fn critical_sequence_tracking() {
        let mut config = FtpConnectionConfig::default();
        config.host = "127.0.0.1".into();
        let mut control = ControlChannel::with_defaults(config).unwrap();

        control.after_execute("EPSV", &FtpReply::new("229", "(|||5000|)"));
        assert!(control.state().in_critical_sequence);
        control.after_execute("RETR a.bin", &FtpReply::new("150", "Opening"));
        assert!(!control.state().in_critical_sequence);

        control.after_execute("TYPE A", &FtpReply::new("200", "ok"));
        assert_eq!(control.state().current_data_type, Some(TransferType::Ascii));

        control.state_mut().last_working_dir = Some("/a".into());
        control.after_execute("CWD /b", &FtpReply::new("550", "no"));
        assert_eq!(control.state().last_working_dir.as_deref(), Some("/a"));
        control.after_execute("CWD /b", &FtpReply::new("250", "ok"));
        assert_eq!(control.state().last_working_dir, None);
    }
}

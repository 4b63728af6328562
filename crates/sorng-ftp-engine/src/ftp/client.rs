//! FTP client façade: one control channel plus the injected collaborators.
//!
//! Lifecycle: build with [`FtpClient::new`], optionally swap the TLS
//! provider, quirks, verifier or cancellation token, then `connect()`.
//! `directory.rs` and `file_ops.rs` add the higher-level operations.
//! For concurrent work, [`FtpClient::clone_connection`] opens another
//! session with the same configuration.

use crate::ftp::capabilities::{NoQuirks, ServerQuirks};
use crate::ftp::control::ControlChannel;
use crate::ftp::data_channel::DataChannel;
use crate::ftp::error::FtpResult;
use crate::ftp::tls::{RustlsProvider, TlsProvider};
use crate::ftp::transfer;
use crate::ftp::types::*;
use crate::ftp::verify::{ServerVerifier, VerificationProvider};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// A (possibly not yet connected) FTP session.
pub struct FtpClient {
    pub(crate) control: ControlChannel,
    pub(crate) verifier: Arc<dyn VerificationProvider>,
}

impl FtpClient {
    /// Client with the rustls provider, no quirks and the server verifier.
    pub fn new(config: FtpConnectionConfig) -> FtpResult<Self> {
        config.validate()?;
        let tls: Arc<dyn TlsProvider> = Arc::new(RustlsProvider::new(config.accept_invalid_certs)?);
        Ok(Self {
            control: ControlChannel::new(
                config,
                tls,
                Arc::new(NoQuirks),
                CancellationToken::new(),
            ),
            verifier: Arc::new(ServerVerifier),
        })
    }

    pub fn with_tls_provider(self, tls: Arc<dyn TlsProvider>) -> Self {
        self.rebuild(Some(tls), None)
    }

    pub fn with_quirks(self, quirks: Arc<dyn ServerQuirks>) -> Self {
        self.rebuild(None, Some(quirks))
    }

    pub fn with_verifier(mut self, verifier: Arc<dyn VerificationProvider>) -> Self {
        self.verifier = verifier;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.control.set_cancel_token(cancel);
        self
    }

    fn rebuild(
        self,
        tls: Option<Arc<dyn TlsProvider>>,
        quirks: Option<Arc<dyn ServerQuirks>>,
    ) -> Self {
        let control = ControlChannel::new(
            self.control.config().clone(),
            tls.unwrap_or_else(|| self.control.tls_provider().clone()),
            quirks.unwrap_or_else(|| self.control.quirks().clone()),
            self.control.cancel_token().clone(),
        );
        Self {
            control,
            verifier: self.verifier,
        }
    }

    /// Connect and log in.
    pub async fn connect(&mut self) -> FtpResult<()> {
        self.control.connect().await
    }

    /// Build and connect in one step.
    pub async fn connect_with(config: FtpConnectionConfig) -> FtpResult<Self> {
        let mut client = Self::new(config)?;
        client.connect().await?;
        Ok(client)
    }

    /// Open a second, independent session with the same configuration and
    /// collaborators. The cancellation token is shared.
    pub async fn clone_connection(&self) -> FtpResult<Self> {
        let mut control = ControlChannel::new(
            self.control.config().clone(),
            self.control.tls_provider().clone(),
            self.control.quirks().clone(),
            self.control.cancel_token().clone(),
        );
        control.state_mut().epsv_not_supported = self.control.state().epsv_not_supported;
        control.connect().await?;
        log::debug!(
            "Cloned session {} into {}",
            self.control.session_id(),
            control.session_id()
        );
        Ok(Self {
            control,
            verifier: self.verifier.clone(),
        })
    }

    // ─── Pass-throughs ───────────────────────────────────────────

    pub async fn execute(&mut self, command: &str) -> FtpResult<FtpReply> {
        self.control.execute(command).await
    }

    /// Open a data channel for `command` in the configured mode.
    pub async fn open_data_channel(&mut self, command: &str, restart: u64) -> FtpResult<DataChannel> {
        let mode = self.control.config().data_channel_mode;
        transfer::open_data_channel(&mut self.control, mode, command, restart).await
    }

    /// Close a data channel and read the transfer's final reply.
    pub async fn close_data_channel(&mut self, channel: DataChannel) -> FtpResult<Option<FtpReply>> {
        channel.close(&mut self.control, false).await
    }

    pub async fn noop(&mut self) -> FtpResult<()> {
        self.control.noop().await.map(|_| ())
    }

    pub async fn pwd(&mut self) -> FtpResult<String> {
        self.control.get_working_directory().await
    }

    pub async fn cwd(&mut self, path: &str) -> FtpResult<()> {
        self.control.set_working_directory(path).await
    }

    pub async fn quit(&mut self) -> FtpResult<()> {
        self.control.quit().await
    }

    // ─── Accessors ───────────────────────────────────────────────

    pub fn id(&self) -> &str {
        self.control.session_id()
    }

    pub fn control(&mut self) -> &mut ControlChannel {
        &mut self.control
    }

    pub fn config(&self) -> &FtpConnectionConfig {
        self.control.config()
    }

    pub fn is_connected(&self) -> bool {
        self.control.is_connected()
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        self.control.cancel_token()
    }

    pub fn session_info(&self) -> FtpSessionInfo {
        self.control.session_info()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> FtpConnectionConfig {
        FtpConnectionConfig {
            host: "127.0.0.1".into(),
            ..Default::default()
        }
    }

    #[test]
    fn new_rejects_invalid_config() {
        assert!(FtpClient::new(FtpConnectionConfig::default()).is_err());
        let client = FtpClient::new(config()).unwrap();
        assert!(!client.is_connected());
        assert_eq!(client.session_info().host, "127.0.0.1");
    }

    #[test]
    fn builder_keeps_cancellation() {
        let cancel = CancellationToken::new();
        let client = FtpClient::new(config())
            .unwrap()
            .with_cancellation(cancel.clone())
            .with_quirks(Arc::new(NoQuirks));
        cancel.cancel();
        assert!(client.cancel_token().is_cancelled());
    }
}

//! The data connection of a single transfer command.
//!
//! A `DataChannel` is created by the negotiator after the transfer command
//! was accepted and is consumed by [`DataChannel::close`], which reads the
//! command's final reply when the command only answered with a 1xx. If a
//! channel is dropped instead, the control channel still knows a reply is
//! owed and reads it before its next command.

use crate::ftp::control::ControlChannel;
use crate::ftp::error::{FtpError, FtpResult};
use crate::ftp::protocol::guarded;
use crate::ftp::types::FtpReply;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_util::sync::CancellationToken;

/// Abstraction over a plain or TLS-wrapped data stream.
pub enum DataStream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl DataStream {
    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            DataStream::Plain(s) => s.read(buf).await,
            DataStream::Tls(s) => s.read(buf).await,
        }
    }

    async fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        match self {
            DataStream::Plain(s) => s.write_all(buf).await,
            DataStream::Tls(s) => s.write_all(buf).await,
        }
    }

    async fn shutdown(&mut self) -> io::Result<()> {
        match self {
            DataStream::Plain(s) => {
                s.flush().await?;
                s.shutdown().await
            }
            DataStream::Tls(s) => {
                s.flush().await?;
                s.shutdown().await
            }
        }
    }
}

pub struct DataChannel {
    stream: Option<DataStream>,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    /// Reply to the transfer command.
    command_status: FtpReply,
    length: Option<u64>,
    position: u64,
    io_timeout: Duration,
    cancel: CancellationToken,
}

impl DataChannel {
    pub(crate) fn new(
        stream: DataStream,
        local_addr: SocketAddr,
        peer_addr: SocketAddr,
        command_status: FtpReply,
        position: u64,
        io_timeout: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            stream: Some(stream),
            local_addr,
            peer_addr,
            command_status,
            length: None,
            position,
            io_timeout,
            cancel,
        }
    }

    pub fn command_status(&self) -> &FtpReply {
        &self.command_status
    }

    pub fn is_encrypted(&self) -> bool {
        matches!(self.stream, Some(DataStream::Tls(_)))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn length(&self) -> Option<u64> {
        self.length
    }

    pub fn set_length(&mut self, length: Option<u64>) {
        self.length = length;
    }

    /// Offset in the remote file of the next byte on the wire.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Read up to `buf.len()` bytes; 0 means the server closed the stream.
    pub async fn read(&mut self, buf: &mut [u8]) -> FtpResult<usize> {
        let encrypted = self.is_encrypted();
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| FtpError::transfer_failed("Data channel already closed"))?;
        let res = guarded(&self.cancel, Some(self.io_timeout), "Data channel read", async {
            match stream.read(buf).await {
                Ok(n) => Ok(n),
                // Servers often drop the socket without close_notify.
                Err(e) if encrypted && e.kind() == io::ErrorKind::UnexpectedEof => Ok(0),
                Err(e) => Err(FtpError::data_io("Data channel read", &e)),
            }
        })
        .await?;
        self.position += res as u64;
        Ok(res)
    }

    pub async fn write_all(&mut self, buf: &[u8]) -> FtpResult<()> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| FtpError::transfer_failed("Data channel already closed"))?;
        guarded(&self.cancel, Some(self.io_timeout), "Data channel write", async {
            stream
                .write_all(buf)
                .await
                .map_err(|e| FtpError::data_io("Data channel write", &e))
        })
        .await?;
        self.position += buf.len() as u64;
        Ok(())
    }

    /// Flush and half-close so the server sees the end of an upload.
    pub async fn finish_writing(&mut self) -> FtpResult<()> {
        let Some(stream) = self.stream.as_mut() else {
            return Ok(());
        };
        guarded(&self.cancel, Some(self.io_timeout), "Data channel shutdown", async {
            stream
                .shutdown()
                .await
                .map_err(|e| FtpError::data_io("Data channel shutdown", &e))
        })
        .await
    }

    /// Close the socket and, if the transfer command is still pending, read
    /// its final reply (draining keep-alive echoes when `drain` is set).
    pub async fn close(
        mut self,
        control: &mut ControlChannel,
        drain: bool,
    ) -> FtpResult<Option<FtpReply>> {
        if let Some(mut stream) = self.stream.take() {
            // Errors here only mean the peer already closed.
            let _ = tokio::time::timeout(Duration::from_secs(1), stream.shutdown()).await;
        }
        if !control.state().pending_data_reply || !control.is_connected() {
            return Ok(None);
        }
        control.state_mut().pending_data_reply = false;
        if !self.command_status.is_preliminary() {
            return Ok(None);
        }
        control.read_reply(drain).await.map(Some)
    }
}

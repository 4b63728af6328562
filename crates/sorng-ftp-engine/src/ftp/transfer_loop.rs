//! Chunked transfer pump between a local source/sink and a data channel.
//!
//! Each run owns its positions, throttle and resume budget. When the data
//! socket drops mid-transfer the pending reply is read first: a 2xx means
//! the server considers the file complete. Otherwise a reset/aborted/EOF
//! socket is reopened with `REST <position>` while the budget lasts.

use crate::ftp::control::ControlChannel;
use crate::ftp::data_channel::DataChannel;
use crate::ftp::error::{FtpError, FtpResult};
use crate::ftp::throttle::{chunk_size_for, Throttle};
use crate::ftp::transfer::{open_data_channel_at, Restart};
use crate::ftp::types::*;
use async_trait::async_trait;
use std::io::{self, SeekFrom};
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::time::Instant;

// ─── Sources ─────────────────────────────────────────────────────────

/// Local data fed into an upload.
#[async_trait]
pub trait UploadSource: AsyncRead + Unpin + Send {
    /// Reposition to `pos`; `None` when the source cannot seek.
    async fn seek_to(&mut self, pos: u64) -> Option<io::Result<()>>;
}

#[async_trait]
impl UploadSource for tokio::fs::File {
    async fn seek_to(&mut self, pos: u64) -> Option<io::Result<()>> {
        Some(self.seek(SeekFrom::Start(pos)).await.map(|_| ()))
    }
}

#[async_trait]
impl<T> UploadSource for std::io::Cursor<T>
where
    T: AsRef<[u8]> + Unpin + Send + Sync,
{
    async fn seek_to(&mut self, pos: u64) -> Option<io::Result<()>> {
        self.set_position(pos);
        Some(Ok(()))
    }
}

/// Wraps a forward-only reader. Uploads from it cannot resume.
pub struct Unseekable<R>(pub R);

impl<R: AsyncRead + Unpin> AsyncRead for Unseekable<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.0).poll_read(cx, buf)
    }
}

#[async_trait]
impl<R: AsyncRead + Unpin + Send> UploadSource for Unseekable<R> {
    async fn seek_to(&mut self, _pos: u64) -> Option<io::Result<()>> {
        None
    }
}

// ─── Job description ─────────────────────────────────────────────────

/// One RETR/STOR/APPE run.
#[derive(Clone)]
pub struct TransferJob {
    pub direction: TransferDirection,
    pub remote_path: String,
    /// Shown in progress reports.
    pub local_label: String,
    /// Full transfer command, e.g. `RETR /pub/file.bin`.
    pub command: String,
    pub mode: DataChannelMode,
    pub data_type: TransferType,
    /// Remote size for downloads, source size for uploads.
    pub declared_length: Option<u64>,
    /// `REST` offset; for uploads also where the source is read from.
    pub restart_offset: u64,
    /// Stop early once this offset is reached.
    pub stop_offset: Option<u64>,
    /// Bytes/sec, 0 = unlimited.
    pub rate_limit: u64,
    pub progress: Option<ProgressCallback>,
}

impl TransferJob {
    pub fn download(remote_path: &str, local_label: &str, config: &FtpConnectionConfig) -> Self {
        Self {
            direction: TransferDirection::Download,
            remote_path: remote_path.to_string(),
            local_label: local_label.to_string(),
            command: format!("RETR {}", remote_path),
            mode: config.data_channel_mode,
            data_type: config.transfer_type,
            declared_length: None,
            restart_offset: 0,
            stop_offset: None,
            rate_limit: config.download_rate_limit,
            progress: None,
        }
    }

    pub fn upload(remote_path: &str, local_label: &str, config: &FtpConnectionConfig) -> Self {
        Self {
            direction: TransferDirection::Upload,
            remote_path: remote_path.to_string(),
            local_label: local_label.to_string(),
            command: format!("STOR {}", remote_path),
            mode: config.data_channel_mode,
            data_type: config.transfer_type,
            declared_length: None,
            restart_offset: 0,
            stop_offset: None,
            rate_limit: config.upload_rate_limit,
            progress: None,
        }
    }

    fn is_append(&self) -> bool {
        self.command
            .get(..4)
            .map(|v| v.eq_ignore_ascii_case("APPE"))
            .unwrap_or(false)
    }
}

// ─── Loop state ──────────────────────────────────────────────────────

struct Pump<'a> {
    job: &'a TransferJob,
    throttle: Throttle,
    chunk_size: usize,
    started: Instant,
    last_keepalive: Instant,
    keepalive_every: Option<Duration>,
    sent_keepalive: bool,
    resumes: u32,
    max_resumes: u32,
    first_position: u64,
}

impl<'a> Pump<'a> {
    fn new(control: &ControlChannel, job: &'a TransferJob) -> Self {
        let config = control.config();
        let now = Instant::now();
        Self {
            job,
            throttle: Throttle::new(job.rate_limit, control.cancel_token().clone()),
            chunk_size: chunk_size_for(config.transfer_chunk_size, job.rate_limit),
            started: now,
            last_keepalive: now,
            keepalive_every: (config.noop_interval_ms > 0)
                .then(|| Duration::from_millis(config.noop_interval_ms)),
            sent_keepalive: false,
            resumes: 0,
            max_resumes: config.max_transfer_resumes,
            first_position: job.restart_offset,
        }
    }

    /// Bookkeeping after each chunk: progress, keep-alive, throttle.
    async fn tick(
        &mut self,
        control: &mut ControlChannel,
        position: u64,
        n: usize,
    ) -> FtpResult<()> {
        self.report(position, n as u64, TransferState::InProgress);

        if let Some(every) = self.keepalive_every {
            if self.last_keepalive.elapsed() >= every {
                self.last_keepalive = Instant::now();
                match control.send_keepalive().await {
                    Ok(()) => self.sent_keepalive = true,
                    Err(e) if e.is_cancelled() => return Err(e),
                    Err(e) => log::debug!("Keep-alive NOOP failed: {}", e),
                }
            }
        }

        self.throttle.consume(n).await
    }

    fn report(&self, position: u64, this_tick: u64, state: TransferState) {
        let Some(cb) = &self.job.progress else {
            return;
        };
        let elapsed = self.started.elapsed();
        let moved = position.saturating_sub(self.first_position);
        let secs = elapsed.as_secs_f64().max(0.001);
        let speed = (moved as f64 / secs) as u64;
        let total = self.job.declared_length;
        let eta = match total {
            Some(t) if speed > 0 => Some((t.saturating_sub(position) / speed) as u32),
            _ => None,
        };
        let percent = match total {
            Some(0) => 100.0,
            Some(t) => (position as f64 / t as f64 * 100.0) as f32,
            None => 0.0,
        };
        cb(&TransferProgress {
            direction: self.job.direction,
            local_path: self.job.local_label.clone(),
            remote_path: self.job.remote_path.clone(),
            total_bytes: total,
            transferred_bytes: position,
            bytes_this_tick: this_tick,
            elapsed_ms: elapsed.as_millis() as u64,
            speed_bps: speed,
            eta_seconds: eta,
            percent,
            state,
        });
    }

    /// Read the owed reply; if the server did not complete the transfer,
    /// decide whether `error` allows reopening at `position`.
    async fn recover(
        &mut self,
        control: &mut ControlChannel,
        channel: DataChannel,
        error: FtpError,
        position: u64,
    ) -> FtpResult<Option<u64>> {
        drop(channel);
        if error.is_cancelled() {
            control.teardown();
            return Err(error);
        }

        if control.state().pending_data_reply && control.is_connected() {
            control.state_mut().pending_data_reply = false;
            match control.read_reply(self.sent_keepalive).await {
                Ok(reply) if reply.is_completion() => {
                    log::warn!(
                        "Data channel failed ({}) but server reported completion: {}",
                        error,
                        reply.status_line()
                    );
                    return Ok(None);
                }
                Ok(reply) => log::debug!("Transfer reply after failure: {}", reply.status_line()),
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => log::debug!("No transfer reply after failure: {}", e),
            }
        }

        if !error.is_resumable() || self.resumes >= self.max_resumes {
            return Err(error);
        }
        self.resumes += 1;
        log::warn!(
            "Resuming {} at offset {} (attempt {}/{}): {}",
            self.job.remote_path,
            position,
            self.resumes,
            self.max_resumes,
            error
        );
        self.report(position, 0, TransferState::Resuming);
        Ok(Some(position))
    }

    /// Open the data channel at exactly `position`; a restart the server
    /// cannot honour fails before the transfer command goes out.
    async fn reopen(&self, control: &mut ControlChannel, position: u64) -> FtpResult<DataChannel> {
        let mut channel = open_data_channel_at(
            control,
            self.job.mode,
            &self.job.command,
            Restart::new(position, true),
        )
        .await?;
        channel.set_length(self.job.declared_length);
        Ok(channel)
    }

    /// Close the channel and judge the final reply.
    async fn finish(
        &self,
        control: &mut ControlChannel,
        channel: DataChannel,
        truncated: bool,
        position: u64,
    ) -> FtpResult<u64> {
        match channel.close(control, self.sent_keepalive).await {
            Ok(Some(reply)) if reply.code.is_none() => {
                log::warn!(
                    "No final reply for {}; dropping control connection",
                    self.job.remote_path
                );
                control.teardown();
            }
            Ok(Some(reply)) if reply.is_negative() => {
                if truncated {
                    log::debug!("Ignoring {} after stopping early", reply.status_line());
                } else {
                    return Err(FtpError::from_reply(&reply));
                }
            }
            Ok(Some(reply)) => log::debug!("Transfer finished: {}", reply.status_line()),
            Ok(None) => {}
            Err(e) if e.is_cancelled() => return Err(e),
            Err(e) => {
                // The data is complete; the next command reconnects.
                log::warn!("Final reply for {} not read: {}", self.job.remote_path, e);
                control.teardown();
            }
        }
        self.report(position, 0, TransferState::Completed);
        Ok(position)
    }
}

// ─── Download ────────────────────────────────────────────────────────

/// Pump `job` into `sink`, which must already be positioned at
/// `job.restart_offset`. Returns the final remote offset.
pub async fn download<W>(
    control: &mut ControlChannel,
    sink: &mut W,
    job: &TransferJob,
) -> FtpResult<u64>
where
    W: AsyncWrite + Unpin + Send + ?Sized,
{
    let mut pump = Pump::new(control, job);
    let read_to_end = job.data_type == TransferType::Ascii
        || job.declared_length.is_none()
        || control.quirks().always_read_to_end(&job.remote_path);

    let mut channel = pump.reopen(control, job.restart_offset).await?;
    let mut position = job.restart_offset;
    let mut buf = vec![0u8; pump.chunk_size];
    let mut truncated = false;

    loop {
        let want = match job.stop_offset {
            Some(stop) if position >= stop => {
                truncated = true;
                break;
            }
            Some(stop) => ((stop - position) as usize).min(buf.len()),
            None => buf.len(),
        };

        let failure = match channel.read(&mut buf[..want]).await {
            Ok(0) => {
                if read_to_end || job.declared_length.map_or(true, |len| position >= len) {
                    break;
                }
                FtpError::transfer_failed(format!(
                    "Data connection closed at {} of {:?} bytes",
                    position, job.declared_length
                ))
                .with_io_kind(io::ErrorKind::UnexpectedEof)
            }
            Ok(n) => {
                if let Err(e) = sink.write_all(&buf[..n]).await {
                    return Err(FtpError::io_error(format!("Local write failed: {}", e))
                        .with_io_kind(e.kind()));
                }
                position += n as u64;
                pump.tick(control, position, n).await.map_err(|e| {
                    if e.is_cancelled() {
                        control.teardown();
                    }
                    e
                })?;
                if !read_to_end && job.declared_length == Some(position) {
                    break;
                }
                continue;
            }
            Err(e) if e.is_timeout() && job.declared_length.map_or(false, |len| position >= len) => {
                log::debug!("Read timeout after the full length; treating as end of stream");
                break;
            }
            Err(e) => e,
        };

        match pump.recover(control, channel, failure, position).await? {
            None => {
                sink.flush().await?;
                pump.report(position, 0, TransferState::Completed);
                return Ok(position);
            }
            Some(at) => channel = pump.reopen(control, at).await?,
        }
    }

    sink.flush().await?;
    pump.finish(control, channel, truncated, position).await
}

// ─── Upload ──────────────────────────────────────────────────────────

/// Pump `source` into `job`. The source is moved to `job.restart_offset`
/// first. Returns the final remote offset.
pub async fn upload<R>(
    control: &mut ControlChannel,
    source: &mut R,
    job: &TransferJob,
) -> FtpResult<u64>
where
    R: UploadSource + ?Sized,
{
    let mut pump = Pump::new(control, job);

    if job.restart_offset > 0 {
        match source.seek_to(job.restart_offset).await {
            Some(res) => res?,
            None => {
                return Err(FtpError::transfer_failed(
                    "Cannot restart an upload from a source that does not seek",
                ))
            }
        }
    }

    let mut channel = pump.reopen(control, job.restart_offset).await?;
    let mut position = job.restart_offset;
    let mut buf = vec![0u8; pump.chunk_size];
    let mut truncated = false;

    loop {
        let want = match job.stop_offset {
            Some(stop) if position >= stop => {
                truncated = true;
                break;
            }
            Some(stop) => ((stop - position) as usize).min(buf.len()),
            None => buf.len(),
        };

        let n = source.read(&mut buf[..want]).await?;
        if n == 0 {
            break;
        }

        let failure = match channel.write_all(&buf[..n]).await {
            Ok(()) => {
                position += n as u64;
                pump.tick(control, position, n).await.map_err(|e| {
                    if e.is_cancelled() {
                        control.teardown();
                    }
                    e
                })?;
                continue;
            }
            Err(e)
                if e.is_timeout()
                    && job
                        .declared_length
                        .map_or(false, |len| position + n as u64 >= len) =>
            {
                log::debug!("Write timeout on the last chunk; letting the server decide");
                position += n as u64;
                break;
            }
            Err(e) => e,
        };

        let resumable = failure.is_resumable() && !job.is_append();
        let Some(sent) = pump.recover(control, channel, failure, position).await? else {
            pump.report(position, 0, TransferState::Completed);
            return Ok(position);
        };
        if !resumable {
            return Err(FtpError::transfer_failed(format!(
                "Upload of {} interrupted at {} and cannot be resumed",
                job.remote_path, sent
            )));
        }

        // Bytes in flight may be lost; trust the server's size.
        let confirmed = match control.file_size(&job.remote_path).await? {
            Some(size) => size.min(sent),
            None => {
                return Err(FtpError::transfer_failed(format!(
                    "Cannot confirm remote size of {} to resume",
                    job.remote_path
                )))
            }
        };
        match source.seek_to(confirmed).await {
            Some(res) => res?,
            None => {
                return Err(FtpError::transfer_failed(
                    "Cannot resume an upload from a source that does not seek",
                ))
            }
        }
        position = confirmed;
        channel = pump.reopen(control, confirmed).await?;
    }

    if let Err(e) = channel.finish_writing().await {
        if e.is_cancelled() {
            control.teardown();
            return Err(e);
        }
        log::debug!("Shutting down upload stream: {}", e);
    }
    pump.finish(control, channel, truncated, position).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_defaults_follow_config() {
        let mut config = FtpConnectionConfig::default();
        config.download_rate_limit = 1024;
        config.upload_rate_limit = 2048;

        let down = TransferJob::download("/a.bin", "/tmp/a.bin", &config);
        assert_eq!(down.command, "RETR /a.bin");
        assert_eq!(down.rate_limit, 1024);
        assert!(!down.is_append());

        let mut up = TransferJob::upload("/b.bin", "/tmp/b.bin", &config);
        assert_eq!(up.command, "STOR /b.bin");
        assert_eq!(up.rate_limit, 2048);
        up.command = "APPE /b.bin".into();
        assert!(up.is_append());
    }

    #[tokio::test]
    async fn cursor_and_unseekable_sources() {
        let mut cursor = std::io::Cursor::new(b"abcdef".to_vec());
        cursor.seek_to(3).await.unwrap().unwrap();
        let mut rest = String::new();
        cursor.read_to_string(&mut rest).await.unwrap();
        assert_eq!(rest, "def");

        let mut stream = Unseekable(&b"xyz"[..]);
        assert!(stream.seek_to(1).await.is_none());
        let mut all = Vec::new();
        stream.read_to_end(&mut all).await.unwrap();
        assert_eq!(all, b"xyz");
    }
}

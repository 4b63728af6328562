//! File-level operations: download, upload, with existence policies,
//! verification and retry.
//!
//! Every entry point ends in [`FtpStatus`]: transfer errors are logged and
//! reported as `Failed`, cancellation is always returned as an error, and a
//! persistent verification failure can delete the destination and/or raise
//! `VerificationFailed` depending on the verify flags.

use crate::ftp::client::FtpClient;
use crate::ftp::directory::remote_parent;
use crate::ftp::error::{FtpError, FtpErrorKind, FtpResult};
use crate::ftp::transfer_loop::{self, TransferJob, UploadSource};
use crate::ftp::types::*;
use crate::ftp::verify::{verify_transfer, LocalSide};
use std::io::Cursor;
use std::path::Path;
use tokio::fs;
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// Where upload data comes from.
#[derive(Clone, Copy)]
enum UploadFrom<'a> {
    File(&'a Path),
    Bytes(&'a [u8]),
}

impl<'a> UploadFrom<'a> {
    fn local_side(self) -> LocalSide<'a> {
        match self {
            UploadFrom::File(path) => LocalSide::File(path),
            UploadFrom::Bytes(bytes) => LocalSide::Bytes(bytes),
        }
    }

    fn label(self) -> String {
        match self {
            UploadFrom::File(path) => path.display().to_string(),
            UploadFrom::Bytes(bytes) => format!("<{} bytes>", bytes.len()),
        }
    }

    async fn open(self) -> FtpResult<(Box<dyn UploadSource + 'a>, u64)> {
        Ok(match self {
            UploadFrom::File(path) => {
                let file = fs::File::open(path).await?;
                let len = file.metadata().await?.len();
                (Box::new(file), len)
            }
            UploadFrom::Bytes(bytes) => (Box::new(Cursor::new(bytes)), bytes.len() as u64),
        })
    }
}

impl FtpClient {
    fn attempts_for(&self, verify: FtpVerify) -> u32 {
        if verify.contains(FtpVerify::RETRY) {
            self.control.config().retry_attempts.max(1)
        } else {
            1
        }
    }

    // ─── DOWNLOAD (RETR) ─────────────────────────────────────────

    /// Download a remote file to a local path.
    pub async fn download_file(
        &mut self,
        local_path: &str,
        remote_path: &str,
        existing: FtpLocalExists,
        verify: FtpVerify,
        progress: Option<ProgressCallback>,
    ) -> FtpResult<FtpStatus> {
        let local = Path::new(local_path);
        let attempts = self.attempts_for(verify);
        let methods = verify.methods_or(self.control.config().verify_method);
        let mut existing = existing;
        let mut attempt = 0;

        loop {
            attempt += 1;
            let outcome = self
                .download_once(local, remote_path, existing, verify, progress.clone())
                .await;

            match outcome {
                Ok(FtpStatus::Success) if verify.wants_verification() => {
                    let ok = verify_transfer(
                        self.verifier.as_ref(),
                        &mut self.control,
                        methods,
                        remote_path,
                        LocalSide::File(local),
                    )
                    .await?;
                    if ok {
                        log::info!("Downloaded and verified {} -> {}", remote_path, local_path);
                        return Ok(FtpStatus::Success);
                    }
                    if attempt < attempts {
                        log::warn!(
                            "Verification of {} failed, retrying ({}/{})",
                            remote_path,
                            attempt + 1,
                            attempts
                        );
                        existing = FtpLocalExists::Overwrite;
                        continue;
                    }
                    if verify.contains(FtpVerify::DELETE) {
                        if let Err(e) = fs::remove_file(local).await {
                            log::warn!("Could not delete {}: {}", local_path, e);
                        }
                    }
                    return verification_exhausted(verify, remote_path);
                }
                Ok(status) => {
                    log::info!("Download {} -> {}: {:?}", remote_path, local_path, status);
                    return Ok(status);
                }
                Err(e) => match retry_or_fail(e, attempt, attempts, remote_path)? {
                    true => {
                        if existing == FtpLocalExists::Skip {
                            existing = FtpLocalExists::Overwrite;
                        }
                    }
                    false => return Ok(FtpStatus::Failed),
                },
            }
        }
    }

    async fn download_once(
        &mut self,
        local: &Path,
        remote_path: &str,
        existing: FtpLocalExists,
        verify: FtpVerify,
        progress: Option<ProgressCallback>,
    ) -> FtpResult<FtpStatus> {
        let local_len = match fs::metadata(local).await {
            Ok(meta) if meta.is_file() => Some(meta.len()),
            _ => None,
        };
        if existing == FtpLocalExists::Skip && local_len.is_some() {
            log::debug!("{} exists, skipping download", local.display());
            return Ok(FtpStatus::Skipped);
        }

        let remote_len = self.control.file_size(remote_path).await?;
        let offset = match (existing, local_len, remote_len) {
            (FtpLocalExists::Resume, Some(have), Some(want)) if have == want => {
                log::debug!("{} already complete ({} bytes)", local.display(), have);
                return Ok(FtpStatus::Skipped);
            }
            // Local copy is longer than the remote file: start over.
            (FtpLocalExists::Resume, Some(have), Some(want)) if have > want => 0,
            (FtpLocalExists::Resume, Some(have), _) => have,
            _ => 0,
        };

        if let Some(parent) = local.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await?;
        }
        let mut file = if offset > 0 {
            fs::OpenOptions::new().append(true).open(local).await?
        } else {
            fs::File::create(local).await?
        };

        let data_type = self.control.config().transfer_type;
        self.control.set_data_type(data_type).await?;

        let mut job = TransferJob::download(
            remote_path,
            &local.display().to_string(),
            self.control.config(),
        );
        job.declared_length = remote_len;
        job.restart_offset = offset;
        job.progress = progress;

        transfer_loop::download(&mut self.control, &mut file, &job).await?;
        file.flush().await?;

        if verify.methods_or(self.control.config().verify_method).contains(FtpVerify::DATE) {
            if let Some(time) = self.control.modified_time(remote_path).await? {
                let std_file = file.into_std().await;
                let stamp: std::time::SystemTime = time.into();
                let res = tokio::task::spawn_blocking(move || std_file.set_modified(stamp)).await;
                if !matches!(res, Ok(Ok(()))) {
                    log::debug!("Could not set modification time of {}", local.display());
                }
            }
        }
        Ok(FtpStatus::Success)
    }

    /// Download into any writer. Errors are returned, not mapped to a status.
    pub async fn download_stream<W>(
        &mut self,
        sink: &mut W,
        remote_path: &str,
        restart: u64,
        progress: Option<ProgressCallback>,
    ) -> FtpResult<u64>
    where
        W: AsyncWrite + Unpin + Send + ?Sized,
    {
        let data_type = self.control.config().transfer_type;
        self.control.set_data_type(data_type).await?;
        let mut job = TransferJob::download(remote_path, "<stream>", self.control.config());
        job.declared_length = self.control.file_size(remote_path).await?;
        job.restart_offset = restart;
        job.progress = progress;
        let end = transfer_loop::download(&mut self.control, sink, &job).await?;
        sink.flush().await?;
        Ok(end - restart)
    }

    /// Download a whole remote file into memory.
    pub async fn download_bytes(&mut self, remote_path: &str) -> FtpResult<Vec<u8>> {
        let mut buf = Vec::new();
        self.download_stream(&mut buf, remote_path, 0, None).await?;
        Ok(buf)
    }

    // ─── UPLOAD (STOR / APPE) ────────────────────────────────────

    /// Upload a local file to a remote path.
    pub async fn upload_file(
        &mut self,
        local_path: &str,
        remote_path: &str,
        existing: FtpRemoteExists,
        create_remote_dir: bool,
        verify: FtpVerify,
        progress: Option<ProgressCallback>,
    ) -> FtpResult<FtpStatus> {
        let local = Path::new(local_path);
        match fs::metadata(local).await {
            Ok(meta) if meta.is_file() => {}
            _ => {
                log::error!("Local file {} does not exist", local_path);
                return Ok(FtpStatus::Failed);
            }
        }
        self.upload_with_retry(
            UploadFrom::File(local),
            remote_path,
            existing,
            create_remote_dir,
            verify,
            progress,
        )
        .await
    }

    /// Upload an in-memory buffer.
    pub async fn upload_bytes(
        &mut self,
        data: &[u8],
        remote_path: &str,
        existing: FtpRemoteExists,
        create_remote_dir: bool,
        verify: FtpVerify,
    ) -> FtpResult<FtpStatus> {
        self.upload_with_retry(
            UploadFrom::Bytes(data),
            remote_path,
            existing,
            create_remote_dir,
            verify,
            None,
        )
        .await
    }

    /// Upload from any source with `STOR`, once, without verification.
    /// Errors are returned, not mapped to a status.
    pub async fn upload_stream<R>(
        &mut self,
        source: &mut R,
        remote_path: &str,
        progress: Option<ProgressCallback>,
    ) -> FtpResult<u64>
    where
        R: UploadSource + ?Sized,
    {
        let data_type = self.control.config().transfer_type;
        self.control.set_data_type(data_type).await?;
        let mut job = TransferJob::upload(remote_path, "<stream>", self.control.config());
        job.progress = progress;
        transfer_loop::upload(&mut self.control, source, &job).await
    }

    async fn upload_with_retry(
        &mut self,
        from: UploadFrom<'_>,
        remote_path: &str,
        existing: FtpRemoteExists,
        create_remote_dir: bool,
        verify: FtpVerify,
        progress: Option<ProgressCallback>,
    ) -> FtpResult<FtpStatus> {
        let attempts = self.attempts_for(verify);
        let methods = verify.methods_or(self.control.config().verify_method);
        let mut existing = existing;
        let mut attempt = 0;

        loop {
            attempt += 1;
            let outcome = self
                .upload_once(from, remote_path, existing, create_remote_dir, progress.clone())
                .await;

            match outcome {
                Ok(FtpStatus::Success) if verify.wants_verification() => {
                    let ok = verify_transfer(
                        self.verifier.as_ref(),
                        &mut self.control,
                        methods,
                        remote_path,
                        from.local_side(),
                    )
                    .await?;
                    if ok {
                        log::info!("Uploaded and verified {} -> {}", from.label(), remote_path);
                        return Ok(FtpStatus::Success);
                    }
                    if attempt < attempts {
                        log::warn!(
                            "Verification of {} failed, retrying ({}/{})",
                            remote_path,
                            attempt + 1,
                            attempts
                        );
                        existing = FtpRemoteExists::Overwrite;
                        continue;
                    }
                    if verify.contains(FtpVerify::DELETE) {
                        if let Err(e) = self.delete_file(remote_path).await {
                            log::warn!("Could not delete {}: {}", remote_path, e);
                        }
                    }
                    return verification_exhausted(verify, remote_path);
                }
                Ok(status) => {
                    log::info!("Upload {} -> {}: {:?}", from.label(), remote_path, status);
                    return Ok(status);
                }
                Err(e) => match retry_or_fail(e, attempt, attempts, remote_path)? {
                    true => {
                        if existing == FtpRemoteExists::Skip {
                            existing = FtpRemoteExists::Overwrite;
                        }
                    }
                    false => return Ok(FtpStatus::Failed),
                },
            }
        }
    }

    async fn upload_once(
        &mut self,
        from: UploadFrom<'_>,
        remote_path: &str,
        existing: FtpRemoteExists,
        create_remote_dir: bool,
        progress: Option<ProgressCallback>,
    ) -> FtpResult<FtpStatus> {
        let (mut source, local_len) = from.open().await?;

        let data_type = self.control.config().transfer_type;
        self.control.set_data_type(data_type).await?;

        let exists = match existing {
            FtpRemoteExists::NoCheck
            | FtpRemoteExists::ResumeNoCheck
            | FtpRemoteExists::AddToEndNoCheck => None,
            _ => Some(self.control.file_exists(remote_path).await?),
        };

        let (verb, start) = match (existing, exists) {
            (FtpRemoteExists::Skip, Some(true)) => {
                log::debug!("{} exists, skipping upload", remote_path);
                return Ok(FtpStatus::Skipped);
            }
            (FtpRemoteExists::Overwrite, Some(true)) => {
                self.delete_file(remote_path).await?;
                ("STOR", 0)
            }
            (FtpRemoteExists::ResumeNoCheck, _) | (FtpRemoteExists::Resume, Some(true)) => {
                match self.control.file_size(remote_path).await? {
                    Some(have) if have == local_len => {
                        log::debug!("{} already complete ({} bytes)", remote_path, have);
                        return Ok(FtpStatus::Skipped);
                    }
                    Some(have) if have < local_len => ("APPE", have),
                    _ => ("STOR", 0),
                }
            }
            (FtpRemoteExists::AddToEndNoCheck, _) | (FtpRemoteExists::AddToEnd, Some(true)) => {
                ("APPE", 0)
            }
            (_, Some(false)) => {
                if create_remote_dir {
                    if let Some(parent) = remote_parent(remote_path) {
                        self.create_directory(parent).await?;
                    }
                }
                ("STOR", 0)
            }
            _ => ("STOR", 0),
        };

        if start > 0 {
            match source.seek_to(start).await {
                Some(res) => res?,
                None => return Err(FtpError::transfer_failed("Upload source cannot seek")),
            }
        }

        let mut job = TransferJob::upload(remote_path, &from.label(), self.control.config());
        job.command = format!("{} {}", verb, remote_path);
        job.declared_length = Some(local_len - start);
        job.progress = progress;

        transfer_loop::upload(&mut self.control, &mut *source, &job).await?;
        Ok(FtpStatus::Success)
    }
}

/// Decide what a failed attempt means: `Ok(true)` retry, `Ok(false)` give
/// up with `Failed`, `Err` for cancellation.
fn retry_or_fail(e: FtpError, attempt: u32, attempts: u32, remote_path: &str) -> FtpResult<bool> {
    if e.is_cancelled() {
        return Err(e);
    }
    if e.kind == FtpErrorKind::ProtocolError || attempt >= attempts {
        log::error!("Transfer of {} failed: {}", remote_path, e);
        return Ok(false);
    }
    log::warn!(
        "Transfer of {} failed, retrying ({}/{}): {}",
        remote_path,
        attempt + 1,
        attempts,
        e
    );
    Ok(true)
}

fn verification_exhausted(verify: FtpVerify, remote_path: &str) -> FtpResult<FtpStatus> {
    if verify.contains(FtpVerify::THROW) {
        return Err(FtpError::verification_failed(format!(
            "Verification of {} failed",
            remote_path
        )));
    }
    log::error!("Verification of {} failed", remote_path);
    Ok(FtpStatus::Failed)
}

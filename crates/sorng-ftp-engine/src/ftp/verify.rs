//! Post-transfer verification.
//!
//! A [`VerificationProvider`] answers three questions about the remote
//! file (checksum, size, modification time) and one about the local side.
//! [`verify_transfer`] combines them according to the [`FtpVerify`] method
//! bits. A checksum the server cannot produce falls back to a size check.

use crate::ftp::control::ControlChannel;
use crate::ftp::error::FtpResult;
use crate::ftp::types::FtpVerify;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::Path;
use tokio::io::AsyncReadExt;

/// Largest clock difference accepted by the DATE check.
const DATE_TOLERANCE_SECS: i64 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FtpHash {
    pub algorithm: String,
    /// Lower-case hex digest.
    pub value: String,
}

/// The local half of a transfer.
#[derive(Debug, Clone, Copy)]
pub enum LocalSide<'a> {
    File(&'a Path),
    Bytes(&'a [u8]),
}

#[async_trait]
pub trait VerificationProvider: Send + Sync {
    async fn remote_checksum(
        &self,
        control: &mut ControlChannel,
        path: &str,
    ) -> FtpResult<Option<FtpHash>>;

    async fn remote_size(&self, control: &mut ControlChannel, path: &str) -> FtpResult<Option<u64>>;

    async fn remote_modified(
        &self,
        control: &mut ControlChannel,
        path: &str,
    ) -> FtpResult<Option<DateTime<Utc>>>;

    /// Whether the local data hashes to `hash`.
    async fn local_matches(&self, hash: &FtpHash, local: LocalSide<'_>) -> FtpResult<bool>;
}

/// Asks the server (HASH/XSHA256, SIZE, MDTM) and hashes locally with SHA-256.
#[derive(Debug, Default, Clone, Copy)]
pub struct ServerVerifier;

#[async_trait]
impl VerificationProvider for ServerVerifier {
    async fn remote_checksum(
        &self,
        control: &mut ControlChannel,
        path: &str,
    ) -> FtpResult<Option<FtpHash>> {
        control.remote_hash(path).await
    }

    async fn remote_size(&self, control: &mut ControlChannel, path: &str) -> FtpResult<Option<u64>> {
        control.file_size(path).await
    }

    async fn remote_modified(
        &self,
        control: &mut ControlChannel,
        path: &str,
    ) -> FtpResult<Option<DateTime<Utc>>> {
        control.modified_time(path).await
    }

    async fn local_matches(&self, hash: &FtpHash, local: LocalSide<'_>) -> FtpResult<bool> {
        if !hash.algorithm.eq_ignore_ascii_case("SHA-256") {
            log::warn!("Unsupported hash algorithm {}", hash.algorithm);
            return Ok(false);
        }
        let digest = match local {
            LocalSide::Bytes(bytes) => sha256_hex(bytes),
            LocalSide::File(path) => sha256_file(path).await?,
        };
        Ok(digest.eq_ignore_ascii_case(&hash.value))
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

pub async fn sha256_file(path: &Path) -> FtpResult<String> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 65_536];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Run the checks selected by `methods`. Local or remote errors count as a
/// failed check; only cancellation is returned as an error.
pub async fn verify_transfer(
    verifier: &dyn VerificationProvider,
    control: &mut ControlChannel,
    methods: FtpVerify,
    remote_path: &str,
    local: LocalSide<'_>,
) -> FtpResult<bool> {
    match run_checks(verifier, control, methods, remote_path, local).await {
        Ok(ok) => Ok(ok),
        Err(e) if e.is_cancelled() => Err(e),
        Err(e) => {
            log::warn!("Verification of {} failed with an error: {}", remote_path, e);
            Ok(false)
        }
    }
}

async fn run_checks(
    verifier: &dyn VerificationProvider,
    control: &mut ControlChannel,
    methods: FtpVerify,
    remote_path: &str,
    local: LocalSide<'_>,
) -> FtpResult<bool> {
    let mut check_size = methods.contains(FtpVerify::SIZE);

    if methods.contains(FtpVerify::CHECKSUM) {
        match verifier.remote_checksum(control, remote_path).await? {
            Some(hash) => {
                if !verifier.local_matches(&hash, local).await? {
                    log::warn!("Checksum mismatch for {}", remote_path);
                    return Ok(false);
                }
            }
            None => {
                log::debug!("No server checksum for {}, comparing sizes", remote_path);
                check_size = true;
            }
        }
    }

    if check_size {
        let local_len = local_len(local).await?;
        match verifier.remote_size(control, remote_path).await? {
            Some(remote_len) if remote_len != local_len => {
                log::warn!(
                    "Size mismatch for {}: remote {} local {}",
                    remote_path,
                    remote_len,
                    local_len
                );
                return Ok(false);
            }
            Some(_) => {}
            None => log::debug!("Remote size of {} unavailable, size check skipped", remote_path),
        }
    }

    if methods.contains(FtpVerify::DATE) {
        if let LocalSide::File(path) = local {
            let local_time: DateTime<Utc> = tokio::fs::metadata(path).await?.modified()?.into();
            match verifier.remote_modified(control, remote_path).await? {
                Some(remote_time)
                    if (remote_time - local_time).num_seconds().abs() > DATE_TOLERANCE_SECS =>
                {
                    log::warn!(
                        "Modification time mismatch for {}: remote {} local {}",
                        remote_path,
                        remote_time,
                        local_time
                    );
                    return Ok(false);
                }
                Some(_) => {}
                None => log::debug!("MDTM of {} unavailable, date check skipped", remote_path),
            }
        }
    }

    Ok(true)
}

async fn local_len(local: LocalSide<'_>) -> FtpResult<u64> {
    Ok(match local {
        LocalSide::Bytes(bytes) => bytes.len() as u64,
        LocalSide::File(path) => tokio::fs::metadata(path).await?.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256_of_known_input() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[tokio::test]
    async fn local_hash_matches_file_and_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.bin");
        tokio::fs::write(&path, b"abc").await.unwrap();

        let hash = FtpHash {
            algorithm: "SHA-256".into(),
            value: sha256_hex(b"abc"),
        };
        let verifier = ServerVerifier;
        assert!(verifier.local_matches(&hash, LocalSide::File(&path)).await.unwrap());
        assert!(verifier.local_matches(&hash, LocalSide::Bytes(b"abc")).await.unwrap());
        assert!(!verifier.local_matches(&hash, LocalSide::Bytes(b"abd")).await.unwrap());

        let md5 = FtpHash {
            algorithm: "MD5".into(),
            value: "900150983cd24fb0d6963f7d28e17f72".into(),
        };
        assert!(!verifier.local_matches(&md5, LocalSide::Bytes(b"abc")).await.unwrap());
    }
}

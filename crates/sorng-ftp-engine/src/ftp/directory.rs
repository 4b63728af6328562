//! Structural operations: mkdir, rmdir, rename, delete.
//!
//! Negative replies surface as errors directly (`from_reply`).

use crate::ftp::client::FtpClient;
use crate::ftp::error::{FtpError, FtpResult};

impl FtpClient {
    // ─── MKD ─────────────────────────────────────────────────────

    /// Create a directory on the remote server.
    pub async fn mkdir(&mut self, path: &str) -> FtpResult<String> {
        let resp = self
            .control
            .execute(&format!("MKD {}", path))
            .await?
            .into_result()?;
        // "257 \"/new/dir\" created"
        Ok(crate::ftp::control::parse_pwd(&resp.message).unwrap_or_else(|_| path.to_string()))
    }

    /// Create a directory and all missing parents (FTP has no MKDIRP).
    /// The working directory is left unchanged.
    pub async fn create_directory(&mut self, path: &str) -> FtpResult<()> {
        let mut current = String::new();
        if path.starts_with('/') {
            current.push('/');
        }

        for component in path.split('/').filter(|c| !c.is_empty()) {
            if !current.is_empty() && !current.ends_with('/') {
                current.push('/');
            }
            current.push_str(component);

            let resp = self.control.execute(&format!("MKD {}", current)).await?;
            if resp.success() {
                log::debug!("Created remote directory {}", current);
                continue;
            }
            // Usually "already exists"; anything else is an error.
            if !self.directory_exists(&current).await? {
                return Err(FtpError::from_reply(&resp));
            }
        }
        Ok(())
    }

    /// Probe with CWD and change back.
    pub async fn directory_exists(&mut self, path: &str) -> FtpResult<bool> {
        let home = self.control.get_working_directory().await?;
        let resp = self.control.execute(&format!("CWD {}", path)).await?;
        if !resp.success() {
            return Ok(false);
        }
        self.control.set_working_directory(&home).await?;
        Ok(true)
    }

    pub async fn file_exists(&mut self, path: &str) -> FtpResult<bool> {
        self.control.file_exists(path).await
    }

    pub async fn file_size(&mut self, path: &str) -> FtpResult<Option<u64>> {
        self.control.file_size(path).await
    }

    // ─── RMD ─────────────────────────────────────────────────────

    /// Remove an empty directory.
    pub async fn delete_directory(&mut self, path: &str) -> FtpResult<()> {
        self.control
            .execute(&format!("RMD {}", path))
            .await?
            .into_result()?;
        Ok(())
    }

    // ─── RNFR / RNTO ────────────────────────────────────────────

    /// Rename (or move) a file or directory.
    pub async fn rename(&mut self, from: &str, to: &str) -> FtpResult<()> {
        let rnfr = self.control.execute(&format!("RNFR {}", from)).await?;
        if !rnfr.is_intermediate() && !rnfr.is_completion() {
            return Err(FtpError::from_reply(&rnfr));
        }
        self.control
            .execute(&format!("RNTO {}", to))
            .await?
            .into_result()?;
        Ok(())
    }

    // ─── DELE ────────────────────────────────────────────────────

    /// Delete a remote file.
    pub async fn delete_file(&mut self, path: &str) -> FtpResult<()> {
        self.control
            .execute(&format!("DELE {}", path))
            .await?
            .into_result()?;
        Ok(())
    }
}

/// Parent directory of a remote path, if it has one.
pub fn remote_parent(path: &str) -> Option<&str> {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(0) => Some("/"),
        Some(idx) => Some(&trimmed[..idx]),
        None => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parent_of_remote_paths() {
        assert_eq!(remote_parent("/a/b/c.txt"), Some("/a/b"));
        assert_eq!(remote_parent("/c.txt"), Some("/"));
        assert_eq!(remote_parent("dir/c.txt"), Some("dir"));
        assert_eq!(remote_parent("c.txt"), None);
    }
}

//! Remote file properties: SIZE, MDTM, HASH / XSHA256.

use crate::ftp::capabilities::FtpCapability;
use crate::ftp::control::ControlChannel;
use crate::ftp::error::{FtpError, FtpResult};
use crate::ftp::types::FtpReply;
use crate::ftp::verify::FtpHash;
use chrono::{DateTime, NaiveDateTime, Utc};

impl ControlChannel {
    /// Size in bytes, `None` when the server will not say.
    pub async fn file_size(&mut self, path: &str) -> FtpResult<Option<u64>> {
        if self.quirks().dont_use_size(path) {
            return Ok(None);
        }
        let reply = self.execute(&format!("SIZE {}", path)).await?;
        if !reply.is_completion() {
            return Ok(None);
        }
        Ok(reply.message.split_whitespace().last().and_then(|s| s.parse().ok()))
    }

    /// Last modification time (UTC), `None` when unavailable.
    pub async fn modified_time(&mut self, path: &str) -> FtpResult<Option<DateTime<Utc>>> {
        let reply = self.execute(&format!("MDTM {}", path)).await?;
        if !reply.is_completion() {
            return Ok(None);
        }
        Ok(parse_mdtm(&reply.message))
    }

    /// Whether `path` names a file (SIZE, then MDTM).
    pub async fn file_exists(&mut self, path: &str) -> FtpResult<bool> {
        if !self.quirks().dont_use_size(path)
            && self.execute(&format!("SIZE {}", path)).await?.is_completion()
        {
            return Ok(true);
        }
        Ok(self.execute(&format!("MDTM {}", path)).await?.is_completion())
    }

    /// Server-side SHA-256 of `path`, `None` when the server cannot hash.
    pub async fn remote_hash(&mut self, path: &str) -> FtpResult<Option<FtpHash>> {
        if self.features().supports_hash("SHA-256") {
            let opts = self.execute("OPTS HASH SHA-256").await?;
            if opts.is_completion() {
                let reply = self.execute(&format!("HASH {}", path)).await?;
                return parse_hash_reply(&reply).map(Some);
            }
            log::debug!("OPTS HASH refused: {}", opts.status_line());
        }
        if self.has_feature(FtpCapability::XSha256) {
            let reply = self.execute(&format!("XSHA256 {}", path)).await?;
            return parse_hash_reply(&reply).map(Some);
        }
        Ok(None)
    }
}

/// `YYYYMMDDHHMMSS[.sss]` → UTC time.
pub fn parse_mdtm(text: &str) -> Option<DateTime<Utc>> {
    let stamp = text.split_whitespace().next()?;
    let stamp = stamp.get(..14)?;
    NaiveDateTime::parse_from_str(stamp, "%Y%m%d%H%M%S")
        .ok()
        .map(|naive| naive.and_utc())
}

/// `213 SHA-256 0-1023 <hex> name` (HASH) or `213 <hex>` (XSHA256).
fn parse_hash_reply(reply: &FtpReply) -> FtpResult<FtpHash> {
    if !reply.is_completion() {
        return Err(FtpError::from_reply(reply));
    }
    let value = reply
        .message
        .split_whitespace()
        .find(|w| w.len() == 64 && w.chars().all(|c| c.is_ascii_hexdigit()))
        .ok_or_else(|| FtpError::protocol_error(format!("Cannot parse hash: {}", reply.message)))?;
    Ok(FtpHash {
        algorithm: "SHA-256".into(),
        value: value.to_lowercase(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, Timelike};

    #[test]
    fn mdtm_parsing() {
        let t = parse_mdtm("20240229123456").unwrap();
        assert_eq!((t.year(), t.month(), t.day()), (2024, 2, 29));
        assert_eq!((t.hour(), t.minute(), t.second()), (12, 34, 56));
        assert!(parse_mdtm("20240229123456.789").is_some());
        assert!(parse_mdtm("yesterday").is_none());
    }

    #[test]
    fn hash_reply_parsing() {
        let hex = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";
        let hash =
            parse_hash_reply(&FtpReply::new("213", format!("SHA-256 0-0 {} empty.txt", hex)))
                .unwrap();
        assert_eq!(hash.value, hex);

        let hash = parse_hash_reply(&FtpReply::new("213", hex.to_uppercase())).unwrap();
        assert_eq!(hash.value, hex);

        assert!(parse_hash_reply(&FtpReply::new("213", "busy")).is_err());
        assert!(parse_hash_reply(&FtpReply::new("550", "no")).is_err());
    }
}

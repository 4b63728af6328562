//! Server capabilities (RFC 2389 FEAT) and server quirks.
//!
//! The engine only ever asks two things of the server profile: does the
//! server advertise a feature, and does a quirk apply to a path. Quirk
//! tables for specific server products live outside the engine and plug in
//! through [`ServerQuirks`].

use crate::ftp::types::FtpReply;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Features the engine reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FtpCapability {
    Mlsd,
    Mlst,
    Size,
    Mdtm,
    RestStream,
    Utf8,
    Epsv,
    Eprt,
    AuthTls,
    Pbsz,
    Prot,
    Pret,
    Hash,
    XSha256,
    Mfmt,
    Clnt,
    Tvfs,
}

impl FtpCapability {
    fn from_feat_line(line: &str) -> Option<Self> {
        let keyword = line.split_whitespace().next()?;
        let cap = match keyword {
            "MLSD" => FtpCapability::Mlsd,
            "MLST" => FtpCapability::Mlst,
            "SIZE" => FtpCapability::Size,
            "MDTM" => FtpCapability::Mdtm,
            "REST" if line.contains("STREAM") => FtpCapability::RestStream,
            "UTF8" => FtpCapability::Utf8,
            "EPSV" => FtpCapability::Epsv,
            "EPRT" => FtpCapability::Eprt,
            "AUTH" if line.contains("TLS") => FtpCapability::AuthTls,
            "PBSZ" => FtpCapability::Pbsz,
            "PROT" => FtpCapability::Prot,
            "PRET" => FtpCapability::Pret,
            "HASH" => FtpCapability::Hash,
            "XSHA256" => FtpCapability::XSha256,
            "MFMT" => FtpCapability::Mfmt,
            "CLNT" => FtpCapability::Clnt,
            "TVFS" => FtpCapability::Tvfs,
            _ => return None,
        };
        Some(cap)
    }
}

/// Parsed FEAT response.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerFeatures {
    caps: HashSet<FtpCapability>,
    /// Feature lines as sent, upper-cased and trimmed.
    pub raw_features: Vec<String>,
    /// Algorithms listed on the HASH feature line, `*` marking the active one.
    pub hash_algorithms: Vec<String>,
}

impl ServerFeatures {
    pub fn from_feat_reply(reply: &FtpReply) -> Self {
        if !reply.success() {
            return Self::default();
        }

        let raw: Vec<String> = reply
            .info_lines
            .iter()
            .skip(1) // "211-Features:"
            .map(|l| l.trim().to_uppercase())
            .filter(|l| !l.is_empty() && !l.starts_with("211"))
            .collect();

        let mut features = Self::default();
        for line in &raw {
            if let Some(cap) = FtpCapability::from_feat_line(line) {
                features.caps.insert(cap);
            }
            if let Some(list) = line.strip_prefix("HASH ") {
                features.hash_algorithms = list
                    .split(';')
                    .map(|a| a.trim().to_string())
                    .filter(|a| !a.is_empty())
                    .collect();
            }
        }
        features.raw_features = raw;
        features
    }

    pub fn has(&self, cap: FtpCapability) -> bool {
        self.caps.contains(&cap)
    }

    pub fn insert(&mut self, cap: FtpCapability) {
        self.caps.insert(cap);
    }

    pub fn is_empty(&self) -> bool {
        self.caps.is_empty()
    }

    /// Whether the HASH feature lists `algorithm` (ignoring the `*` marker).
    pub fn supports_hash(&self, algorithm: &str) -> bool {
        self.has(FtpCapability::Hash)
            && self
                .hash_algorithms
                .iter()
                .any(|a| a.trim_end_matches('*').eq_ignore_ascii_case(algorithm))
    }
}

/// Per-server deviations from the RFCs.
pub trait ServerQuirks: Send + Sync {
    /// Read downloads until EOF even when the size is known (servers whose
    /// SIZE disagrees with what RETR sends).
    fn always_read_to_end(&self, _path: &str) -> bool {
        false
    }

    /// SIZE is unreliable for this path.
    fn dont_use_size(&self, _path: &str) -> bool {
        false
    }
}

/// A server that behaves.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoQuirks;

impl ServerQuirks for NoQuirks {}

//! TCP transport: resolves the server and walks the address list.
//!
//! Every resolved address allowed by the IP-version preference is tried in
//! resolver order, each under the connect timeout, until one answers.

use crate::ftp::error::{FtpError, FtpResult};
use crate::ftp::protocol::guarded;
use crate::ftp::types::IpVersion;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{lookup_host, TcpStream};
use tokio_util::sync::CancellationToken;

/// Resolve `host:port` and keep the addresses `version` allows.
pub async fn resolve(
    host: &str,
    port: u16,
    version: IpVersion,
    limit: Duration,
    cancel: &CancellationToken,
) -> FtpResult<Vec<SocketAddr>> {
    let target = format!("{}:{}", host, port);
    let addrs: Vec<SocketAddr> = guarded(cancel, Some(limit), "DNS lookup", async {
        lookup_host((host, port))
            .await
            .map(|it| it.collect())
            .map_err(|e| FtpError::connection_failed(format!("Resolve {}: {}", target, e)))
    })
    .await?;

    let filtered: Vec<SocketAddr> = addrs
        .into_iter()
        .filter(|a| match version {
            IpVersion::Any => true,
            IpVersion::V4 => a.is_ipv4(),
            IpVersion::V6 => a.is_ipv6(),
        })
        .collect();

    if filtered.is_empty() {
        return Err(FtpError::connection_failed(format!(
            "No {:?} address for {}",
            version, target
        )));
    }
    Ok(filtered)
}

/// Connect to the first reachable address.
pub async fn connect_any(
    addrs: &[SocketAddr],
    limit: Duration,
    cancel: &CancellationToken,
) -> FtpResult<TcpStream> {
    let mut last_err = FtpError::connection_failed("No address to connect to");
    for addr in addrs {
        match connect_one(*addr, limit, cancel).await {
            Ok(tcp) => return Ok(tcp),
            Err(e) if e.is_cancelled() => return Err(e),
            Err(e) => {
                log::warn!("Connect to {} failed: {}", addr, e);
                last_err = e;
            }
        }
    }
    Err(last_err)
}

/// One connect attempt with the deadline applied.
pub async fn connect_one(
    addr: SocketAddr,
    limit: Duration,
    cancel: &CancellationToken,
) -> FtpResult<TcpStream> {
    let tcp = guarded(cancel, Some(limit), &format!("Connect to {}", addr), async {
        TcpStream::connect(addr)
            .await
            .map_err(|e| FtpError::connection_failed(format!("TCP connect to {}: {}", addr, e)))
    })
    .await?;
    tcp.set_nodelay(true).ok();
    Ok(tcp)
}

/// Resolve and connect in one go.
pub async fn open_control_socket(
    host: &str,
    port: u16,
    version: IpVersion,
    limit: Duration,
    cancel: &CancellationToken,
) -> FtpResult<TcpStream> {
    let addrs = resolve(host, port, version, limit, cancel).await?;
    log::debug!("Resolved {}:{} to {:?}", host, port, addrs);
    connect_any(&addrs, limit, cancel).await
}

//! Data-channel negotiation (RFC 959, RFC 2428).
//!
//! Supports six modes:
//! - **Passive / ExtendedPassive**: `PASV` / `EPSV`, client connects
//! - **ActivePort / ExtendedPort**: `PORT` / `EPRT`, server connects back
//! - **AutoPassive / AutoActive**: extended command first, legacy command
//!   once when the server rejects it permanently (IPv4 only)
//!
//! Legacy modes are upgraded to their extended form on IPv6 control
//! connections. After the socket is up, `REST` (when resuming) and the
//! transfer command are sent, and TLS is activated once the command was
//! accepted.

use crate::ftp::capabilities::FtpCapability;
use crate::ftp::connection;
use crate::ftp::control::ControlChannel;
use crate::ftp::data_channel::{DataChannel, DataStream};
use crate::ftp::error::{FtpError, FtpErrorKind, FtpResult};
use crate::ftp::protocol::guarded;
use crate::ftp::types::{DataChannelMode, FtpReply};
use lazy_static::lazy_static;
use regex::Regex;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

lazy_static! {
    static ref PASV_RE: Regex =
        Regex::new(r"(\d{1,3}),(\d{1,3}),(\d{1,3}),(\d{1,3}),(\d{1,3}),(\d{1,3})").unwrap();
    static ref EPSV_RE: Regex = Regex::new(r"\([!|]{3}(\d+)[!|]\)").unwrap();
}

/// Open a data channel for `command` (`RETR x`, `STOR x`, `APPE x`, …),
/// restarting at `restart` when it is non-zero.
pub async fn open_data_channel(
    control: &mut ControlChannel,
    mode: DataChannelMode,
    command: &str,
    restart: u64,
) -> FtpResult<DataChannel> {
    open_data_channel_at(control, mode, command, Restart::new(restart, false)).await
}

/// Where a transfer starts. An exact restart fails before the transfer
/// command is sent when `REST` would be skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Restart {
    pub offset: u64,
    pub exact: bool,
}

impl Restart {
    pub fn new(offset: u64, exact: bool) -> Self {
        Self { offset, exact }
    }
}

pub async fn open_data_channel_at(
    control: &mut ControlChannel,
    mode: DataChannelMode,
    command: &str,
    restart: Restart,
) -> FtpResult<DataChannel> {
    control.ensure_connected().await?;
    let ipv6 = control.local_addr()?.is_ipv6();
    let mode = effective_mode(mode, ipv6);
    log::debug!("Opening {:?} data channel for '{}'", mode, command);

    if mode.is_passive() {
        open_passive(control, mode, command, restart).await
    } else {
        open_active(control, mode, command, restart).await
    }
}

/// Legacy commands cannot carry IPv6 addresses.
pub fn effective_mode(mode: DataChannelMode, ipv6: bool) -> DataChannelMode {
    match (mode, ipv6) {
        (DataChannelMode::Passive, true) => DataChannelMode::ExtendedPassive,
        (DataChannelMode::ActivePort, true) => DataChannelMode::ExtendedPort,
        (m, _) => m,
    }
}

// ─── PASV / EPSV ─────────────────────────────────────────────────────

async fn open_passive(
    control: &mut ControlChannel,
    mut mode: DataChannelMode,
    command: &str,
    restart: Restart,
) -> FtpResult<DataChannel> {
    let ipv6 = control.local_addr()?.is_ipv6();
    let max_attempts = control.config().passive_max_attempts.max(1);
    let mut attempts = 0u32;

    let target = loop {
        if control.has_feature(FtpCapability::Pret) {
            control
                .execute(&format!("PRET {}", command))
                .await?
                .into_result()?;
        }

        let use_epsv = match mode {
            DataChannelMode::ExtendedPassive => true,
            DataChannelMode::AutoPassive => ipv6 || !control.state().epsv_not_supported,
            _ => false,
        };

        let target = if use_epsv {
            let reply = control.execute("EPSV").await?;
            if !reply.success() {
                if mode == DataChannelMode::AutoPassive && !ipv6 && reply.is_permanent_failure() {
                    log::info!("EPSV rejected ({}), falling back to PASV", reply.status_line());
                    control.state_mut().epsv_not_supported = true;
                    mode = DataChannelMode::Passive;
                    continue;
                }
                return Err(data_channel_error(&reply));
            }
            let port = parse_epsv_port(&reply.text())?;
            SocketAddr::new(control.peer_addr()?.ip(), port)
        } else {
            if ipv6 {
                return Err(FtpError::protocol_error(
                    "PASV cannot be used over an IPv6 control connection",
                ));
            }
            let reply = control.execute("PASV").await?;
            if !reply.success() {
                return Err(data_channel_error(&reply));
            }
            let advertised = parse_pasv_response(&reply.text())?;
            passive_target(advertised, control.peer_addr()?, control.config().behind_proxy)
        };

        attempts += 1;
        if control.config().passive_blocked_ports.contains(&target.port()) {
            if attempts >= max_attempts {
                return Err(FtpError::data_channel(format!(
                    "No acceptable passive port after {} attempts",
                    attempts
                )));
            }
            log::debug!("Passive port {} is blocked, renegotiating", target.port());
            continue;
        }
        break target;
    };

    let tcp = connection::connect_one(
        target,
        control.config().data_connect_timeout(),
        control.cancel_token(),
    )
    .await
    .map_err(|e| {
        if e.is_cancelled() || e.is_timeout() {
            e
        } else {
            FtpError::data_channel(format!("Passive connect to {}: {}", target, e.message))
        }
    })?;

    let position = send_restart(control, command, restart).await?;
    let status = control.execute(command).await?;
    if !status.success() {
        drop(tcp);
        return Err(FtpError::from_reply(&status));
    }
    finish_open(control, tcp, status, position).await
}

/// Parse `(h1,h2,h3,h4,p1,p2)` from a 227 response.
pub fn parse_pasv_response(text: &str) -> FtpResult<SocketAddr> {
    let caps = PASV_RE
        .captures(text)
        .ok_or_else(|| FtpError::protocol_error(format!("Cannot parse PASV: {}", text)))?;

    let nums: Vec<u8> = (1..=6)
        .map(|i| {
            caps[i]
                .parse::<u8>()
                .map_err(|_| FtpError::protocol_error("PASV number out of range"))
        })
        .collect::<Result<Vec<_>, _>>()?;

    let ip = IpAddr::from([nums[0], nums[1], nums[2], nums[3]]);
    let port = (nums[4] as u16) * 256 + (nums[5] as u16);
    Ok(SocketAddr::new(ip, port))
}

/// Parse the port from `229 Entering Extended Passive Mode (|||port|)`,
/// accepting a PASV-style tuple from servers that answer EPSV that way.
pub fn parse_epsv_port(text: &str) -> FtpResult<u16> {
    if let Some(caps) = EPSV_RE.captures(text) {
        return caps[1]
            .parse::<u16>()
            .map_err(|_| FtpError::protocol_error("EPSV port out of range"));
    }
    parse_pasv_response(text)
        .map(|addr| addr.port())
        .map_err(|_| FtpError::protocol_error(format!("Cannot parse EPSV: {}", text)))
}

/// Servers behind NAT advertise their private address; use the control
/// peer instead unless a proxy sits in between.
fn passive_target(advertised: SocketAddr, control_peer: SocketAddr, behind_proxy: bool) -> SocketAddr {
    match advertised.ip() {
        IpAddr::V4(ip) if !behind_proxy && is_non_routable(ip) && ip != peer_v4(control_peer) => {
            log::debug!(
                "PASV advertised non-routable {}, using control peer {}",
                ip,
                control_peer.ip()
            );
            SocketAddr::new(control_peer.ip(), advertised.port())
        }
        _ => advertised,
    }
}

fn peer_v4(peer: SocketAddr) -> Ipv4Addr {
    match peer.ip() {
        IpAddr::V4(ip) => ip,
        IpAddr::V6(ip) => ip.to_ipv4_mapped().unwrap_or(Ipv4Addr::UNSPECIFIED),
    }
}

fn is_non_routable(ip: Ipv4Addr) -> bool {
    ip.is_private() || ip.is_loopback() || ip.is_unspecified() || ip.is_link_local()
}

// ─── PORT / EPRT ─────────────────────────────────────────────────────

async fn open_active(
    control: &mut ControlChannel,
    mut mode: DataChannelMode,
    command: &str,
    restart: Restart,
) -> FtpResult<DataChannel> {
    let ipv6 = control.local_addr()?.is_ipv6();
    let bind_ip = match &control.config().active_bind_address {
        Some(addr) => parse_ip(addr, "active bind address")?,
        None => control.local_addr()?.ip(),
    };
    let external_ip = match &control.config().active_external_address {
        Some(addr) => Some(parse_ip(addr, "active external address")?),
        None => None,
    };

    let mut accept = loop {
        let listener = TcpListener::bind(SocketAddr::new(bind_ip, 0))
            .await
            .map_err(|e| FtpError::data_channel(format!("Active bind on {}: {}", bind_ip, e)))?;
        let bound = listener
            .local_addr()
            .map_err(|e| FtpError::data_channel(format!("Active local_addr: {}", e)))?;
        let advertised = external_ip.unwrap_or(bound.ip());

        // Start accepting before the server is told where to connect.
        let accept: JoinHandle<std::io::Result<(TcpStream, SocketAddr)>> =
            tokio::spawn(async move { listener.accept().await });

        let use_eprt = matches!(
            mode,
            DataChannelMode::ExtendedPort | DataChannelMode::AutoActive
        );
        let cmd = if use_eprt {
            let af = if advertised.is_ipv6() { 2 } else { 1 };
            format!("EPRT |{}|{}|{}|", af, advertised, bound.port())
        } else {
            match advertised {
                IpAddr::V4(ip) => {
                    let o = ip.octets();
                    format!(
                        "PORT {},{},{},{},{},{}",
                        o[0],
                        o[1],
                        o[2],
                        o[3],
                        bound.port() / 256,
                        bound.port() % 256
                    )
                }
                IpAddr::V6(_) => {
                    accept.abort();
                    return Err(FtpError::protocol_error("PORT requires an IPv4 address"));
                }
            }
        };

        let reply = match control.execute(&cmd).await {
            Ok(reply) => reply,
            Err(e) => {
                accept.abort();
                return Err(e);
            }
        };
        if reply.success() {
            break accept;
        }
        accept.abort();
        if use_eprt
            && mode == DataChannelMode::AutoActive
            && !ipv6
            && reply.is_permanent_failure()
        {
            log::info!("EPRT rejected ({}), falling back to PORT", reply.status_line());
            mode = DataChannelMode::ActivePort;
            continue;
        }
        return Err(data_channel_error(&reply));
    };

    let position = match send_restart(control, command, restart).await {
        Ok(position) => position,
        Err(e) => {
            accept.abort();
            return Err(e);
        }
    };
    let status = match control.execute(command).await {
        Ok(status) => status,
        Err(e) => {
            accept.abort();
            return Err(e);
        }
    };
    if !status.success() {
        accept.abort();
        return Err(FtpError::from_reply(&status));
    }

    let accepted = guarded(
        control.cancel_token(),
        Some(control.config().data_connect_timeout()),
        "Accepting data connection",
        async {
            match (&mut accept).await {
                Ok(Ok((tcp, peer))) => {
                    log::debug!("Accepted data connection from {}", peer);
                    Ok(tcp)
                }
                Ok(Err(e)) => Err(FtpError::data_channel(format!("Active accept: {}", e))),
                Err(e) => Err(FtpError::data_channel(format!("Active accept task: {}", e))),
            }
        },
    )
    .await;
    let tcp = match accepted {
        Ok(tcp) => tcp,
        Err(e) => {
            accept.abort();
            return Err(e);
        }
    };
    tcp.set_nodelay(true).ok();
    finish_open(control, tcp, status, position).await
}

fn parse_ip(addr: &str, what: &str) -> FtpResult<IpAddr> {
    addr.parse::<IpAddr>()
        .map_err(|e| FtpError::invalid_config(format!("Invalid {} '{}': {}", what, addr, e)))
}

// ─── Shared steps ────────────────────────────────────────────────────

/// `REST <offset>` before the transfer command. Behind a proxy a download
/// offset is only sent while it is below the remote size. Returns the
/// offset the transfer really starts at.
async fn send_restart(
    control: &mut ControlChannel,
    command: &str,
    restart: Restart,
) -> FtpResult<u64> {
    if restart.offset == 0 {
        return Ok(0);
    }
    if control.config().behind_proxy && is_retr(command) {
        let path = command_argument(command);
        match control.file_size(path).await? {
            Some(size) if restart.offset < size => {}
            size if restart.exact => {
                return Err(FtpError::transfer_failed(format!(
                    "Cannot restart {} at {} (remote size {:?})",
                    path, restart.offset, size
                )));
            }
            size => {
                log::debug!(
                    "Skipping REST {} for {} (remote size {:?})",
                    restart.offset,
                    path,
                    size
                );
                return Ok(0);
            }
        }
    }
    control
        .execute(&format!("REST {}", restart.offset))
        .await?
        .into_result()?;
    Ok(restart.offset)
}

fn is_retr(command: &str) -> bool {
    command
        .split_whitespace()
        .next()
        .is_some_and(|verb| verb.eq_ignore_ascii_case("RETR"))
}

/// Record the pending reply and wrap the socket in TLS when required.
async fn finish_open(
    control: &mut ControlChannel,
    tcp: TcpStream,
    status: FtpReply,
    position: u64,
) -> FtpResult<DataChannel> {
    control.state_mut().pending_data_reply = status.is_preliminary();

    let local_addr = tcp.local_addr()?;
    let peer_addr = tcp.peer_addr()?;
    let stream = if control.config().data_connection_encryption && control.is_encrypted() {
        DataStream::Tls(Box::new(control.activate_tls(tcp).await?))
    } else {
        DataStream::Plain(tcp)
    };

    Ok(DataChannel::new(
        stream,
        local_addr,
        peer_addr,
        status,
        position,
        control.config().data_read_timeout(),
        control.cancel_token().clone(),
    ))
}

fn data_channel_error(reply: &FtpReply) -> FtpError {
    let mut err = FtpError::from_reply(reply);
    err.kind = FtpErrorKind::DataChannelFailed;
    err
}

/// The path part of `RETR some file.txt`.
pub(crate) fn command_argument(command: &str) -> &str {
    command
        .split_once(' ')
        .map(|(_, arg)| arg.trim())
        .unwrap_or("")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_pasv_reply() {
        let addr =
            parse_pasv_response("227 Entering Passive Mode (192,168,1,10,195,80).").unwrap();
        assert_eq!(addr, "192.168.1.10:50000".parse().unwrap());
        assert!(parse_pasv_response("227 Entering Passive Mode").is_err());
        assert!(parse_pasv_response("227 (300,1,1,1,1,1)").is_err());
    }

    #[test]
    fn parses_epsv_reply() {
        assert_eq!(parse_epsv_port("229 Entering Extended Passive Mode (|||6446|)").unwrap(), 6446);
        assert_eq!(parse_epsv_port("229 ok (!!!2121!)").unwrap(), 2121);
        // PASV-style answer to EPSV.
        assert_eq!(parse_epsv_port("229 (127,0,0,1,4,1)").unwrap(), 1025);
        assert!(parse_epsv_port("229 whatever").is_err());
    }

    #[test]
    fn upgrades_legacy_modes_on_ipv6() {
        assert_eq!(
            effective_mode(DataChannelMode::Passive, true),
            DataChannelMode::ExtendedPassive
        );
        assert_eq!(
            effective_mode(DataChannelMode::ActivePort, true),
            DataChannelMode::ExtendedPort
        );
        assert_eq!(
            effective_mode(DataChannelMode::Passive, false),
            DataChannelMode::Passive
        );
        assert_eq!(
            effective_mode(DataChannelMode::AutoActive, true),
            DataChannelMode::AutoActive
        );
    }

    #[test]
    fn private_pasv_address_is_replaced() {
        let peer: SocketAddr = "203.0.113.7:21".parse().unwrap();
        let advertised: SocketAddr = "10.0.0.5:40000".parse().unwrap();
        assert_eq!(
            passive_target(advertised, peer, false),
            "203.0.113.7:40000".parse::<SocketAddr>().unwrap()
        );
        assert_eq!(passive_target(advertised, peer, true), advertised);

        let public: SocketAddr = "198.51.100.9:40000".parse().unwrap();
        assert_eq!(passive_target(public, peer, false), public);
    }

    #[test]
    fn extracts_command_argument() {
        assert_eq!(command_argument("RETR dir/my file.bin"), "dir/my file.bin");
        assert_eq!(command_argument("LIST"), "");
    }
}

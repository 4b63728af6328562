//! Connection handshake: banner → AUTH TLS → USER/PASS → PBSZ/PROT → FEAT
//! → OPTS UTF8.
//!
//! Runs directly on the codec, never through `ControlChannel::execute`, so
//! a reconnect can never trigger another reconnect.

use crate::ftp::capabilities::{FtpCapability, ServerFeatures};
use crate::ftp::connection;
use crate::ftp::error::{FtpError, FtpResult};
use crate::ftp::protocol::{guarded, mask_command, FtpCodec};
use crate::ftp::tls::TlsProvider;
use crate::ftp::types::{FtpConnectionConfig, FtpReply, FtpSecurityMode};
use tokio_util::sync::CancellationToken;

/// A logged-in control connection.
pub struct Established {
    pub codec: FtpCodec,
    pub features: ServerFeatures,
    pub banner: String,
}

/// Open the control socket and log in.
pub async fn login(
    config: &FtpConnectionConfig,
    tls: &dyn TlsProvider,
    cancel: &CancellationToken,
) -> FtpResult<Established> {
    let tcp = connection::open_control_socket(
        &config.host,
        config.port,
        config.ip_version,
        config.connect_timeout(),
        cancel,
    )
    .await?;

    let mut codec = if config.security == FtpSecurityMode::Implicit {
        // Implicit FTPS: TLS wraps the socket immediately.
        let stream = guarded(
            cancel,
            Some(config.connect_timeout()),
            "Implicit TLS handshake",
            tls.activate(tcp, &config.host),
        )
        .await?;
        FtpCodec::from_tls(stream, config.encoding)?
    } else {
        FtpCodec::from_tcp(tcp, config.encoding)?
    };

    // ── Banner ───────────────────────────────────────────────────
    let mut banner = read(&mut codec, config, cancel).await?;
    if banner.code.as_deref() == Some("120") {
        log::info!("Server not ready yet: {}", banner.message);
        banner = read(&mut codec, config, cancel).await?;
    }
    if !banner.is_completion() {
        return Err(FtpError::connection_failed(format!(
            "Server refused connection: {}",
            banner.text()
        )));
    }

    // ── Explicit FTPS: AUTH TLS ──────────────────────────────────
    if config.security == FtpSecurityMode::Explicit {
        let resp = exec(&mut codec, "AUTH TLS", config, cancel).await?;
        if resp.code.as_deref() != Some("234") {
            return Err(FtpError::tls_failed(format!(
                "AUTH TLS rejected: {}",
                resp.text()
            )));
        }
        let tcp = codec.into_tcp()?;
        let stream = guarded(
            cancel,
            Some(config.connect_timeout()),
            "Explicit TLS handshake",
            tls.activate(tcp, &config.host),
        )
        .await?;
        codec = FtpCodec::from_tls(stream, config.encoding)?;
    }

    // ── Authenticate ─────────────────────────────────────────────
    let user_resp = exec(&mut codec, &format!("USER {}", config.username), config, cancel).await?;
    if user_resp.is_intermediate() {
        let pass_resp =
            exec(&mut codec, &format!("PASS {}", config.password), config, cancel).await?;
        if !pass_resp.is_completion() {
            return Err(FtpError::auth_failed(format!(
                "Login failed: {}",
                pass_resp.text()
            ))
            .with_code(pass_resp.code_u16().unwrap_or(0)));
        }
    } else if !user_resp.is_completion() {
        return Err(FtpError::auth_failed(format!(
            "USER rejected: {}",
            user_resp.text()
        )));
    }

    // ── Protection level ─────────────────────────────────────────
    if codec.is_encrypted() {
        exec(&mut codec, "PBSZ 0", config, cancel).await?.into_result()?;
        let prot = if config.data_connection_encryption {
            "PROT P"
        } else {
            "PROT C"
        };
        exec(&mut codec, prot, config, cancel).await?.into_result()?;
    }

    // ── FEAT ─────────────────────────────────────────────────────
    let features = ServerFeatures::from_feat_reply(&exec(&mut codec, "FEAT", config, cancel).await?);

    // ── OPTS UTF8 ON ─────────────────────────────────────────────
    if config.utf8 && features.has(FtpCapability::Utf8) {
        let resp = exec(&mut codec, "OPTS UTF8 ON", config, cancel).await?;
        if !resp.success() {
            log::debug!("OPTS UTF8 ON refused: {}", resp.status_line());
        }
    }

    log::info!(
        "Logged in to {}:{} as {} ({})",
        config.host,
        config.port,
        config.username,
        if codec.is_encrypted() { "encrypted" } else { "plain" }
    );

    Ok(Established {
        codec,
        features,
        banner: banner.text(),
    })
}

async fn read(
    codec: &mut FtpCodec,
    config: &FtpConnectionConfig,
    cancel: &CancellationToken,
) -> FtpResult<FtpReply> {
    guarded(cancel, Some(config.read_timeout()), "Reading banner", codec.read_reply()).await
}

/// Send one command and read its reply.
pub(crate) async fn exec(
    codec: &mut FtpCodec,
    cmd: &str,
    config: &FtpConnectionConfig,
    cancel: &CancellationToken,
) -> FtpResult<FtpReply> {
    let masked = mask_command(cmd);
    let mut reply = guarded(cancel, Some(config.read_timeout()), &masked, async {
        codec.send_command(cmd).await?;
        codec.read_reply().await
    })
    .await?;
    reply.command = masked;
    Ok(reply)
}

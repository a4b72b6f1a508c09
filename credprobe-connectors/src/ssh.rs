//! SSH and SFTP over libssh2. The session handshake and auth are blocking, so
//! each attempt dials asynchronously and hands the socket to a blocking task
//! that does the whole exchange and returns plain data.

use async_trait::async_trait;
use credprobe_types::{Protocol, Target};

use crate::{candidates, prober, Connector, ConnectorError, ProbeContext, ProbeReport};

pub struct SshConnector;
pub struct SftpConnector;

const DEFAULTS: &[(&str, &str)] = &[
    ("root", "root"),
    ("root", "toor"),
    ("admin", "admin"),
    ("ubuntu", "ubuntu"),
    ("centos", "centos"),
];

const SSH_BLOCKING_TIMEOUT_MS: u32 = 10_000;
const LIBSSH2_ERROR_AUTHENTICATION_FAILED: i32 = -18;

fn map_ssh_err(e: ssh2::Error) -> ConnectorError {
    if matches!(e.code(), ssh2::ErrorCode::Session(LIBSSH2_ERROR_AUTHENTICATION_FAILED)) {
        ConnectorError::AuthFailed(e.message().to_string())
    } else {
        ConnectorError::Protocol(format!("ssh: {}", e.message()))
    }
}

fn exec(session: &ssh2::Session, command: &str) -> Result<String, ssh2::Error> {
    use std::io::Read;

    let mut channel = session.channel_session()?;
    channel.exec(command)?;
    let mut out = String::new();
    let _ = channel.read_to_string(&mut out);
    let _ = channel.wait_close();
    Ok(out.trim_end().to_string())
}

async fn open_session(
    target: &Target,
    cx: &ProbeContext,
    user: &str,
    pass: &str,
) -> Result<ssh2::Session, ConnectorError> {
    let stream = cx.dial(&target.host, target.port).await?;
    let stream = stream.into_std().map_err(ConnectorError::Io)?;
    stream.set_nonblocking(false).map_err(ConnectorError::Io)?;

    let user = user.to_string();
    let pass = pass.to_string();
    tokio::task::spawn_blocking(move || {
        let mut session = ssh2::Session::new().map_err(map_ssh_err)?;
        session.set_tcp_stream(stream);
        session.set_timeout(SSH_BLOCKING_TIMEOUT_MS);
        session.handshake().map_err(map_ssh_err)?;
        session.userauth_password(&user, &pass).map_err(map_ssh_err)?;
        Ok(session)
    })
    .await
    .map_err(|e| ConnectorError::Protocol(format!("ssh task failed: {e}")))?
}

struct SshAccess {
    banner: String,
    identity: String,
    kernel: String,
}

async fn ssh_attempt(
    target: &Target,
    cx: &ProbeContext,
    user: &str,
    pass: &str,
) -> Result<SshAccess, ConnectorError> {
    let session = open_session(target, cx, user, pass).await?;
    tokio::task::spawn_blocking(move || {
        let banner = session.banner().unwrap_or("(none)").to_string();
        let identity = exec(&session, "id").map_err(map_ssh_err)?;
        let kernel = exec(&session, "uname -a").unwrap_or_default();
        Ok(SshAccess {
            banner,
            identity,
            kernel,
        })
    })
    .await
    .map_err(|e| ConnectorError::Protocol(format!("ssh task failed: {e}")))?
}

#[async_trait]
impl Connector for SshConnector {
    fn protocol(&self) -> Protocol {
        Protocol::Ssh
    }

    async fn probe(&self, target: &Target, cx: &ProbeContext) -> ProbeReport {
        cx.log(format!("connecting to ssh at {}", target.addr()));
        let list = candidates(target, DEFAULTS);
        let result = prober::run(cx, list, |cred| async move {
            ssh_attempt(target, cx, &cred.username, &cred.password).await
        })
        .await;

        let (cred, access) = match result {
            Ok(pair) => pair,
            Err(e) => return ProbeReport::from_error(&e),
        };
        cx.log(format!("authenticated as {}", cred.username));

        let rule = "=".repeat(45);
        let mut evidence = format!(
            "ssh password login accepted at {} (user: {})\n{rule}\nserver banner: {}\nid: {}\n",
            target.addr(),
            cred.username,
            access.banner,
            access.identity
        );
        if !access.kernel.is_empty() {
            evidence.push_str(&format!("uname -a: {}\n", access.kernel));
        }
        ProbeReport::success(
            format!("ssh access verified ({} credentials)", cred.label),
            evidence,
        )
    }

    async fn run_command(
        &self,
        target: &Target,
        cx: &ProbeContext,
        command: &str,
    ) -> Result<String, ConnectorError> {
        let list = candidates(target, DEFAULTS);
        let (cred, session) = prober::run(cx, list, |cred| async move {
            open_session(target, cx, &cred.username, &cred.password).await
        })
        .await?;
        cx.log(format!("running command as {}", cred.username));

        let command = command.to_string();
        tokio::task::spawn_blocking(move || exec(&session, &command).map_err(map_ssh_err))
            .await
            .map_err(|e| ConnectorError::Protocol(format!("ssh task failed: {e}")))?
    }
}

#[async_trait]
impl Connector for SftpConnector {
    fn protocol(&self) -> Protocol {
        Protocol::Sftp
    }

    async fn probe(&self, target: &Target, cx: &ProbeContext) -> ProbeReport {
        cx.log(format!("connecting to sftp at {}", target.addr()));
        let list = candidates(target, DEFAULTS);
        let result = prober::run(cx, list, |cred| async move {
            let session = open_session(target, cx, &cred.username, &cred.password).await?;
            tokio::task::spawn_blocking(move || {
                let banner = session.banner().unwrap_or("(none)").to_string();
                let sftp = session.sftp().map_err(map_ssh_err)?;
                let entries = sftp
                    .readdir(std::path::Path::new("/"))
                    .map_err(map_ssh_err)?;
                let names: Vec<String> = entries
                    .iter()
                    .filter_map(|(path, _)| Some(path.file_name()?.to_string_lossy().into_owned()))
                    .collect();
                Ok((banner, names))
            })
            .await
            .map_err(|e| ConnectorError::Protocol(format!("ssh task failed: {e}")))?
        })
        .await;

        let (cred, (banner, names)) = match result {
            Ok(pair) => pair,
            Err(e) => return ProbeReport::from_error(&e),
        };
        cx.log(format!(
            "sftp subsystem open as {} ({} entries under /)",
            cred.username,
            names.len()
        ));

        let rule = "=".repeat(45);
        let mut evidence = format!(
            "sftp login accepted at {} (user: {})\n{rule}\nserver banner: {banner}\n\nroot directory:\n",
            target.addr(),
            cred.username
        );
        for name in names.iter().take(10) {
            evidence.push_str(&format!("  /{name}\n"));
        }
        if names.len() > 10 {
            evidence.push_str(&format!("  ... ({} more entries)\n", names.len() - 10));
        }
        ProbeReport::success(
            format!("sftp access verified ({} credentials)", cred.label),
            evidence,
        )
    }
}

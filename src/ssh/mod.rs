// Shared SSH transport for the WireGuard and Xray adapters.
//
// Both remote adapters open a short-lived connection per command rather than holding
// one open across ticks, mirroring the original service's per-call `asyncssh.connect`
// pattern: the adapters are used a handful of times per scheduler tick, and a fresh
// connection avoids needing to detect and recover a half-dead multiplexed session.

use crate::error::{BrokerError, Result};
use async_trait::async_trait;
use russh::client::{self, Handle};
use russh_keys::key;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
const LOGIN_TIMEOUT: Duration = Duration::from_secs(15);
const COMMAND_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Clone)]
pub enum SshAuth {
    Password(String),
    PrivateKeyBase64(String),
}

#[derive(Clone)]
pub struct SshTarget {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub auth: SshAuth,
}

struct AcceptAllHostKeys;

#[async_trait]
impl client::Handler for AcceptAllHostKeys {
    type Error = russh::Error;

    async fn check_server_key(
        self,
        _server_public_key: &key::PublicKey,
    ) -> std::result::Result<(Self, bool), Self::Error> {
        // Host-key pinning is out of scope; the remote hosts are operator-provisioned
        // and reached over a fixed address from configuration, not discovered.
        Ok((self, true))
    }
}

#[derive(Clone)]
pub struct SshClient {
    target: SshTarget,
    retries: u32,
}

impl SshClient {
    pub fn new(target: SshTarget) -> Self {
        Self { target, retries: 2 }
    }

    async fn connect(&self) -> Result<Handle<AcceptAllHostKeys>> {
        let config = Arc::new(client::Config::default());
        let addr = (self.target.host.as_str(), self.target.port);
        let mut session = timeout(
            CONNECT_TIMEOUT,
            client::connect(config, addr, AcceptAllHostKeys),
        )
        .await
        .map_err(|_| BrokerError::transient("ssh connect timed out"))??;

        let authenticated = match &self.target.auth {
            SshAuth::Password(password) => timeout(
                LOGIN_TIMEOUT,
                session.authenticate_password(&self.target.user, password),
            )
            .await
            .map_err(|_| BrokerError::transient("ssh login timed out"))??,
            SshAuth::PrivateKeyBase64(key_b64) => {
                use base64::{engine::general_purpose::STANDARD, Engine as _};
                let key_text = STANDARD
                    .decode(key_b64)
                    .ok()
                    .and_then(|b| String::from_utf8(b).ok())
                    .ok_or_else(|| BrokerError::InvalidConfig("malformed ssh private key".into()))?;
                let key_pair = russh_keys::decode_secret_key(key_text.trim(), None)
                    .map_err(|e| BrokerError::InvalidConfig(format!("bad ssh private key: {e}")))?;
                timeout(
                    LOGIN_TIMEOUT,
                    session.authenticate_publickey(&self.target.user, Arc::new(key_pair)),
                )
                .await
                .map_err(|_| BrokerError::transient("ssh login timed out"))??
            }
        };

        if !authenticated {
            return Err(BrokerError::Ssh("ssh authentication rejected".into()));
        }
        Ok(session)
    }

    /// Runs `cmd` on the remote host and returns its stdout, retrying once on
    /// transient failure. A non-zero exit status is treated as a failure.
    pub async fn run(&self, cmd: &str) -> Result<String> {
        let mut last_err = None;
        for attempt in 0..self.retries {
            match self.run_once(cmd).await {
                Ok(out) => return Ok(out),
                Err(e) => {
                    tracing::warn!(attempt, command = cmd, error = %e, "ssh command failed");
                    last_err = Some(e);
                    tokio::time::sleep(Duration::from_millis(500)).await;
                }
            }
        }
        Err(last_err.unwrap_or_else(|| BrokerError::transient("ssh command failed")))
    }

    async fn run_once(&self, cmd: &str) -> Result<String> {
        let session = self.connect().await?;
        let mut channel = session
            .channel_open_session()
            .await
            .map_err(|e| BrokerError::Ssh(e.to_string()))?;
        let full_cmd = format!("PATH=/usr/sbin:/usr/bin:/sbin:/bin {cmd}");
        channel
            .exec(true, full_cmd.as_bytes())
            .await
            .map_err(|e| BrokerError::Ssh(e.to_string()))?;

        let mut stdout = Vec::new();
        let mut exit_status: Option<u32> = None;

        let read_loop = async {
            while let Some(msg) = channel.wait().await {
                match msg {
                    russh::ChannelMsg::Data { ref data } => stdout.extend_from_slice(data),
                    russh::ChannelMsg::ExitStatus { exit_status: code } => {
                        exit_status = Some(code);
                    }
                    russh::ChannelMsg::Eof => break,
                    _ => {}
                }
            }
        };
        timeout(COMMAND_TIMEOUT, read_loop)
            .await
            .map_err(|_| BrokerError::transient("ssh command timed out"))?;

        if exit_status.unwrap_or(0) != 0 {
            return Err(BrokerError::transient(format!(
                "remote command exited with status {:?}: {cmd}",
                exit_status
            )));
        }

        String::from_utf8(stdout)
            .map_err(|e| BrokerError::Ssh(format!("non-utf8 remote output: {e}")))
    }
}

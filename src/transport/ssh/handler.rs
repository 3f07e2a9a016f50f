//! russh [`Handler`] for one SSH connection: authentication, session channels, and exactly
//! one `exec` per channel handed to the session driver.

use std::{collections::HashMap, net::SocketAddr, sync::Arc};

use async_trait::async_trait;
use russh::{
    Channel, ChannelId, Pty,
    server::{Auth, Handler, Msg, Session},
};
use russh_keys::key::PublicKey;
use tokio::io::AsyncWriteExt;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use super::{
    channel::{TerminationPlan, split_buffered},
    exec::parse_exec_command,
};
use crate::{protocol::ProtocolError, transport::session::SessionDriver};

/// Decides who may connect. Repository-level authorization is not modelled.
#[async_trait]
pub trait SshAuthenticator: Send + Sync {
    async fn check_password(&self, user: &str, password: &str) -> bool;

    async fn check_publickey(&self, user: &str, key: &PublicKey) -> bool;
}

/// Accepts every user and credential.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

#[async_trait]
impl SshAuthenticator for AllowAll {
    async fn check_password(&self, _user: &str, _password: &str) -> bool {
        true
    }

    async fn check_publickey(&self, _user: &str, _key: &PublicKey) -> bool {
        true
    }
}

/// Per-connection handler state.
pub struct SshSession {
    driver: SessionDriver,
    authenticator: Arc<dyn SshAuthenticator>,
    peer: Option<SocketAddr>,
    user: Option<String>,
    /// Session channels opened but not yet exec'd.
    channels: HashMap<ChannelId, Channel<Msg>>,
    tasks: TaskTracker,
    buffer_bytes: usize,
}

impl SshSession {
    pub fn new(
        driver: SessionDriver,
        authenticator: Arc<dyn SshAuthenticator>,
        peer: Option<SocketAddr>,
        tasks: TaskTracker,
        buffer_bytes: usize,
    ) -> Self {
        Self {
            driver,
            authenticator,
            peer,
            user: None,
            channels: HashMap::new(),
            tasks,
            buffer_bytes,
        }
    }

    fn decide(&mut self, user: &str, accepted: bool, method: &'static str) -> Auth {
        if accepted {
            info!(peer = ?self.peer, user, method, "ssh authentication accepted");
            self.user = Some(user.to_string());
            Auth::Accept
        } else {
            warn!(peer = ?self.peer, user, method, "ssh authentication rejected");
            Auth::Reject {
                proceed_with_methods: None,
            }
        }
    }
}

#[async_trait]
impl Handler for SshSession {
    type Error = anyhow::Error;

    async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth, Self::Error> {
        let accepted = self.authenticator.check_password(user, password).await;
        Ok(self.decide(user, accepted, "password"))
    }

    async fn auth_publickey(&mut self, user: &str, key: &PublicKey) -> Result<Auth, Self::Error> {
        debug!(user, fingerprint = %key.fingerprint(), "ssh public key offered");
        let accepted = self.authenticator.check_publickey(user, key).await;
        Ok(self.decide(user, accepted, "publickey"))
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        debug!(channel = ?channel.id(), "session channel opened");
        self.channels.insert(channel.id(), channel);
        Ok(true)
    }

    async fn channel_close(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.channels.remove(&channel);
        Ok(())
    }

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        debug!(?channel, "shell request refused");
        session.channel_failure(channel);
        Ok(())
    }

    async fn subsystem_request(
        &mut self,
        channel: ChannelId,
        name: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        debug!(?channel, name, "subsystem request refused");
        session.channel_failure(channel);
        Ok(())
    }

    async fn env_request(
        &mut self,
        channel: ChannelId,
        variable_name: &str,
        _variable_value: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        // GIT_PROTOCOL=version=2 lands here; only v1 is spoken.
        debug!(?channel, variable_name, "env request refused");
        session.channel_failure(channel);
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn pty_request(
        &mut self,
        channel: ChannelId,
        _term: &str,
        _col_width: u32,
        _row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _modes: &[(Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        debug!(?channel, "pty request refused");
        session.channel_failure(channel);
        Ok(())
    }

    async fn exec_request(
        &mut self,
        channel_id: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let raw = String::from_utf8_lossy(data).into_owned();
        let Some(channel) = self.channels.remove(&channel_id) else {
            warn!(channel = ?channel_id, command = %raw, "repeated exec on channel refused");
            session.channel_failure(channel_id);
            return Ok(());
        };
        session.channel_success(channel_id);
        let handle = session.handle();

        let command = match parse_exec_command(&raw) {
            Ok(command) => command,
            Err(e) => {
                warn!(peer = ?self.peer, command = %raw, error = %e, "unsupported ssh command");
                self.tasks.spawn(async move {
                    TerminationPlan::failure(&e).execute(&handle, channel_id).await;
                    drop(channel);
                });
                return Ok(());
            }
        };

        info!(
            peer = ?self.peer,
            user = ?self.user,
            service = %command.service,
            repo = %command.repo,
            "ssh exec"
        );
        let driver = self.driver.clone();
        let capacity = self.buffer_bytes;
        self.tasks.spawn(async move {
            let (mut reader, mut writer) = split_buffered(channel.into_stream(), capacity);
            let mut outcome = driver
                .serve_ssh(command.service, &command.repo, &mut reader, &mut writer)
                .await;
            if outcome.is_ok() {
                outcome = writer.flush().await.map_err(ProtocolError::from);
            }
            match &outcome {
                Ok(()) => debug!(repo = %command.repo, "ssh exec finished"),
                Err(e) => warn!(repo = %command.repo, error = %e, "ssh exec failed"),
            }
            TerminationPlan::for_outcome(&outcome)
                .execute(&handle, channel_id)
                .await;
        });
        Ok(())
    }
}

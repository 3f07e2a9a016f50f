//! SSH listener: one russh session per accepted TCP connection, each exec'd channel served by
//! the session driver in its own task.

pub mod channel;
pub mod exec;
pub mod handler;

use std::{fs, future::Future, io::Write, net::SocketAddr, path::Path, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use russh::{MethodSet, server};
use russh_keys::key::KeyPair;
use socket2::{SockRef, TcpKeepalive};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

pub use handler::{AllowAll, SshAuthenticator, SshSession};

use super::session::SessionDriver;
use crate::config::SshConfig;

/// Idle time before the kernel starts probing an accepted connection.
const TCP_KEEPALIVE_TIME: Duration = Duration::from_secs(10);

pub struct SshServer {
    driver: SessionDriver,
    authenticator: Arc<dyn SshAuthenticator>,
    config: Arc<server::Config>,
    buffer_bytes: usize,
}

impl SshServer {
    pub fn new(
        driver: SessionDriver,
        authenticator: Arc<dyn SshAuthenticator>,
        ssh: &SshConfig,
        host_key: KeyPair,
    ) -> Self {
        Self {
            driver,
            authenticator,
            config: Arc::new(server_config(ssh, host_key)),
            buffer_bytes: ssh.buffer_bytes,
        }
    }

    /// Accept connections on `addr` until `shutdown` resolves. Connections already running
    /// are left to finish on their own.
    pub async fn run<F>(self, addr: SocketAddr, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind ssh listener on {addr}"))?;
        info!(%addr, "ssh server listening");

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("ssh server stopped accepting connections");
                    return Ok(());
                }
                accepted = listener.accept() => match accepted {
                    Ok((socket, peer)) => self.spawn_connection(socket, peer),
                    Err(e) => warn!(error = %e, "failed to accept ssh connection"),
                }
            }
        }
    }

    fn spawn_connection(&self, socket: TcpStream, peer: SocketAddr) {
        debug!(%peer, "ssh connection accepted");
        if let Err(e) = enable_tcp_keepalive(&socket) {
            warn!(%peer, error = %e, "failed to enable tcp keepalive");
        }
        let tasks = TaskTracker::new();
        let handler = SshSession::new(
            self.driver.clone(),
            Arc::clone(&self.authenticator),
            Some(peer),
            tasks.clone(),
            self.buffer_bytes,
        );
        let config = Arc::clone(&self.config);
        tokio::spawn(async move {
            let outcome = match server::run_stream(config, socket, handler).await {
                Ok(session) => session.await,
                Err(e) => Err(e),
            };
            if let Err(e) = outcome {
                debug!(%peer, error = %e, "ssh connection ended with error");
            }
            // Channel tasks may still be writing their termination steps.
            tasks.close();
            tasks.wait().await;
            debug!(%peer, "ssh connection closed");
        });
    }
}

/// Turns on TCP keepalive so dead peers are detected even while no SSH traffic flows.
fn enable_tcp_keepalive(socket: &TcpStream) -> std::io::Result<()> {
    let keepalive = TcpKeepalive::new().with_time(TCP_KEEPALIVE_TIME);
    SockRef::from(socket).set_tcp_keepalive(&keepalive)
}

/// russh server settings derived from the `ssh` config section.
pub fn server_config(ssh: &SshConfig, host_key: KeyPair) -> server::Config {
    server::Config {
        keys: vec![host_key],
        methods: MethodSet::PUBLICKEY | MethodSet::PASSWORD,
        inactivity_timeout: Some(ssh.idle_timeout()),
        keepalive_interval: Some(ssh.keepalive_interval()),
        keepalive_max: 3,
        auth_rejection_time: Duration::from_secs(1),
        auth_rejection_time_initial: Some(Duration::from_secs(0)),
        ..Default::default()
    }
}

/// Load the ed25519 host key at `path`, generating and persisting one when the file does
/// not exist yet.
pub fn load_or_generate_host_key(path: &Path) -> Result<KeyPair> {
    if path.exists() {
        let pem = fs::read_to_string(path)
            .with_context(|| format!("failed to read ssh host key {}", path.display()))?;
        let key = russh_keys::decode_secret_key(&pem, None)
            .with_context(|| format!("failed to decode ssh host key {}", path.display()))?;
        info!(path = %path.display(), "loaded ssh host key");
        return Ok(key);
    }

    let key = KeyPair::generate_ed25519();
    let mut pem = Vec::new();
    russh_keys::encode_pkcs8_pem(&key, &mut pem).context("failed to encode ssh host key")?;
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    write_private(path, &pem)
        .with_context(|| format!("failed to write ssh host key {}", path.display()))?;
    warn!(path = %path.display(), "generated new ssh host key");
    Ok(key)
}

fn write_private(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let mut options = fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path)?;
    file.write_all(contents)?;
    file.sync_all()
}

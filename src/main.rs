use std::{path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use git_smart_server::{
    config::{Config, LoggerConfig, StorageType},
    storage::{LocalBackend, MemoryBlobStore, Registry, RemoteBackend, S3BlobStore, StorageBackend},
    transport::{
        SessionDriver, http,
        ssh::{AllowAll, SshServer, load_or_generate_host_key},
    },
};

#[derive(Parser, Debug)]
#[command(name = "git-smart-server", version, about = "Git smart HTTP and SSH server")]
struct Cli {
    /// Path to the YAML configuration file; defaults apply when omitted.
    #[arg(short, long, env = "GSS_CONFIG")]
    config: Option<PathBuf>,

    #[arg(long, env = "GSS_STORAGE_TYPE")]
    storage_type: Option<StorageType>,

    #[arg(long, env = "GSS_HTTP_PORT")]
    http_port: Option<u16>,

    #[arg(long, env = "GSS_SSH_PORT")]
    ssh_port: Option<u16>,

    #[arg(long, env = "GSS_SSH_ENABLED")]
    ssh_enabled: Option<bool>,

    /// Root directory of the local backend.
    #[arg(long, env = "GSS_LOCAL_PATH")]
    local_path: Option<PathBuf>,
}

impl Cli {
    fn apply(self, config: &mut Config) {
        if let Some(storage_type) = self.storage_type {
            config.storage.storage_type = storage_type;
        }
        if let Some(port) = self.http_port {
            config.http.port = port;
        }
        if let Some(port) = self.ssh_port {
            config.ssh.port = port;
        }
        if let Some(enabled) = self.ssh_enabled {
            config.ssh.enabled = enabled;
        }
        if let Some(path) = self.local_path {
            config.storage.local.path = path;
        }
    }
}

fn init_tracing(logger: &LoggerConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(logger.level.as_str()));
    let registry = tracing_subscriber::registry().with(filter);
    if logger.pretty {
        registry.with(tracing_subscriber::fmt::layer()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    }
}

async fn build_backend(config: &Config) -> Result<Arc<dyn StorageBackend>> {
    let storage = &config.storage;
    let init = storage.init_options();
    let backend: Arc<dyn StorageBackend> = match storage.storage_type {
        StorageType::Local => Arc::new(
            LocalBackend::new(&storage.local.path, storage.local.cache_bytes, init)
                .await
                .with_context(|| {
                    format!("failed to open local storage at {}", storage.local.path.display())
                })?,
        ),
        StorageType::S3 => {
            let store = S3BlobStore::connect(&storage.s3)
                .await
                .context("failed to configure s3 storage")?;
            Arc::new(RemoteBackend::new(store, init))
        }
        StorageType::Memory => Arc::new(RemoteBackend::new(MemoryBlobStore::new(), init)),
    };
    Ok(backend)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    let config_path = cli.config.clone();
    cli.apply(&mut config);
    config.validate()?;

    init_tracing(&config.logger);
    info!(
        config = ?config_path,
        storage = %config.storage.storage_type,
        "starting git-smart-server"
    );

    let backend = build_backend(&config).await?;
    let driver = SessionDriver::new(Registry::new(backend));
    let shutdown = CancellationToken::new();

    let http_addr = config.http.listen_addr()?;
    let router = http::create_router(driver.clone(), config.http.logs);
    let http_task = tokio::spawn({
        let token = shutdown.clone();
        async move {
            let outcome = http::serve(http_addr, router, token.clone().cancelled_owned()).await;
            // Either listener stopping brings the other one down too.
            token.cancel();
            outcome
        }
    });

    let ssh_task = if config.ssh.enabled {
        let ssh_addr = config.ssh.listen_addr()?;
        let host_key = load_or_generate_host_key(&config.ssh.host_key_path)?;
        let server = SshServer::new(driver, Arc::new(AllowAll), &config.ssh, host_key);
        let token = shutdown.clone();
        Some(tokio::spawn(async move {
            let outcome = server.run(ssh_addr, token.clone().cancelled_owned()).await;
            token.cancel();
            outcome
        }))
    } else {
        info!("ssh server disabled");
        None
    };

    tokio::spawn({
        let token = shutdown.clone();
        async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    info!("shutdown requested");
                    token.cancel();
                }
                Err(e) => error!(error = %e, "failed to listen for shutdown signal"),
            }
        }
    });

    let mut outcome = http_task.await.context("http server task panicked")?;
    if let Some(task) = ssh_task {
        let ssh_outcome = task.await.context("ssh server task panicked")?;
        if outcome.is_ok() {
            outcome = ssh_outcome;
        }
    }
    if let Err(e) = &outcome {
        error!(error = %e, "server exited with error");
    }
    info!("git-smart-server stopped");
    outcome
}

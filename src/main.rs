use relaypanel::api::{ApiServer, ApiState, PKG_NAME, VERSION};
use relaypanel::config::Config;
use relaypanel::db::Database;
use relaypanel::provision::Provisioner;
use relaypanel::restart::RestartCoordinator;
use relaypanel::xray::XrayProcess;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("relaypanel=debug".parse().expect("valid log directive")),
        )
        .init();

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    info!(path = %config_path.display(), "Configuration loaded");
    print_startup_banner(&config);

    // Write PID file if configured (with exclusive lock on Unix)
    let pid_file_path = config.server.pid_file.as_ref().map(PathBuf::from);
    let _pid_file = if let Some(ref path) = pid_file_path {
        let pid_file = PidFile::create(path)?;
        info!(path = %path.display(), "PID file written and locked");
        Some(pid_file)
    } else {
        None
    };

    let db = Database::open(&config.database.path)?;

    if let Some((username, password)) = config.admin.credentials() {
        db.bootstrap_admin(username, password)?;
    }
    if db.count_users()? == 0 {
        warn!("No users exist yet; provisioning fails until an admin user is configured");
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let xray = Arc::new(XrayProcess::new(config.xray.clone(), db.clone()));
    let coordinator = RestartCoordinator::new(xray.clone(), &config.restart);

    if let Err(e) = xray.start().await {
        error!(error = %e, "Failed to start xray; retrying on the next tick");
        coordinator.signal_change();
    }

    let coordinator_handle = tokio::spawn(Arc::clone(&coordinator).run(shutdown_rx.clone()));

    let provisioner = Provisioner::new(
        Arc::new(db.clone()),
        Arc::clone(&coordinator),
        config.provision.clone(),
    )?;

    let auth_token = match config.server.api_token.clone() {
        Some(token) => token,
        None => {
            let token = uuid::Uuid::new_v4().simple().to_string();
            info!(token = %token, "Generated API token (set server.api_token to pin it)");
            token
        }
    };

    let state = Arc::new(ApiState {
        provisioner,
        coordinator: Arc::clone(&coordinator),
        auth_token,
    });

    let api_addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port).parse()?;
    let api_server = ApiServer::new(api_addr, state, shutdown_rx.clone());
    let api_handle = tokio::spawn(async move {
        if let Err(e) = api_server.run().await {
            error!(error = %e, "API server error");
        }
    });

    // Wait for shutdown signal (Ctrl+C or SIGTERM); SIGHUP forces a restart
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sighup = signal(SignalKind::hangup())?;

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Received SIGINT (Ctrl+C), shutting down...");
                    break;
                }
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, shutting down...");
                    break;
                }
                _ = sighup.recv() => {
                    info!("Received SIGHUP, xray will restart on the next tick");
                    coordinator.signal_change();
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C, shutting down...");
    }

    let _ = shutdown_tx.send(true);

    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        let _ = api_handle.await;
        let _ = coordinator_handle.await;
    })
    .await;

    info!("Stopping xray...");
    xray.stop().await;

    if let Some(ref path) = pid_file_path {
        if let Err(e) = std::fs::remove_file(path) {
            warn!(path = %path.display(), error = %e, "Failed to remove PID file");
        }
    }

    info!("Shutdown complete");
    Ok(())
}

/// PID file handle that maintains an exclusive lock
#[cfg(unix)]
struct PidFile {
    _file: std::fs::File,
}

#[cfg(unix)]
impl PidFile {
    fn create(path: &Path) -> anyhow::Result<Self> {
        use std::io::Write;
        use std::os::unix::io::AsRawFd;

        let file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;

        let result = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if result != 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::WouldBlock {
                anyhow::bail!("Another panel is already running (PID file is locked)");
            }
            return Err(err.into());
        }

        writeln!(&file, "{}", std::process::id())?;
        Ok(Self { _file: file })
    }
}

#[cfg(not(unix))]
struct PidFile;

#[cfg(not(unix))]
impl PidFile {
    fn create(path: &Path) -> anyhow::Result<Self> {
        use std::io::Write;
        let mut file = std::fs::File::create(path)?;
        writeln!(file, "{}", std::process::id())?;
        Ok(Self)
    }
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting panel");
    info!(
        bind = %config.server.bind,
        port = config.server.port,
        database = %config.database.path,
        "Server configuration"
    );
    info!(
        port_range = ?config.provision.port_range(),
        port_attempts = config.provision.port_attempts,
        protocol = %config.provision.protocol,
        network = config.provision.transport.network.as_str(),
        security = config.provision.transport.security.as_str(),
        "Provisioning defaults"
    );
    info!(
        interval_secs = config.restart.interval_secs,
        timeout_secs = config.restart.timeout_secs,
        rearm_on_failure = config.restart.rearm_on_failure,
        "Restart debouncing"
    );
    info!(
        command = %config.xray.command,
        config_path = %config.xray.config_path,
        "Managed xray"
    );
}

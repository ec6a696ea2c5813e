use std::io::Write;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Context;
use argon2::Argon2;
use password_hash::{PasswordHasher, SaltString};
use sqlx::MySqlPool;
use tracing::info;

mod config;
mod dispatch;
mod eventlog;
mod idgen;
mod instance;
mod launcher;
mod manager;
mod master;
mod sessions;
mod storage;
mod transport;

use crate::config::Config;
use crate::eventlog::EventLog;
use crate::idgen::PersistentIdAllocator;
use crate::launcher::Launcher;
use crate::manager::InstanceManager;
use crate::master::Master;

fn init_tracing(cfg: &Config) {
    if !cfg.log_to_console {
        return;
    }
    let default = if cfg.log_debug {
        "debug,masterd=debug"
    } else {
        "info,masterd=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default.into()),
        )
        .with_target(false)
        .init();
}

fn spawn_signal_listener(flag: Arc<AtomicBool>) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let (Ok(mut sigint), Ok(mut sigterm)) = (
                signal(SignalKind::interrupt()),
                signal(SignalKind::terminate()),
            ) else {
                return;
            };
            tokio::select! {
                _ = sigint.recv() => (),
                _ = sigterm.recv() => (),
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
        }
        flag.store(true, Ordering::Relaxed);
    });
}

fn prompt(label: &str) -> anyhow::Result<String> {
    print!("{label}");
    std::io::stdout().flush()?;
    let mut line = String::new();
    std::io::stdin().read_line(&mut line)?;
    Ok(line.trim().to_string())
}

/// `masterd --account`: bootstrap an elevated account for the operator.
/// Only the argon2 hash ever reaches storage.
async fn create_admin_account(pool: &MySqlPool) -> anyhow::Result<()> {
    let username = prompt("Enter a username: ")?;
    if username.is_empty() {
        anyhow::bail!("username must not be empty");
    }
    let password = prompt("Enter a password: ")?;
    if password.len() < 8 {
        anyhow::bail!("password must be at least 8 characters");
    }

    let salt = SaltString::generate(&mut password_hash::rand_core::OsRng);
    let hash = Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| anyhow::anyhow!("hash_password failed: {e}"))?
        .to_string();

    storage::create_account(pool, &username, &hash).await?;
    println!("Account created successfully!");
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let (cfg, create_account) = config::parse_args();
    init_tracing(&cfg);

    info!(version = env!("CARGO_PKG_VERSION"), "starting master server");

    let pool = storage::connect(&cfg.db_url).await?;

    // The content database is read by the worlds, not by us, but a missing
    // one means the whole fleet is doomed; fail fast and loud.
    let content_db = cfg.client_location.join("res").join("content.db");
    if !content_db.is_file() {
        anyhow::bail!("content database missing at {}", content_db.display());
    }

    if create_account {
        create_admin_account(&pool).await?;
        pool.close().await;
        return Ok(());
    }

    storage::upsert_master_row(&pool, &cfg.master_ip, cfg.port).await?;

    let high_water = storage::load_persistent_id(&pool)
        .await
        .context("loading the persistent id high-water mark")?;
    let ids = PersistentIdAllocator::new(high_water);

    let log = EventLog::open(&cfg.log_dir)?;
    let launcher = Launcher::new(&cfg);
    let im = InstanceManager::new(cfg.external_ip.clone(), cfg.world_port_base, launcher);
    let mut master = Master::new(im, ids, log);

    let bind: SocketAddr = SocketAddr::new("0.0.0.0".parse()?, cfg.port);
    let mut transport = transport::bind(bind, cfg.max_clients).await?;

    if cfg.prestart {
        master.prestart();
    }

    let shutdown_flag = Arc::new(AtomicBool::new(false));
    spawn_signal_listener(shutdown_flag.clone());

    info!(
        bind = %transport.local_addr(),
        advertised = %cfg.master_ip,
        "master listening"
    );
    master.log.line("master started");

    master::run(&mut master, &mut transport, &pool, &shutdown_flag).await;
    master::shutdown(&mut master, &mut transport, &pool).await;

    pool.close().await;
    info!("master exited cleanly");
    Ok(())
}

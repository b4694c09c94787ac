// src/cli/daemon.rs — Foreground maintenance loop

use tokio::signal;

use crate::db::ConnectionPool;
use crate::infra::config::RetentionConfig;
use crate::retention::{cleanup_once, spawn_cleanup_task, RetentionPolicy};

/// Apply retention now and then on its interval, until Ctrl-C or SIGTERM.
pub async fn run_daemon(pool: ConnectionPool, retention: &RetentionConfig) -> anyhow::Result<()> {
    let policy = RetentionPolicy::from(retention);
    if policy.max_age.is_none() && policy.max_count.is_none() {
        println!("Retention is disabled; nothing to do.");
        return Ok(());
    }

    let first = cleanup_once(&pool, policy).await?;
    println!(
        "Initial cleanup removed {} sessions. Next pass in {:?}.",
        first.total(),
        retention.cleanup_interval()
    );

    let task = spawn_cleanup_task(pool, retention);
    shutdown_signal().await?;
    task.stop().await;
    println!("Stopped.");
    Ok(())
}

async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        let mut terminate = signal::unix::signal(signal::unix::SignalKind::terminate())?;
        tokio::select! {
            res = signal::ctrl_c() => {
                res?;
                println!("\nReceived Ctrl+C, shutting down...");
            }
            _ = terminate.recv() => println!("\nReceived SIGTERM, shutting down..."),
        }
    }
    #[cfg(not(unix))]
    {
        signal::ctrl_c().await?;
        println!("\nReceived Ctrl+C, shutting down...");
    }
    Ok(())
}

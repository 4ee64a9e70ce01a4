//! termhost: hosts interactive shell sessions for a supervising process.
//!
//! Control messages arrive as JSON lines on stdin and responses leave as JSON
//! lines on stdout. Logs go to stderr.

mod config;
mod guard;
mod host;
mod ipc;
mod output;
mod transport;

use std::time::Duration;

use termhost_channel::{ChannelManager, ChannelNotice};
use termhost_pty::SessionFactory;
use tokio::sync::mpsc;

use crate::config::HostConfig;
use crate::host::Host;

/// How long pending responses get to reach stdout after the host stops.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

#[tokio::main(flavor = "current_thread")]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .target(env_logger::Target::Stderr)
        .init();

    let config = match HostConfig::load() {
        Ok(config) => config,
        Err(e) => {
            log::error!("{e}");
            std::process::exit(2);
        }
    };

    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let (control_tx, control_rx) = mpsc::unbounded_channel();

    let writer = tokio::spawn(async move {
        if let Err(e) = transport::write_responses(tokio::io::stdout(), outbound_rx).await {
            log::error!("stdout closed: {e}");
        }
    });
    let reader_outbound = outbound_tx.clone();
    let reader = tokio::spawn(async move {
        let stdin = tokio::io::BufReader::new(tokio::io::stdin());
        if let Err(e) = transport::read_control(stdin, control_tx, reader_outbound).await {
            log::error!("stdin failed: {e}");
        }
    });

    // No channels are opened here; embedders create them on this manager.
    let (channels, notices) = ChannelManager::new(config.channel);
    channels.start_health_monitor();
    tokio::spawn(log_notices(notices));

    log::info!("termhost {} ready (pid {})", env!("CARGO_PKG_VERSION"), std::process::id());
    let mut host = Host::new(SessionFactory::native(), config, outbound_tx);
    host.run(control_rx, wait_for_shutdown_signal()).await;

    channels.cleanup();
    drop(host);
    reader.abort();
    if tokio::time::timeout(FLUSH_TIMEOUT, writer).await.is_err() {
        log::warn!("timed out flushing responses");
    }
    log::info!("termhost exiting");
    // stdin may still be blocked in a read on the blocking pool.
    std::process::exit(0);
}

async fn log_notices(mut notices: mpsc::UnboundedReceiver<ChannelNotice>) {
    while let Some(notice) = notices.recv().await {
        match notice {
            ChannelNotice::Disconnected { channel_id } => {
                log::info!("channel {channel_id} disconnected")
            }
            ChannelNotice::Stale { channel_id } => log::warn!("channel {channel_id} went stale"),
        }
    }
}

/// Resolve on Ctrl+C or SIGTERM.
async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::warn!("failed to listen for Ctrl+C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                log::warn!("failed to listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => log::info!("received Ctrl+C"),
        _ = terminate => log::info!("received SIGTERM"),
    }
}

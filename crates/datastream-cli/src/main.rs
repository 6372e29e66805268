use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use datastream_cli::config::{Cli, ClientArgs, Command, ServerArgs};
use datastream_cli::sequencer::{self, SEQUENCER_STREAM};
use datastream_cli::{Producer, ProducerConfig};
use datastream_client::{ClientConfig, ClientError, StreamClient};
use datastream_logging::{LogConfig, SubscriberBuilder};
use datastream_server::{ServerConfig, StreamServer};

/// Entries replayed by the client when no start entry is given
const DEFAULT_REPLAY: u64 = 10;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let log_config = match cli.log_dir.clone() {
        Some(directory) => LogConfig::server(directory),
        None => LogConfig::default(),
    };
    // Flushes file output on drop
    let _guard = SubscriberBuilder::new()
        .with_config(log_config)
        .with_level(&cli.log_level)
        .init()?;

    match cli.command {
        Command::Server(args) => run_server(args).await,
        Command::Client(args) => run_client(args).await,
    }
}

async fn run_server(args: ServerArgs) -> anyhow::Result<()> {
    let mut config = match &args.config {
        Some(path) => ServerConfig::from_toml_file(path)?,
        None => ServerConfig::default(),
    };
    if let Some(listen) = args.listen {
        config.listen_addr = listen;
    }
    if let Some(file) = args.file.clone() {
        config.store.path = file;
    }
    config.store.stream_type = SEQUENCER_STREAM;

    let server = Arc::new(StreamServer::new(config, sequencer::registry()).await?);
    let addr = server.start().await?;

    let header = server.header();
    info!(%addr, total_entries = header.total_entries, "Stream server started");
    if header.total_entries > DEFAULT_REPLAY {
        let entry = server.get_entry(DEFAULT_REPLAY).await?;
        info!(
            entry_number = entry.number,
            entry_type = %entry.entry_type,
            len = entry.len(),
            "Read back entry"
        );
    }

    let producer_config = ProducerConfig {
        interval: Duration::from_millis(args.interval_ms),
        rollback_every: args.rollback_every,
        max_transactions: args.max_transactions,
    };
    let producer = Producer::resume(server.clone(), producer_config).await?;
    let cancel = CancellationToken::new();
    let producer_task = tokio::spawn(producer.run(cancel.clone()));

    info!("Press Ctrl+C to stop");
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl+C")?;

    cancel.cancel();
    match producer_task.await {
        Ok(Ok(_)) => {}
        Ok(Err(e)) => error!(error = %e, "Producer failed"),
        Err(e) => error!(error = %e, "Producer task panicked"),
    }

    server.shutdown().await?;
    info!("Stream server stopped");
    Ok(())
}

async fn run_client(args: ClientArgs) -> anyhow::Result<()> {
    let config = ClientConfig::new(args.server, SEQUENCER_STREAM);
    let client = StreamClient::connect(config, sequencer::registry()).await?;

    let header = client.header().await?;
    info!(
        total_entries = header.total_entries,
        version = header.version,
        "Stream header"
    );

    let mut from_entry = args
        .from
        .unwrap_or_else(|| header.total_entries.saturating_sub(DEFAULT_REPLAY));

    'session: loop {
        let mut entries = client.start(from_entry).await?;
        info!(from_entry, "Streaming");

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => break 'session,
                next = entries.next() => match next {
                    Some(Ok(entry)) => {
                        println!("{}", client.registry().describe(&entry));
                        from_entry = entry.number + 1;
                    }
                    Some(Err(ClientError::Lagged { resume_from })) => {
                        warn!(resume_from, "Fell behind the live stream, restarting");
                        from_entry = resume_from;
                        continue 'session;
                    }
                    Some(Err(e)) => return Err(e.into()),
                    None => {
                        info!("Server closed the stream");
                        return Ok(());
                    }
                },
            }
        }
    }

    client.stop().await?;
    info!("Client stopped");
    Ok(())
}

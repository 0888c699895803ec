//! c3-hub: command-and-control hub for remote agents

use c3_hub::{Cli, Command, NoopRecords, Server, ServerConfig, Watcher};
use clap::Parser;
use serde_json::Value;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // RUST_LOG wins over --verbose
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cli.verbose {
            EnvFilter::new("c3_hub=debug")
        } else {
            EnvFilter::new("c3_hub=info")
        }
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let result = match &cli.command {
        Command::Watch { url, filter, clean } => run_watch_command(url, filter, *clean).await,
        serve => match serve.server_config() {
            Some(config) => run_server(config).await,
            None => Ok(()),
        },
    };

    if let Err(e) = result {
        error!("{}", e);
        std::process::exit(1);
    }
}

async fn run_server(config: ServerConfig) -> Result<(), Box<dyn std::error::Error>> {
    let server = Server::bind(config, Arc::new(NoopRecords)).await?;
    let registry = server.registry();
    let mut run = tokio::spawn(server.run());

    tokio::select! {
        finished = &mut run => {
            registry.shutdown().await;
            finished??;
            return Ok(());
        }
        () = shutdown_signal() => {
            info!("Received shutdown signal");
        }
    }

    registry.shutdown().await;
    run.await??;
    Ok(())
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(e) => {
            error!("Cannot listen for SIGTERM: {e}");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

async fn run_watch_command(
    url: &str,
    filter: &[String],
    clean: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut watcher = Watcher::connect(url).await?;
    info!(%url, "Watching events");

    while let Some(event) = watcher.next_event().await? {
        let client_id = event.get("client_id").and_then(Value::as_str);
        if !filter.is_empty() && !client_id.is_some_and(|id| filter.iter().any(|f| f == id)) {
            continue;
        }

        if clean {
            if let Some(output) = event.get("clean_output").and_then(Value::as_str) {
                println!("[{}] {output}", client_id.unwrap_or("?"));
            }
            continue;
        }

        // Newline-delimited JSON
        println!("{}", serde_json::to_string(&event)?);
    }

    Ok(())
}

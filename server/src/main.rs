use clap::Parser;
use log::{error, info};
use server::network::Server;

/// Command line arguments
#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Server IP address to bind to
    #[clap(short = 'H', long, default_value = "127.0.0.1")]
    host: String,
    /// Server port to listen on
    #[clap(short, long, default_value = "8080")]
    port: u16,
}

/// Binds the server, installs the termination-signal watcher and runs
/// until shutdown completes. Setup failures exit with a failure status.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args = Args::parse();

    let address = format!("{}:{}", args.host, args.port);
    let server = Server::new(&address).await?;

    let shutdown = server.shutdown_sender();
    tokio::spawn(async move {
        wait_for_termination().await;
        info!("Termination signal received, shutting down");
        let _ = shutdown.send(true);
    });

    server.run().await?;
    Ok(())
}

/// Resolves when the process receives Ctrl-C or, on Unix, SIGTERM.
/// Nothing but the shutdown flag is touched from signal context.
async fn wait_for_termination() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = terminate.recv() => {}
                }
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

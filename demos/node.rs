use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

use clap::Parser;
use did_dht::Dht;
use tracing::{info, Level};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Port to listen on.
    #[arg(short, long)]
    port: Option<u16>,
    /// Bootstrapping nodes, an empty list starts a new network.
    #[arg(short, long)]
    bootstrap: Option<Vec<String>>,
    /// Log every message.
    #[arg(short, long)]
    verbose: bool,
}

fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_max_level(if cli.verbose {
            Level::TRACE
        } else {
            Level::INFO
        })
        .with_thread_names(true)
        .init();

    let mut builder = Dht::builder();
    if let Some(port) = cli.port {
        builder.port(port);
    }
    if let Some(bootstrap) = &cli.bootstrap {
        builder.bootstrap(bootstrap);
    }

    let dht = builder.build().expect("Failed to create DHT server");

    let running = Arc::new(AtomicBool::new(true));
    {
        let running = running.clone();
        ctrlc::set_handler(move || running.store(false, Ordering::SeqCst))
            .expect("Error setting Ctrl-C handler");
    }

    info!("Waiting for bootstrap...");
    match dht.bootstrapped() {
        Ok(true) => info!("Bootstrap complete!"),
        Ok(false) => info!("Bootstrap failed, serving anyway"),
        Err(_) => return,
    }

    let mut elapsed = Duration::ZERO;

    while running.load(Ordering::SeqCst) {
        thread::sleep(Duration::from_millis(200));
        elapsed += Duration::from_millis(200);

        if elapsed < Duration::from_secs(30) {
            continue;
        }
        elapsed = Duration::ZERO;

        let Ok(info) = dht.info() else {
            break;
        };

        info!(
            id = %info.id(),
            local_addr = %info.local_addr(),
            routing_table_size = info.routing_table_size(),
            stored_values = info.stored_values(),
            pending_requests = info.pending_requests(),
            "Node status"
        );
    }

    info!("Shutting down");
    dht.shutdown();
}

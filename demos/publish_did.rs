use std::time::{Instant, SystemTime};

use clap::Parser;
use did_dht::{Dht, SigningKey};
use tracing::Level;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Hex encoded ed25519 secret key.
    secret_key: String,
    /// DID document to publish.
    document: String,
    /// Bootstrapping nodes, defaults to the mainline routers.
    #[arg(short, long)]
    bootstrap: Vec<String>,
}

fn main() {
    tracing_subscriber::fmt().with_max_level(Level::INFO).init();

    let cli = Cli::parse();

    let mut builder = Dht::builder();
    if !cli.bootstrap.is_empty() {
        builder.bootstrap(&cli.bootstrap);
    }
    let dht = builder.server_mode(false).build().expect("Failed to bind");

    let signer = from_hex(&cli.secret_key);
    let public_key = to_hex(signer.verifying_key().as_bytes());

    println!("\nPublishing DID document for public_key: {public_key} ...\n");

    let seq = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .expect("time drift")
        .as_micros() as i64;

    let item = Dht::create_put_request(&signer, cli.document.as_bytes(), seq)
        .expect("Invalid DID document");

    let start = Instant::now();

    match dht.put(item) {
        Ok(target) => println!(
            "Published at target {target} in {:?} seconds",
            start.elapsed().as_secs_f32()
        ),
        Err(error) => {
            println!("Failed to publish: {error}");
            return;
        }
    }

    let start = Instant::now();

    match dht.get(&public_key) {
        Ok(value) => println!(
            "Resolved {:?} in {:?} seconds",
            String::from_utf8_lossy(&value),
            start.elapsed().as_secs_f32()
        ),
        Err(error) => println!("Failed to resolve: {error}"),
    }
}

fn from_hex(s: &str) -> SigningKey {
    if s.len() != 64 {
        panic!("Expected 64 hex characters");
    }

    let mut bytes = [0_u8; 32];

    for (i, byte) in bytes.iter_mut().enumerate() {
        *byte = u8::from_str_radix(&s[i * 2..(i * 2) + 2], 16).expect("Invalid hex character");
    }

    SigningKey::from_bytes(&bytes)
}

fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|byte| format!("{:02x}", byte)).collect()
}

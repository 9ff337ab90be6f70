use cln_rs::{config::DEFAULT_RELAY, init_backend_with_config, Auth, ClientConfig, LnApi};
use tokio::fs;

/// Connects to a Core Lightning node through an lnsocket relay and prints `getinfo`.
///
/// Usage:
///   cargo run --example getinfo -- --address <pubkey@host[:port]> --rune <rune> [--secret <s>]
///   cargo run --example getinfo -- --auth auth.json
///
/// `auth.json` holds `{"address": ..., "token": ..., "sessionSecret": ...}`.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .try_init();
    let args: Vec<String> = std::env::args().collect();

    let auth = match flag_value(&args, "--auth") {
        Some(path) => serde_json::from_slice::<Auth>(&fs::read(path).await?)?,
        None => Auth::new(
            flag_value(&args, "--address").ok_or("--address or --auth is required")?,
            flag_value(&args, "--rune").unwrap_or_default(),
            flag_value(&args, "--secret").unwrap_or_else(|| "cln-rs getinfo demo".to_string()),
        ),
    };
    let config = ClientConfig {
        relay: flag_value(&args, "--relay").unwrap_or_else(|| DEFAULT_RELAY.to_string()),
        ..ClientConfig::default()
    };

    let node = init_backend_with_config("core_lightning", auth, config)?;
    let info = node.get_info().await?;
    println!("{info:#?}");
    let funds = node.list_funds().await?;
    let onchain: u64 = funds.outputs.iter().map(|o| o.amount_msat.to_sat()).sum();
    let offchain: u64 = funds.channels.iter().map(|c| c.our_amount_msat.to_sat()).sum();
    println!("on-chain: {onchain} sat, in channels: {offchain} sat");
    node.close().await;
    Ok(())
}

fn flag_value(args: &[String], flag: &str) -> Option<String> {
    args.windows(2)
        .find(|pair| pair[0] == flag)
        .map(|pair| pair[1].clone())
}

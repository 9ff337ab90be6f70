use std::time::Duration;

use cln_rs::{backend::PayInvoice, init_backend_with_config, Auth, ClientConfig, LnApi, LnError};
use tokio::fs;
use tracing::debug;

/// Pays a BOLT-11 invoice from a Core Lightning node.
///
/// Usage: cargo run --example pay_invoice -- --auth auth.json --invoice <bolt11>
///        [--amount-msat <n>] [--max-fee-percent <p>] [--retry-for <secs>]
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .try_init();
    let args: Vec<String> = std::env::args().collect();

    let path = flag_value(&args, "--auth").unwrap_or_else(|| "auth.json".to_string());
    let auth: Auth = serde_json::from_slice(&fs::read(&path).await?)?;
    let bolt11 = flag_value(&args, "--invoice").ok_or("--invoice is required")?;
    let payment = PayInvoice {
        bolt11,
        amount_msat: flag_value(&args, "--amount-msat").map(|v| v.parse()).transpose()?,
        max_fee_percent: flag_value(&args, "--max-fee-percent")
            .map(|v| v.parse())
            .transpose()?,
        retry_for: flag_value(&args, "--retry-for")
            .map(|v| v.parse().map(Duration::from_secs))
            .transpose()?,
    };
    debug!(?payment, "paying");

    let node = init_backend_with_config("core_lightning", auth, ClientConfig::default())?;
    let decoded = node.decode(&payment.bolt11).await?;
    if !decoded.valid {
        return Err(format!("node rejected the invoice as invalid ({})", decoded.kind).into());
    }

    match node.pay_invoice(payment).await {
        Ok(paid) => {
            println!("paid {} (fee {} msat)", paid.amount_msat, paid.fee_msat());
            println!("preimage: {}", paid.payment_preimage);
        }
        Err(LnError::Node { code, message }) => {
            eprintln!("payment failed ({code}): {message}");
        }
        Err(e) => return Err(e.into()),
    }
    node.close().await;
    Ok(())
}

fn flag_value(args: &[String], flag: &str) -> Option<String> {
    args.windows(2)
        .find(|pair| pair[0] == flag)
        .map(|pair| pair[1].clone())
}

//! # hsmctl
//!
//! Operator tool for poking an HSM through the pooled client.
//!
//! ```text
//! hsmctl [--config FILE] health
//! hsmctl [--config FILE] status
//! hsmctl [--config FILE] send COMMAND
//! hsmctl [--config FILE] random LENGTH
//! ```
//!
//! Output is JSON on stdout; logs go to stderr (`RUST_LOG`, default `info`).

use std::env;

use anyhow::{bail, Context, Result};
use hsm_client::{ClientConfig, HsmClient};
use serde_json::json;
use tracing_subscriber::EnvFilter;

const USAGE: &str = "usage: hsmctl [--config FILE] <health|status|send COMMAND|random LENGTH>";

fn main() -> Result<()> {
    init_logging();

    let mut args: Vec<String> = env::args().skip(1).collect();
    let config = match args.iter().position(|arg| arg == "--config") {
        Some(idx) => {
            let path = args.get(idx + 1).cloned().context(USAGE)?;
            args.drain(idx..=idx + 1);
            ClientConfig::from_json_file(&path)
                .with_context(|| format!("loading config from {}", path))?
        }
        None => ClientConfig::default(),
    };

    let mut args = args.into_iter();
    let command = args.next().context(USAGE)?;
    let client = HsmClient::connect(config).context("creating HSM client")?;

    let output = match command.as_str() {
        "health" => serde_json::to_value(client.health())?,
        "status" => serde_json::to_value(client.pool_status())?,
        "send" => {
            let payload = args.next().context(USAGE)?;
            let response = client.send_command(&payload)?;
            let fields = response.fields();
            json!({
                "response": response.as_str(),
                "header": response.header(),
                "response_code": fields.map(|f| f.response_code),
                "error_code": fields.map(|f| f.error_code),
            })
        }
        "random" => {
            let length: usize = args
                .next()
                .context(USAGE)?
                .parse()
                .context("LENGTH must be a number")?;
            json!({ "random": client.generate_random_hex(length)? })
        }
        other => bail!("unknown command {:?}\n{}", other, USAGE),
    };

    println!("{}", serde_json::to_string_pretty(&output)?);
    client.shutdown();
    Ok(())
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

// Load driver CLI: pick a mode, read the load configuration, run the driver.
use anyhow::{Context, Result};
use clap::{ArgGroup, Parser};
use std::path::PathBuf;
use surge_driver::{Driver, DriverConfig, Mode};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "loadgen")]
#[command(about = "Synthetic workload driver for a time-series database")]
#[command(group(ArgGroup::new("mode").required(true)))]
struct Args {
    /// Insert generated samples into every configured stream
    #[arg(short = 'i', long = "insert", group = "mode")]
    insert: bool,

    /// Query the samples back without checking them
    #[arg(short = 'q', long = "query", group = "mode")]
    query: bool,

    /// Query the samples back and verify them against the generator
    #[arg(short = 'v', long = "verify", group = "mode")]
    verify: bool,

    /// Delete every configured stream's time range
    #[arg(short = 'd', long = "delete", group = "mode")]
    delete: bool,

    /// Path to the load configuration file
    #[arg(long, default_value = "load.yml")]
    config: PathBuf,
}

impl Args {
    fn mode(&self) -> Mode {
        if self.insert {
            Mode::Insert
        } else if self.query {
            Mode::Query
        } else if self.verify {
            Mode::QueryVerify
        } else {
            Mode::Delete
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let mode = args.mode();
    info!(?mode, config = %args.config.display(), "starting load driver");

    let contents = std::fs::read_to_string(&args.config)
        .with_context(|| format!("read {}", args.config.display()))?;
    let config = DriverConfig::parse(&contents).context("parse load configuration")?;
    info!(
        streams = config.num_streams,
        servers = config.num_servers,
        connections = config.tcp_connections,
        "loaded configuration"
    );
    for uuid in &config.uuids {
        tracing::debug!(%uuid, "stream");
    }

    let driver = Driver::new(config, mode).context("resolve driver mode")?;
    let report = driver.run().await?;
    if !report.success() {
        std::process::exit(1);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exactly_one_mode_flag_is_required() {
        assert!(Args::try_parse_from(["loadgen"]).is_err());
        assert!(Args::try_parse_from(["loadgen", "-i", "-q"]).is_err());
        let args = Args::try_parse_from(["loadgen", "-v"]).expect("parse");
        assert_eq!(args.mode(), Mode::QueryVerify);
    }

    #[test]
    fn config_path_defaults_and_overrides() {
        let args = Args::try_parse_from(["loadgen", "-i"]).expect("parse");
        assert_eq!(args.config, PathBuf::from("load.yml"));
        let args =
            Args::try_parse_from(["loadgen", "-d", "--config", "/tmp/run.yml"]).expect("parse");
        assert_eq!(args.config, PathBuf::from("/tmp/run.yml"));
        assert_eq!(args.mode(), Mode::Delete);
    }
}

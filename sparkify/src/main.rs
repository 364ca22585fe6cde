use anyhow::Context;
use clap::{Arg, Command};
use common::config::Settings;
use sparkify::logging::init_logging;
use sparkify::services::OutputFormat;
use std::process;

const DEFAULT_CONFIG: &str = "config/sparkify.toml";

fn cli() -> Command {
    Command::new("sparkify-cli")
        .version("0.1.0")
        .about("Builds the Sparkify song-play star schema from raw event and song logs")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .global(true)
                .help("Sets a custom config file"),
        )
        .subcommand_required(true)
        .subcommand(Command::new("lake").about("Transform natively and write partitioned Parquet"))
        .subcommand(
            Command::new("warehouse").about("Stage raw data and load the star schema with SQL"),
        )
        .subcommand(
            Command::new("query")
                .about("Run SQL against the loaded tables")
                .arg(
                    Arg::new("sql")
                        .long("sql")
                        .value_name("SQL")
                        .required(true)
                        .help("Query to execute"),
                )
                .arg(
                    Arg::new("format")
                        .long("format")
                        .value_name("FORMAT")
                        .value_parser(["table", "json"])
                        .default_value("table")
                        .help("Output format"),
                ),
        )
}

async fn run() -> anyhow::Result<()> {
    let matches = cli().get_matches();
    let config_path = matches
        .get_one::<String>("config")
        .map(|s| s.as_str())
        .unwrap_or(DEFAULT_CONFIG);

    let settings = Settings::new(config_path)
        .with_context(|| format!("Failed to load config from {}", config_path))?;
    init_logging(&settings.logging)?;

    match matches.subcommand() {
        Some(("lake", _)) => {
            sparkify::run_lake_pipeline(&settings)
                .await
                .context("Lake pipeline failed")?;
        }
        Some(("warehouse", _)) => {
            sparkify::run_warehouse_pipeline(&settings)
                .await
                .context("Warehouse pipeline failed")?;
        }
        Some(("query", query_matches)) => {
            let sql = query_matches
                .get_one::<String>("sql")
                .context("--sql is required")?;
            let format: OutputFormat = query_matches
                .get_one::<String>("format")
                .map(|s| s.parse())
                .transpose()?
                .unwrap_or_default();
            let output = sparkify::run_query(&settings, sql, format).await?;
            println!("{}", output);
        }
        _ => unreachable!("a subcommand is required"),
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("Error: {:#}", e);
        process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_is_well_formed() {
        cli().debug_assert();
    }

    #[test]
    fn test_query_requires_sql() {
        assert!(cli().try_get_matches_from(["sparkify-cli", "query"]).is_err());
        let matches = cli()
            .try_get_matches_from(["sparkify-cli", "-c", "x.toml", "query", "--sql", "SELECT 1", "--format", "json"])
            .unwrap();
        assert_eq!(matches.get_one::<String>("config").map(String::as_str), Some("x.toml"));
    }
}

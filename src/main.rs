//! toolhub CLI
//!
//! Aggregates the configured MCP servers, then lists their tools or calls one.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;

use toolhub::config::{find_config_path, load_config};
use toolhub::mcp_client::{Aggregator, SessionRetention};

#[derive(Parser)]
#[command(name = "toolhub", version)]
#[command(about = "Aggregate tools from MCP servers into one registry", long_about = None)]
struct Cli {
    /// Path to servers.yaml (defaults to $TOOLHUB_CONFIG, then the user config dir)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print every tool in OpenAI function format, with the aggregation report
    List {
        /// Print only the aggregation report
        #[arg(long)]
        report_only: bool,
    },
    /// Invoke one tool and print its result
    Call {
        /// Published tool name
        tool: String,
        /// Arguments as a JSON object
        #[arg(default_value = "{}")]
        arguments: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    toolhub::init_tracing();
    let cli = Cli::parse();

    let path = find_config_path(cli.config.as_deref())?;
    let config = load_config(&path)?;
    let mut options = config.aggregation_options();

    match cli.command {
        Commands::List { report_only } => {
            options.retention = SessionRetention::CloseAfterDiscovery;
            let aggregation = Aggregator::new(options).run(&config.servers).await?;

            let output = if report_only {
                serde_json::to_value(&aggregation.report)?
            } else {
                serde_json::json!({
                    "tools": aggregation.registry.to_openai_tools(),
                    "report": aggregation.report,
                })
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
            Ok(())
        }
        Commands::Call { tool, arguments } => {
            let arguments: Value = serde_json::from_str(&arguments)
                .context("tool arguments must be valid JSON")?;

            let aggregation = Aggregator::new(options).run(&config.servers).await?;
            let outcome = aggregation.registry.invoke(&tool, arguments).await;
            aggregation.shutdown().await;

            let result = outcome?;
            println!("{}", serde_json::to_string_pretty(&result)?);
            if !result.success {
                bail!("tool '{tool}' reported an error");
            }
            Ok(())
        }
    }
}

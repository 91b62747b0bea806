use std::path::Path;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use tracing::info;

use request_auth::agent::config::Config;
use request_auth::agent::credential::AgentKey;
use request_auth::client::ApiClient;
use request_auth::comms::local_api;
use request_auth::utils;

#[derive(Parser)]
#[command(name = "request-auth", version, about = "Request authentication client and challenge server")]
struct AppCli {
    /// Config file path
    #[arg(short, long, default_value = "config.json", global = true)]
    config: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the challenge server
    Serve {
        #[arg(long, default_value_t = 8080)]
        port: u16,
    },
    /// Write a fresh agent keyfile
    Keygen {
        #[arg(long, default_value = "agent.json")]
        out: String,
    },
    /// Run one decorated call and print the envelope
    Call {
        reducer_path: String,
        operation: String,
        /// JSON request body
        #[arg(long)]
        body: Option<String>,
    },
}

// A missing config file is not an error; defaults plus env apply.
fn load_config(path: &str) -> Result<Config> {
    if Path::new(path).exists() {
        Config::from_file(path)
    } else {
        info!(path, "config file not found, using defaults");
        Ok(Config::default().with_env())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    utils::logging::init();

    let args = AppCli::parse();
    match args.command {
        Commands::Serve { port } => {
            let config = load_config(&args.config)?;
            info!("Starting challenge server on port {port}");
            local_api::serve(config, port).await?;
        }
        Commands::Keygen { out } => {
            let key = AgentKey::generate();
            key.save(&out)?;
            info!(credential_id = %key.credential_id, path = %out, "agent keyfile written");
            println!("{}", serde_json::to_string_pretty(&key.credential())?);
        }
        Commands::Call {
            reducer_path,
            operation,
            body,
        } => {
            let config = load_config(&args.config)?;
            let body = body
                .map(|raw| serde_json::from_str::<Value>(&raw))
                .transpose()
                .context("parsing --body as JSON")?;

            let client = ApiClient::from_config(&config)?;
            if let Some(url) = &config.system_url {
                client.load_system(url, true).await?;
            }
            let envelope = client.call(&reducer_path, &operation, body).await?;
            println!("{}", serde_json::to_string_pretty(&envelope)?);
        }
    }

    Ok(())
}

//! Command-line interface parsing and handling
//!
//! `serve` (the default) runs the chat server; `seal` turns a provider API
//! key read from stdin into the value stored in the credential cookie.

use std::error::Error;
use std::io::{self, BufRead};
use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::core::config::Config;
use crate::core::credentials::SealedKeyCipher;

const LONG_VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    " (",
    env!("VERGEN_GIT_DESCRIBE"),
    ")"
);

#[derive(Parser)]
#[command(name = "chatwire")]
#[command(version, long_version = LONG_VERSION)]
#[command(about = "Chat backend that streams OpenRouter completions with MCP tools")]
#[command(
    long_about = "Chatwire serves POST /api/chat. Each turn connects to the MCP servers listed \
in the request, offers their tools to the model, and streams the answer back as \
server-sent events.\n\n\
Environment Variables:\n\
  CHATWIRE_COOKIE_SECRET          Secret used to seal the provider key cookie (required)\n\
  CHATWIRE_BIND                   Listen address (overrides the config file)\n\
  CHATWIRE_OPENROUTER_BASE_URL    Upstream base URL (overrides the config file)\n\
  RUST_LOG                        Log filter (defaults to info)"
)]
pub struct Args {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Path to the TOML config file
    #[arg(short = 'c', long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the chat server (default)
    Serve {
        /// Address to listen on, e.g. 127.0.0.1:8787
        #[arg(short = 'b', long)]
        bind: Option<String>,
    },
    /// Seal an API key read from stdin into a cookie value
    Seal,
}

pub fn main() -> Result<(), Box<dyn Error>> {
    tokio::runtime::Runtime::new()?.block_on(async_main())
}

async fn async_main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();
    let mut config = Config::load(args.config.as_deref())?;

    match args.command.unwrap_or(Commands::Serve { bind: None }) {
        Commands::Serve { bind } => {
            init_tracing();
            if let Some(bind) = bind {
                config.bind = bind;
            }
            crate::server::serve(config).await
        }
        Commands::Seal => {
            let secret = config
                .cookie_secret(|name| std::env::var(name).ok())
                .ok_or_else(|| format!("{} is not set", config.credentials.secret_env))?;
            let mut line = String::new();
            io::stdin().lock().read_line(&mut line)?;
            let api_key = line.trim();
            if api_key.is_empty() {
                return Err("no API key on stdin".into());
            }
            println!("{}", SealedKeyCipher.seal(api_key, &secret)?);
            Ok(())
        }
    }
}

fn init_tracing() {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .try_init();
}

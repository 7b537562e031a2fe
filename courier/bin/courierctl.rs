//! Command-line utility for operating a courier relay
//!
//! - Admin API calls against a running relay (snapshot, dead letters,
//!   requeue, forcing provider circuits)
//! - Hashing admin tokens for the configuration file
//! - Generating DKIM key pairs and the matching DNS record

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use courier_control::{ControlClient, hash_token};
use courier_delivery::CircuitCommand;

/// Command-line utility for operating a courier relay
#[derive(Parser, Debug)]
#[command(name = "courierctl")]
#[command(about = "Operate a courier mail relay", long_about = None)]
#[command(version)]
struct Cli {
    /// Base URL of the relay's HTTP listener
    #[arg(short, long, default_value = "http://127.0.0.1:8080", env = "COURIER_URL")]
    url: String,

    /// Admin bearer token
    #[arg(short, long, env = "COURIER_ADMIN_TOKEN", hide_env_values = true)]
    token: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Queue depth, provider circuits and the rolling success rate
    Snapshot,
    /// Dead letter management
    DeadLetters {
        #[command(subcommand)]
        action: DeadLetterAction,
    },
    /// Force a provider circuit open or closed
    Circuit {
        /// Provider name
        provider: String,
        #[arg(value_enum)]
        state: CircuitArg,
    },
    /// Print the SHA-256 hash of an admin token, for the `admin.tokens` config
    HashToken {
        token: String,
    },
    /// Generate a DKIM key pair and print the DNS TXT record
    DkimKeygen {
        #[arg(long)]
        domain: String,
        #[arg(long, default_value = "mail")]
        selector: String,
        /// Keys are written under `{dir}/{domain}/`
        #[arg(long, default_value = "keys")]
        dir: PathBuf,
        #[arg(long, default_value = "2048")]
        bits: usize,
    },
}

#[derive(Subcommand, Debug)]
enum DeadLetterAction {
    /// List dead letters
    List,
    /// Put one dead letter back in the queue
    Requeue {
        /// Message ID to requeue
        message_id: String,
    },
    /// Put every dead letter back in the queue
    RequeueAll,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum CircuitArg {
    Open,
    Closed,
}

impl From<CircuitArg> for CircuitCommand {
    fn from(arg: CircuitArg) -> Self {
        match arg {
            CircuitArg::Open => Self::Open,
            CircuitArg::Closed => Self::Closed,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();

    let client = || {
        let client = ControlClient::new(cli.url.clone());
        match &cli.token {
            Some(token) => client.with_token(token.clone()),
            None => client,
        }
    };

    let response = match &cli.command {
        Commands::Snapshot => client().snapshot().await?,
        Commands::DeadLetters { action } => match action {
            DeadLetterAction::List => client().dead_letters().await?,
            DeadLetterAction::Requeue { message_id } => client().requeue(message_id).await?,
            DeadLetterAction::RequeueAll => client().requeue_all().await?,
        },
        Commands::Circuit { provider, state } => {
            client().set_circuit(provider, (*state).into()).await?
        }
        Commands::HashToken { token } => {
            println!("{}", hash_token(token));
            return Ok(());
        }
        Commands::DkimKeygen {
            domain,
            selector,
            dir,
            bits,
        } => {
            let generated = courier_dkim::generate_key(dir, domain, selector, *bits)?;
            println!("Private key: {}", generated.private_key_path.display());
            println!("Public key:  {}", generated.public_key_path.display());
            println!();
            println!("Publish this TXT record at {selector}._domainkey.{domain}:");
            println!("{}", generated.dns_record);
            return Ok(());
        }
    };

    println!("{}", serde_json::to_string_pretty(&response)?);
    Ok(())
}

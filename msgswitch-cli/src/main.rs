//! msgswitch-cli - Command-line interface for the message switch
//!
//! Inspects and administers a broker, and calls services from the shell.

mod commands;

use clap::{Parser, Subcommand, ValueEnum};
use colored::Colorize;
use msgswitch_client::{BrokerTransport, Client, ClientConfig};
use msgswitch_protocol::{QueueFilter, DEFAULT_UNIX_SOCKET};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Long-poll timeout used by `tail --follow`.
const FOLLOW_POLL_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Parser)]
#[command(name = "msgswitch-cli")]
#[command(about = "Command-line interface for the msgswitch message broker")]
#[command(version)]
struct Cli {
    /// Broker address (host:port or unix:/path)
    #[arg(short, long, env = "MSGSWITCH_ENDPOINT", default_value_t = format!("unix:{DEFAULT_UNIX_SOCKET}"))]
    endpoint: String,

    /// Identity token presented at login
    #[arg(short = 't', long, env = "MSGSWITCH_TOKEN")]
    token: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum Filter {
    All,
    Persistent,
    Transient,
}

impl From<Filter> for QueueFilter {
    fn from(filter: Filter) -> Self {
        match filter {
            Filter::All => QueueFilter::All,
            Filter::Persistent => QueueFilter::Persistent,
            Filter::Transient => QueueFilter::Transient,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// List queues
    List {
        /// Only queues whose name starts with this prefix
        #[arg(short, long, default_value = "")]
        prefix: String,

        /// Kind of queues to list
        #[arg(short, long, value_enum, default_value = "all")]
        filter: Filter,
    },

    /// Show broker state and queue contents
    Diagnostics,

    /// Print the broker's event trace
    Tail {
        /// Keep printing new events until interrupted
        #[arg(short, long)]
        follow: bool,
    },

    /// Acknowledge a message
    Ack {
        /// Queue holding the message
        queue: String,

        /// Sequence number of the message
        seq: i64,
    },

    /// Destroy a queue and its contents
    Destroy {
        /// Queue name
        queue: String,
    },

    /// Send a request to a service queue and print the response
    Call {
        /// Service queue
        queue: String,

        /// Request body (read from stdin when neither --body nor --file is given)
        #[arg(short, long, conflicts_with = "file")]
        body: Option<String>,

        /// Read the request body from a file
        #[arg(short, long)]
        file: Option<PathBuf>,

        /// Seconds to wait for the response
        #[arg(long)]
        timeout: Option<u64>,
    },

    /// Ask the broker to shut down
    Shutdown,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();

    let mut config = ClientConfig::new(&cli.endpoint).with_ensure_queue(false);
    if let Some(ref token) = cli.token {
        config = config.with_token(token);
    }
    let client = Client::connect(Arc::new(BrokerTransport::new()), config)
        .await
        .map_err(|e| {
            eprintln!("{}: {}", "Connection failed".red(), e);
            e
        })?;

    match cli.command {
        Commands::Tail { follow: true } => {
            eprintln!("{}", "Press Ctrl+C to stop...".dimmed());
            let mut from = None;
            loop {
                tokio::select! {
                    events = client.trace(from, FOLLOW_POLL_TIMEOUT) => {
                        match events {
                            Ok(events) => {
                                for event in &events {
                                    println!("{}", commands::format_event(event));
                                }
                                if let Some(last) = events.last() {
                                    from = Some(last.id);
                                }
                            }
                            Err(e) => {
                                eprintln!("{}: {}", "Error".red(), e);
                                std::process::exit(1);
                            }
                        }
                    }
                    _ = tokio::signal::ctrl_c() => {
                        eprintln!("\n{}", "Stopping...".dimmed());
                        break;
                    }
                }
            }
        }
        cmd => match commands::execute(&client, cmd).await {
            Ok(output) => {
                println!("{}", output);
            }
            Err(e) => {
                eprintln!("{}: {}", "Error".red(), e);
                client.disconnect().await;
                std::process::exit(1);
            }
        },
    }

    client.disconnect().await;
    Ok(())
}

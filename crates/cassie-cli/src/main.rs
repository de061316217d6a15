//! Cassie Command-Line Client
//!
//! Runs CQL statements against a Cassandra-compatible cluster, either one
//! at a time, from a script, or interactively.

mod commands;
mod completer;
mod executor;
mod formatter;
mod repl;

use cassie_client::{ClientConfig, ExecutionOptions, Session};
use cassie_proto::{Compression, Consistency, ProtocolVersion};
use clap::Parser;
use formatter::OutputFormat;
use std::path::PathBuf;
use std::time::Duration;

/// Cassie Command-Line Client
#[derive(Parser, Debug)]
#[command(name = "cassie")]
#[command(version, about = "Command-line client for Cassandra-compatible databases")]
pub struct Args {
    /// Contact points, as host or host:port
    #[arg(short = 'H', long = "host", default_value = "127.0.0.1", value_delimiter = ',')]
    pub hosts: Vec<String>,

    /// Port for contact points given without one
    #[arg(short = 'P', long, default_value_t = 9042)]
    pub port: u16,

    /// Keyspace to use on every connection
    #[arg(short = 'k', long)]
    pub keyspace: Option<String>,

    /// Username for password authentication
    #[arg(short = 'u', long, requires = "password")]
    pub username: Option<String>,

    /// Password for password authentication
    #[arg(short = 'p', long, requires = "username")]
    pub password: Option<String>,

    /// Execute a single statement and exit
    #[arg(short = 'e', long)]
    pub execute: Option<String>,

    /// Execute statements from file
    #[arg(short = 'f', long)]
    pub file: Option<PathBuf>,

    /// Output format
    #[arg(long, default_value = "table", value_enum)]
    pub format: OutputFormat,

    /// Consistency level
    #[arg(long, default_value = "ONE")]
    pub consistency: Consistency,

    /// Rows per page; 0 disables paging
    #[arg(long, default_value_t = 5000)]
    pub page_size: i32,

    /// Highest protocol version to try
    #[arg(long, default_value_t = 4, value_parser = clap::value_parser!(u8).range(2..=4))]
    pub protocol_version: u8,

    /// Frame compression (lz4)
    #[arg(long)]
    pub compression: Option<Compression>,

    /// Connection timeout in seconds
    #[arg(long, default_value_t = 5)]
    pub connect_timeout: u64,

    /// Request timeout in seconds
    #[arg(long, default_value_t = 12)]
    pub timeout: u64,
}

impl Args {
    fn client_config(&self) -> Result<ClientConfig, Box<dyn std::error::Error>> {
        let mut config = ClientConfig::new(self.hosts.iter().cloned())
            .with_port(self.port)
            .with_protocol_version(ProtocolVersion::from_byte(self.protocol_version)?)
            .with_compression(self.compression)
            .with_connect_timeout(Duration::from_secs(self.connect_timeout))
            .with_execution_options(self.execution_options());

        if let (Some(username), Some(password)) = (&self.username, &self.password) {
            config = config.with_credentials(username.clone(), password.clone());
        }
        if let Some(keyspace) = &self.keyspace {
            config = config.with_keyspace(keyspace.clone());
        }
        Ok(config)
    }

    fn execution_options(&self) -> ExecutionOptions {
        let page_size = (self.page_size > 0).then_some(self.page_size);
        ExecutionOptions::new()
            .with_consistency(self.consistency)
            .with_page_size(page_size)
            .with_timeout(Some(Duration::from_secs(self.timeout)))
    }
}

#[tokio::main]
async fn main() {
    // Initialize tracing
    let mut filter = tracing_subscriber::EnvFilter::from_default_env();
    if let Ok(directive) = "cassie_cli=info".parse() {
        filter = filter.add_directive(directive);
    }
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let result = run(args).await;

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let config = args.client_config()?;
    let options = args.execution_options();

    // Read the script before connecting so a bad path fails fast.
    let script = match &args.file {
        Some(file) => Some(executor::read_script(file)?),
        None => None,
    };

    let session = Session::connect(config).await?;
    tracing::info!(
        version = %session.protocol_version(),
        connections = session.pool().connection_count(),
        "connected"
    );

    if let Some(statement) = &args.execute {
        // Command mode: execute single statement and exit
        run_statements(&session, &[statement.clone()], &options, args.format, true).await
    } else if let Some(statements) = script {
        // Script mode: keep going past failed statements
        run_statements(&session, &statements, &options, args.format, false).await
    } else {
        repl::run(session, options, args.format).await
    }
}

/// Execute statements in order and print their output.
///
/// With `stop_on_error` the first failure ends the run with an error;
/// otherwise failures are reported and the next statement runs.
async fn run_statements(
    session: &Session,
    statements: &[String],
    options: &ExecutionOptions,
    format: OutputFormat,
    stop_on_error: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let formatter = formatter::create_formatter(format);
    let mut failed = 0usize;

    for statement in statements {
        match executor::execute(session, statement, options, true, &*formatter).await {
            Ok(output) => {
                if !output.is_empty() {
                    println!("{}", output);
                }
            }
            Err(e) if stop_on_error => {
                session.close().await;
                return Err(e.into());
            }
            Err(e) => {
                failed += 1;
                eprintln!(
                    "{}",
                    formatter.format_error(&format!("executing '{}': {}", statement, e))
                );
            }
        }
    }

    session.close().await;
    if failed > 0 {
        return Err(format!("{} of {} statements failed", failed, statements.len()).into());
    }
    Ok(())
}

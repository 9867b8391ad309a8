//! qipc - run queries against q services
//!
//! Each port gets a worker that takes queries from a shared queue and runs
//! every query on a fresh connection.

use bytes::Bytes;
use clap::Parser;
use colored::Colorize;
use qipc_client::{Connection, ConnectionConfig, TlsClientConfig};
use qipc_protocol::{Options, Payload, RawCodec, TextEncoding};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "qipc")]
#[command(about = "Send queries to q services over the IPC protocol")]
#[command(version)]
struct Cli {
    /// Service host
    #[arg(short = 'H', long, env = "QIPC_HOST", default_value = "localhost")]
    host: String,

    /// Service port; repeat to spread queries over several services
    #[arg(short, long = "port", default_value = "5000")]
    ports: Vec<u16>,

    /// Username for the handshake
    #[arg(short, long, env = "QIPC_USER")]
    user: Option<String>,

    /// Password for the handshake
    #[arg(long, env = "QIPC_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Send queries as ASYNC messages and skip waiting for replies
    #[arg(long = "async")]
    fire_and_forget: bool,

    /// Encode text as UTF-8 instead of Latin-1
    #[arg(long)]
    utf8: bool,

    /// Per-request timeout in milliseconds
    #[arg(long)]
    timeout_ms: Option<u64>,

    // ===== TLS Options =====
    /// Enable TLS connection
    #[arg(long, env = "QIPC_TLS")]
    tls: bool,

    /// Path to CA certificate for server verification
    #[arg(long, env = "QIPC_CA_CERT")]
    ca_cert: Option<PathBuf>,

    /// Server name for TLS SNI (defaults to the host)
    #[arg(long)]
    server_name: Option<String>,

    /// Query expressions to run
    #[arg(required = true)]
    queries: Vec<String>,
}

impl Cli {
    fn connection_config(&self, base: &ConnectionConfig, port: u16) -> ConnectionConfig {
        let mut config = base.clone();
        config.host = Some(self.host.clone());
        config.port = port;
        if let Some(ref user) = self.user {
            config.username = Some(user.clone());
        }
        if let Some(ref password) = self.password {
            config.password = Some(password.clone());
        }
        if self.utf8 {
            config = config.with_encoding(TextEncoding::Utf8);
        }
        if let Some(ms) = self.timeout_ms {
            config = config.with_request_timeout(Duration::from_millis(ms));
        }
        if self.tls {
            let mut tls = TlsClientConfig::new();
            if let Some(ref path) = self.ca_cert {
                tls = tls.with_ca_cert(path);
            }
            if let Some(ref name) = self.server_name {
                tls = tls.with_server_name(name);
            }
            config = config.with_tls(tls);
        }
        config
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let base = ConnectionConfig::load()?;

    tracing::info!(
        "Running {} quer{} against {} on {} port(s)",
        cli.queries.len(),
        if cli.queries.len() == 1 { "y" } else { "ies" },
        cli.host,
        cli.ports.len()
    );
    let started = Instant::now();
    let queue = Arc::new(Mutex::new(cli.queries.iter().cloned().collect::<VecDeque<_>>()));

    let mut workers = Vec::with_capacity(cli.ports.len());
    for &port in &cli.ports {
        let config = cli.connection_config(&base, port);
        let queue = queue.clone();
        let fire_and_forget = cli.fire_and_forget;
        workers.push(tokio::spawn(async move {
            let mut failures = 0usize;
            loop {
                let Some(query) = queue.lock().await.pop_front() else {
                    break;
                };
                if let Err(e) = run_query(&config, &query, fire_and_forget).await {
                    eprintln!("{} [port {}] {}: {}", "Error".red(), port, query, e);
                    failures += 1;
                }
            }
            failures
        }));
    }

    let mut failures = 0;
    for worker in workers {
        failures += worker.await?;
    }

    println!(
        "{} {:.3}s",
        "Total duration:".bold(),
        started.elapsed().as_secs_f64()
    );
    if failures > 0 {
        return Err(format!("{} of {} queries failed", failures, cli.queries.len()).into());
    }
    Ok(())
}

async fn run_query(
    config: &ConnectionConfig,
    query: &str,
    fire_and_forget: bool,
) -> Result<(), qipc_client::ClientError> {
    let started = Instant::now();
    let port = config.port;
    let conn = Connection::new(config.clone());
    conn.open().await?;

    println!(
        "{} IPC version: {}. Port: {} Is connected: {}",
        "Initialised".green(),
        conn.protocol_version().unwrap_or_default(),
        port,
        conn.is_connected()
    );

    let expr = conn.string(query)?;
    let result = if fire_and_forget {
        conn.send_async(&expr, &[], &Options::new()).await.map(|_| {
            println!("[port {}] {} sent", port, query);
        })
    } else {
        conn.send_sync(&expr, &[], &Options::raw())
            .await
            .map(|reply| print_reply(port, query, reply, config.encoding))
    };

    conn.close().await;
    println!(
        "[port {}] Closed. Duration: {:.3}s",
        port,
        started.elapsed().as_secs_f64()
    );
    result
}

fn print_reply(port: u16, query: &str, reply: Payload<Bytes>, encoding: TextEncoding) {
    let Some(bytes) = reply.into_raw() else {
        return;
    };
    match RawCodec::error_text(&bytes, encoding) {
        Some(text) => println!("[port {}] {} returned error: {}", port, query, text.red()),
        None => println!("[port {}] {} returned {}", port, query, hex::encode(&bytes)),
    }
}


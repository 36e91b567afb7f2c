use std::io::{self, BufRead, BufWriter, Write};
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use log::info;

use feedwire::core::{steady_clock_us, system_clock_us, End, Entry, RequesterConfig, ResponderConfig};
use feedwire::ipc::{Requester, Responder};

#[derive(Parser)]
#[command(name = "feedwire-cli", version, about = "Serve and query timed topic buffers")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a responder until stdin closes (with --feed) or forever.
    Serve {
        /// JSON responder config; overrides --endpoint and --topic
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long, default_value = "tcp://*:5555")]
        endpoint: String,
        #[arg(long, default_value = "feedwire")]
        name: String,
        /// Topic to register, as NAME=SECONDS. Repeatable.
        #[arg(long = "topic", value_parser = parse_topic)]
        topics: Vec<(String, f64)>,
        /// Store each stdin line as an entry of this topic
        #[arg(long)]
        feed: Option<String>,
        /// Answer REQUEST_WITH_DATA by echoing the payload back
        #[arg(long)]
        echo: bool,
        /// Seconds between topic status log lines
        #[arg(long, default_value_t = 10)]
        status_interval: u64,
    },
    /// Read entries without removing them.
    Peek(RetrieveArgs),
    /// Read and remove entries.
    Pop(RetrieveArgs),
    /// Send a payload to the responder's request handler.
    Call {
        endpoint: String,
        topic: String,
        payload: String,
        #[arg(long)]
        timeout_ms: Option<u64>,
    },
    /// Print the local clock readings used for resynchronization.
    Clock,
}

#[derive(clap::Args)]
struct RetrieveArgs {
    endpoint: String,
    topic: String,
    /// `earliest` or `latest`
    #[arg(long, default_value = "latest")]
    end: End,
    /// Number of entries; negative means all
    #[arg(short = 'n', long, default_value_t = 1, allow_negative_numbers = true)]
    count: i32,
    #[arg(long)]
    timeout_ms: Option<u64>,
    /// Print payloads as hex instead of text
    #[arg(long)]
    hex: bool,
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();
    match cli.command {
        Commands::Serve {
            config,
            endpoint,
            name,
            topics,
            feed,
            echo,
            status_interval,
        } => {
            let config = match config {
                Some(path) => ResponderConfig::from_json_file(&path)
                    .with_context(|| format!("failed to load {}", path.display()))?,
                None => {
                    let mut config = ResponderConfig::new(endpoint);
                    config.name = name;
                    for (topic, window) in topics {
                        config = config.with_topic(topic, window);
                    }
                    config
                }
            };
            cmd_serve(&config, feed, echo, Duration::from_secs(status_interval.max(1)))
        }
        Commands::Peek(args) => cmd_retrieve(args, false),
        Commands::Pop(args) => cmd_retrieve(args, true),
        Commands::Call {
            endpoint,
            topic,
            payload,
            timeout_ms,
        } => {
            let mut requester = connect(&endpoint, timeout_ms)?;
            let reply = requester
                .request_with_data(&topic, payload.as_bytes())
                .with_context(|| format!("request to {endpoint} failed"))?;
            println!("{}", String::from_utf8_lossy(&reply));
            Ok(())
        }
        Commands::Clock => {
            println!("system_us\t{}", system_clock_us());
            println!("steady_us\t{}", steady_clock_us());
            Ok(())
        }
    }
}

fn parse_topic(value: &str) -> std::result::Result<(String, f64), String> {
    let (name, window) = value
        .split_once('=')
        .ok_or_else(|| format!("expected NAME=SECONDS, got `{value}`"))?;
    let window: f64 = window
        .parse()
        .map_err(|err| format!("bad retention window `{window}`: {err}"))?;
    Ok((name.to_string(), window))
}

fn cmd_serve(
    config: &ResponderConfig,
    feed: Option<String>,
    echo: bool,
    status_interval: Duration,
) -> Result<()> {
    let responder = Responder::from_config(config)
        .with_context(|| format!("failed to start responder on {}", config.endpoint))?;
    if echo {
        responder.set_handler(|payload: &[u8]| payload.to_vec())?;
    }

    if let Some(topic) = feed {
        if !responder.topic_names()?.contains(&topic) {
            bail!("--feed topic `{topic}` is not registered; add it with --topic");
        }
        info!("feeding `{topic}` from stdin");
        for line in io::stdin().lock().lines() {
            let line = line.context("failed to read stdin")?;
            responder.put(&topic, line.into_bytes())?;
        }
        info!("stdin closed; shutting down");
        return Ok(());
    }

    loop {
        thread::sleep(status_interval);
        let mut status: Vec<(String, usize)> = responder.topic_status()?.into_iter().collect();
        status.sort();
        info!("[{}] topic status: {status:?}", responder.name());
    }
}

fn connect(endpoint: &str, timeout_ms: Option<u64>) -> Result<Requester> {
    let mut config = RequesterConfig::new(endpoint);
    config.timeout_ms = timeout_ms;
    Requester::from_config(&config).with_context(|| format!("bad endpoint {endpoint}"))
}

fn cmd_retrieve(args: RetrieveArgs, remove: bool) -> Result<()> {
    let mut requester = connect(&args.endpoint, args.timeout_ms)?;
    let entries = if remove {
        requester.pop(&args.topic, args.end, args.count)
    } else {
        requester.peek(&args.topic, args.end, args.count)
    }
    .with_context(|| format!("request to {} failed", args.endpoint))?;

    let mut out = BufWriter::new(io::stdout());
    for entry in &entries {
        write_entry(&mut out, entry, args.hex)?;
    }
    out.flush()?;
    Ok(())
}

fn write_entry(out: &mut dyn Write, entry: &Entry, hex: bool) -> io::Result<()> {
    write!(out, "{:.6}\t{}\t", entry.timestamp, entry.payload.len())?;
    if hex {
        for byte in entry.payload.iter() {
            write!(out, "{byte:02x}")?;
        }
        writeln!(out)
    } else {
        writeln!(out, "{}", String::from_utf8_lossy(&entry.payload))
    }
}

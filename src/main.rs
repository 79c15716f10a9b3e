//! Tag forwarder command line entry point

use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use tag_forwarder::config::ForwarderConfig;
use tag_forwarder::observability::{init_default_logging, init_logging, LogFormat};
use tag_forwarder::protocol::{encode_event, hexdump, MessageEncoding, TagEvent, TagRecord};
use tag_forwarder::session::{ForwardingResult, Session};
use tokio::sync::mpsc;
use tracing::{error, info, warn, Level};

/// Forward tag events to an MQTT broker
#[derive(Parser)]
#[command(name = "tag-forwarder")]
#[command(about = "Forward tag events to an MQTT broker")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", env = "TAG_FORWARDER_CONFIG")]
    config: Option<PathBuf>,

    /// Verbose logging (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Forward one tag event and wait for the cycle to finish
    Forward {
        #[command(flatten)]
        input: EventInput,

        /// Topic to publish to instead of the configured default
        #[arg(short, long)]
        topic: Option<String>,

        /// Wait for a reply on the configured response topic
        #[arg(long)]
        reply: bool,
    },
    /// Print the payload an event would be published with
    Encode {
        #[command(flatten)]
        input: EventInput,

        /// Encoding to use instead of the configured one
        #[arg(short, long)]
        encoding: Option<MessageEncoding>,
    },
    /// Validate configuration
    Config {
        /// Show current configuration
        #[arg(long)]
        show: bool,
    },
}

/// Where the tag event comes from
#[derive(Args)]
struct EventInput {
    /// JSON tag event file
    #[arg(long, value_name = "FILE", conflicts_with_all = ["tag_id", "text"])]
    event: Option<PathBuf>,

    /// Bare tag identifier as hex, e.g. 5b42
    #[arg(long, value_name = "HEX", conflicts_with = "text")]
    tag_id: Option<String>,

    /// Language code for text records
    #[arg(long, default_value = "en")]
    lang: String,

    /// Text records, one per argument
    text: Vec<String>,
}

impl EventInput {
    fn read(&self) -> Result<TagEvent, Box<dyn std::error::Error>> {
        if let Some(path) = &self.event {
            let content = std::fs::read_to_string(path)?;
            return Ok(serde_json::from_str(&content)?);
        }
        if let Some(tag_id) = &self.tag_id {
            return Ok(TagEvent::tag_id(hex::decode(tag_id.trim())?));
        }
        if self.text.is_empty() {
            return Err("no tag event given; use --event, --tag-id or text records".into());
        }
        Ok(TagEvent::records(
            self.text
                .iter()
                .map(|text| TagRecord::text(&self.lang, text))
                .collect(),
        ))
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize observability system
    match cli.verbose {
        0 => init_default_logging(),
        1 => init_logging(Level::DEBUG, log_format_from_env(), false),
        _ => init_logging(Level::TRACE, log_format_from_env(), true),
    };

    let config = match load_configuration(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Forward {
            input,
            topic,
            reply,
        } => forward(config, &input, topic.as_deref(), reply).await,
        Commands::Encode { input, encoding } => encode(&config, &input, encoding),
        Commands::Config { show } => handle_config_command(&config, show),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }
}

fn log_format_from_env() -> LogFormat {
    LogFormat::parse(&std::env::var("LOG_FORMAT").unwrap_or_else(|_| "compact".to_string()))
}

fn load_configuration(path: Option<&Path>) -> Result<ForwarderConfig, Box<dyn std::error::Error>> {
    if let Some(path) = path {
        info!("Loading configuration from: {}", path.display());
        return Ok(ForwarderConfig::load_from_file(path)?);
    }

    // Try default locations
    for candidate in ["forwarder.toml", "config/forwarder.toml"] {
        let path = Path::new(candidate);
        if path.exists() {
            info!("Loading configuration from: {}", path.display());
            return Ok(ForwarderConfig::load_from_file(path)?);
        }
    }

    Err("no configuration file found; pass -c/--config or create forwarder.toml".into())
}

async fn forward(
    config: ForwarderConfig,
    input: &EventInput,
    topic: Option<&str>,
    reply: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let event = input.read()?;
    let mut session_config = config.session_config()?;
    session_config.reply.subscribe_for_reply |= reply;
    let expect_reply =
        session_config.reply.subscribe_for_reply && session_config.reply.response_topic.is_some();
    if reply && !expect_reply {
        warn!("--reply given but no response_topic is configured");
    }

    // Upper bound for one cycle: connect, publish, and the reply wait
    let deadline = session_config.connect_timeout * 2 + session_config.reply.timeout;

    let (results_tx, mut results_rx) = mpsc::unbounded_channel();
    let session = Session::open(session_config, Arc::new(results_tx))?;
    let event_id = session.forward_event(&event, topic)?;
    info!(event_id = %event_id, records = event.len(), "Forwarding tag event");

    let mut progress = CycleProgress::new(expect_reply);
    let outcome = tokio::time::timeout(deadline, async {
        while let Some(result) = results_rx.recv().await {
            println!("{result}");
            if progress.observe(&result) {
                break;
            }
        }
    });

    tokio::select! {
        finished = outcome => {
            if finished.is_err() {
                warn!("Forwarding cycle did not finish within {:?}", deadline);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, closing session");
        }
    }

    session.close().await?;
    while let Ok(result) = results_rx.try_recv() {
        println!("{result}");
        progress.observe(&result);
    }

    match progress.failure {
        Some(reason) => Err(reason.into()),
        None if progress.aggregate_seen => Ok(()),
        None => Err("forwarding cycle did not complete".into()),
    }
}

/// Tracks when the results of one forward cycle are complete
struct CycleProgress {
    expect_reply: bool,
    aggregate_seen: bool,
    reply_settled: bool,
    failure: Option<String>,
}

impl CycleProgress {
    fn new(expect_reply: bool) -> Self {
        Self {
            expect_reply,
            aggregate_seen: false,
            reply_settled: !expect_reply,
            failure: None,
        }
    }

    /// Returns true once nothing more is expected
    fn observe(&mut self, result: &ForwardingResult) -> bool {
        match result {
            ForwardingResult::ForwardingSucceeded => self.aggregate_seen = true,
            ForwardingResult::ForwardingFailed(reason) => {
                self.aggregate_seen = true;
                self.reply_settled = true;
                self.failure.get_or_insert_with(|| reason.clone());
            }
            ForwardingResult::SubscribeFailed(_) => self.reply_settled = true,
            result if result.is_reply_resolution() => self.reply_settled = true,
            _ => {}
        }
        self.aggregate_seen && (self.reply_settled || !self.expect_reply)
    }
}

fn encode(
    config: &ForwarderConfig,
    input: &EventInput,
    encoding: Option<MessageEncoding>,
) -> Result<(), Box<dyn std::error::Error>> {
    let event = input.read()?;
    let encoding = match encoding {
        Some(encoding) => encoding,
        None => config.encoding()?,
    };

    if let TagEvent::Records { records } = &event {
        for (index, record) in records.iter().enumerate() {
            info!(index, payload = %hexdump(&record.payload), "Record payload");
        }
    }

    let payload = encode_event(
        &event,
        &config.forwarding.attributes,
        encoding,
        config.forwarding.trim_header,
    )?;
    println!("{payload}");
    Ok(())
}

fn handle_config_command(
    config: &ForwarderConfig,
    show: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    // Reads certificates, resolves credentials and builds the TLS context
    let session = config.session_config()?;

    if show {
        println!("Current configuration:");
        println!("{}", toml::to_string_pretty(config)?);
    }

    info!(
        broker = %session.mqtt.address,
        tls = session.mqtt.trust.is_some(),
        "Configuration validation complete"
    );
    Ok(())
}


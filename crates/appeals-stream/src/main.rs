use anyhow::{bail, Context, Result};
use appeals_core::wire::tags;
use appeals_stream::{
    AudioCues, Command, CommandNotifier, ConnectionState, QueueItem, SendOutcome, SilentNotifier,
    StreamClient, StreamConfig,
};
use clap::Parser;
use serde_json::Value;
use std::{
    fs::{File, OpenOptions},
    io,
    path::PathBuf,
    sync::Mutex,
    time::Duration,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{
    fmt::writer::{BoxMakeWriter, MakeWriterExt},
    EnvFilter,
};
use url::Url;

const DEFAULT_URL: &str = "ws://127.0.0.1:8080/ws";
const LOG_FILE_NAME: &str = "appeals-stream.log";

#[derive(Parser, Debug)]
#[command(name = "appeals-stream", about = "Operator console for the appeals event stream")]
struct Args {
    #[arg(long, default_value = "")]
    url: String,
    #[arg(long, default_value_t = 10)]
    heartbeat_interval: u64,
    #[arg(long, default_value_t = 2000)]
    liveness_deadline_ms: u64,
    #[arg(long, default_value_t = 3)]
    retry_delay: u64,
    #[arg(long, default_value_t = 10)]
    connect_timeout: u64,
    #[arg(long, default_value_t = false)]
    debug: bool,
    #[arg(long, default_value = "")]
    log_dir: String,
    /// External player used for audio cues, e.g. `paplay`.
    #[arg(long, default_value = "")]
    cue_player: String,
    #[arg(long)]
    cue_message: Option<PathBuf>,
    #[arg(long)]
    cue_new: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq)]
enum ConsoleCommand {
    List,
    Take(String),
    Send(Command),
    Start,
    Stop,
    Quit,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let debug = args.debug || env_flag("APPEALS_DEBUG");
    let log_dir = resolve_log_dir(&args.log_dir);
    init_logging(debug, &log_dir);

    let config = load_config(&args)?;
    info!(event = "console_start", url = %config.url);

    let connected = if args.cue_player.trim().is_empty() {
        StreamClient::connect(config, SilentNotifier)
    } else {
        let cues = AudioCues {
            message_received: args.cue_message.clone(),
            new_item: args.cue_new.clone(),
        };
        StreamClient::connect(config, CommandNotifier::new(args.cue_player.clone(), cues))
    };
    let client = connected.context("invalid stream configuration")?;

    let printers = [
        tokio::spawn(print_states(client.state_updates())),
        tokio::spawn(print_queue(client.queue_updates())),
    ];
    client.start().await;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line,
            _ = tokio::signal::ctrl_c() => {
                info!(event = "console_interrupt");
                break;
            }
        };
        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(err) => {
                error!(event = "stdin_error", error = %err);
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        match parse_command(&line) {
            Ok(ConsoleCommand::Quit) => break,
            Ok(command) => run_command(&client, command).await,
            Err(err) => println!("error: {err}"),
        }
    }

    client.shutdown().await;
    for printer in printers {
        let _ = printer.await;
    }
    info!(event = "console_exit");
    Ok(())
}

fn load_config(args: &Args) -> Result<StreamConfig> {
    let raw = resolve_url(&args.url);
    let url = Url::parse(&raw).with_context(|| format!("invalid stream url '{raw}'"))?;
    let mut config = StreamConfig::new(url);
    config.heartbeat_interval = Duration::from_secs(args.heartbeat_interval);
    config.liveness_deadline = Duration::from_millis(args.liveness_deadline_ms);
    config.retry_delay = Duration::from_secs(args.retry_delay);
    config.connect_timeout = Duration::from_secs(args.connect_timeout);
    config.validate()?;
    Ok(config)
}

async fn run_command(client: &StreamClient, command: ConsoleCommand) {
    match command {
        ConsoleCommand::List => {
            let items = client.snapshot();
            if items.is_empty() {
                println!("queue empty ({})", client.connection_state());
            }
            for item in &items {
                println!("{}", describe(item));
            }
        }
        ConsoleCommand::Take(id) => {
            let outcome = client
                .send_for_item(id.clone(), Command::new(tags::TAKE_APPEAL))
                .await;
            report(&format!("take {id}"), outcome);
        }
        ConsoleCommand::Send(command) => {
            let label = format!("send {}", command.event);
            report(&label, client.send(command).await);
        }
        ConsoleCommand::Start => client.start().await,
        ConsoleCommand::Stop => client.stop().await,
        ConsoleCommand::Quit => {}
    }
}

fn report(label: &str, outcome: SendOutcome) {
    match outcome {
        SendOutcome::Sent => println!("{label}: sent"),
        SendOutcome::Dropped(reason) => {
            warn!(event = "console_command_dropped", command = %label, reason = ?reason);
            println!("{label}: dropped ({reason:?})");
        }
    }
}

fn parse_command(line: &str) -> Result<ConsoleCommand> {
    let line = line.trim();
    let (verb, rest) = match line.split_once(char::is_whitespace) {
        Some((verb, rest)) => (verb, rest.trim()),
        None => (line, ""),
    };
    match verb {
        "list" | "ls" => Ok(ConsoleCommand::List),
        "start" => Ok(ConsoleCommand::Start),
        "stop" => Ok(ConsoleCommand::Stop),
        "quit" | "exit" => Ok(ConsoleCommand::Quit),
        "take" => {
            if rest.is_empty() {
                bail!("usage: take <id>");
            }
            Ok(ConsoleCommand::Take(rest.to_string()))
        }
        "send" => {
            let (event, payload) = match rest.split_once(char::is_whitespace) {
                Some((event, payload)) => (event, payload.trim()),
                None => (rest, ""),
            };
            if event.is_empty() {
                bail!("usage: send <event> [json]");
            }
            let mut command = Command::new(event);
            if !payload.is_empty() {
                let data: Value =
                    serde_json::from_str(payload).context("payload is not valid json")?;
                command = command.with_data(data);
            }
            Ok(ConsoleCommand::Send(command))
        }
        other => bail!("unknown command '{other}' (list, take, send, start, stop, quit)"),
    }
}

fn describe(item: &QueueItem) -> String {
    let text = item
        .last_message
        .as_ref()
        .and_then(|msg| msg.text.as_deref())
        .unwrap_or("-");
    let at = item
        .recency()
        .map(|at| at.to_rfc3339())
        .unwrap_or_else(|| "-".to_string());
    let flag = if item.action_in_flight { " [pending]" } else { "" };
    format!("{}{flag}  {at}  {text}", item.id)
}

async fn print_states(mut rx: watch::Receiver<ConnectionState>) {
    while rx.changed().await.is_ok() {
        let state = *rx.borrow_and_update();
        println!("connection: {state}");
    }
}

async fn print_queue(mut rx: watch::Receiver<Vec<QueueItem>>) {
    while rx.changed().await.is_ok() {
        let len = rx.borrow_and_update().len();
        println!("queue: {len} appeal(s)");
    }
}

/// Logs to stdout, teed into `<log_dir>/appeals-stream.log` when a log dir is set.
fn init_logging(debug: bool, log_dir: &str) {
    let level = log_level(debug, std::env::var("APPEALS_LOG_LEVEL").ok());
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let writer = match open_log_file(log_dir) {
        Ok(Some(file)) => BoxMakeWriter::new(io::stdout.and(Mutex::new(file))),
        Ok(None) => BoxMakeWriter::new(io::stdout),
        Err(err) => {
            eprintln!("log_file_error: {err}");
            BoxMakeWriter::new(io::stdout)
        }
    };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .try_init();
}

fn log_level(debug: bool, configured: Option<String>) -> String {
    match configured {
        Some(level) if !level.trim().is_empty() => level,
        _ if debug => "debug".to_string(),
        _ => "info".to_string(),
    }
}

fn open_log_file(log_dir: &str) -> io::Result<Option<File>> {
    if log_dir.trim().is_empty() {
        return Ok(None);
    }
    let dir = PathBuf::from(log_dir);
    std::fs::create_dir_all(&dir)?;
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(dir.join(LOG_FILE_NAME))
        .map(Some)
}

fn env_flag(key: &str) -> bool {
    std::env::var(key).is_ok_and(|value| flag_enabled(&value))
}

fn flag_enabled(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn resolve_url(url_flag: &str) -> String {
    if !url_flag.trim().is_empty() {
        return url_flag.to_string();
    }
    if let Ok(value) = std::env::var("APPEALS_STREAM_URL") {
        if !value.trim().is_empty() {
            return value;
        }
    }
    DEFAULT_URL.to_string()
}

fn resolve_log_dir(log_dir_flag: &str) -> String {
    if !log_dir_flag.trim().is_empty() {
        return log_dir_flag.to_string();
    }
    std::env::var("APPEALS_LOG_DIR").unwrap_or_default()
}

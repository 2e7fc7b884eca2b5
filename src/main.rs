use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

use realtime_voice::voice::session::ConnectionState;
use realtime_voice::voice::{WavFileCapture, WsConnector};
use realtime_voice::{ChannelSink, Config, Role, UiEvent, VoiceSession};

/// rtvoice - realtime voice and text chat with a remote agent
#[derive(Parser)]
#[command(name = "rtvoice", version, about)]
struct Cli {
    /// Config file (defaults to the platform config dir)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Interactive text chat (`/cancel` interrupts, `/quit` exits)
    Chat,
    /// Stream a WAV file through voice activity detection as if spoken
    Talk {
        /// Mono or stereo WAV at the configured capture rate
        #[arg(long)]
        wav: PathBuf,
        /// Silence appended after the file, in milliseconds
        #[arg(long, default_value = "3000")]
        tail_ms: u64,
    },
    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "warn,realtime_voice=info",
        1 => "info,realtime_voice=debug",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(std::io::stderr)
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = Config::load(cli.config.as_deref()).context("loading configuration")?;

    match cli.command {
        Command::Chat => chat(config).await,
        Command::Talk { wav, tail_ms } => talk(config, wav, Duration::from_millis(tail_ms)).await,
        Command::Config => show_config(&config, cli.config),
    }
}

fn open_session(config: &Config) -> (VoiceSession, tokio::sync::mpsc::UnboundedReceiver<UiEvent>) {
    let (sink, events) = ChannelSink::new();
    let connector = Arc::new(WsConnector::new(config.connection.connect_timeout()));
    let session = VoiceSession::new(config, connector, Arc::new(sink));
    (session, events)
}

async fn chat(config: Config) -> anyhow::Result<()> {
    let (mut session, mut events) = open_session(&config);
    session.connect()?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                match line.trim() {
                    "" => {}
                    "/quit" => break,
                    "/cancel" => {
                        if let Err(e) = session.cancel_response() {
                            eprintln!("! {e}");
                        }
                    }
                    text => {
                        if let Err(e) = session.send_text(text) {
                            eprintln!("! {e}");
                        }
                    }
                }
            }
            event = events.recv() => {
                let Some(event) = event else { break };
                render(&event);
                if event == UiEvent::Connection(ConnectionState::Failed) {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    session.disconnect().await.ok();
    session.shutdown().await;
    Ok(())
}

async fn talk(config: Config, wav: PathBuf, tail: Duration) -> anyhow::Result<()> {
    anyhow::ensure!(wav.exists(), "{} does not exist", wav.display());

    let (mut session, mut events) = open_session(&config);
    session.connect()?;

    let mut started = false;
    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                render(&event);
                match &event {
                    UiEvent::Connection(ConnectionState::Open) if !started => {
                        let device = WavFileCapture::new(&wav).with_tail(tail);
                        session
                            .start_voice_input(Box::new(device))
                            .await
                            .context("starting voice input")?;
                        started = true;
                    }
                    UiEvent::Connection(ConnectionState::Failed | ConnectionState::Disconnected) => break,
                    UiEvent::Message(message)
                        if message.role == Role::Assistant && started && !session.is_voice_active() =>
                    {
                        break;
                    }
                    _ => {}
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    session.disconnect().await.ok();
    session.shutdown().await;
    Ok(())
}

fn show_config(config: &Config, explicit: Option<PathBuf>) -> anyhow::Result<()> {
    let path = explicit.or_else(Config::default_path);
    if let Some(path) = path {
        println!("# {}", path.display());
    }
    print!("{}", config.to_redacted_toml()?);
    Ok(())
}

fn render(event: &UiEvent) {
    match event {
        UiEvent::Message(message) => match message.role {
            // Typed input is already on screen.
            Role::User if message.item_id.is_none() => {}
            role => println!("{}: {}", role.as_str(), message.text),
        },
        UiEvent::Connection(state) => eprintln!("[{state}]"),
        UiEvent::SessionReady { session_id } => eprintln!("[session {session_id}]"),
        UiEvent::SpeechActivity(active) => {
            tracing::debug!(active, "Speech activity");
        }
        UiEvent::Status(status) => tracing::debug!(?status, "Agent status"),
        UiEvent::Audio(pcm) => tracing::trace!(bytes = pcm.len(), "Agent audio"),
        UiEvent::Error { kind, message } => eprintln!("! {kind:?}: {message}"),
    }
}

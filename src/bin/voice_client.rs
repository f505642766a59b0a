//! Command-line client for the relay.
//!
//! Sends each audio file as one utterance, prints the answers, and speaks
//! them through the console synthesizer (or shows the text fallback when no
//! voice is configured for the answer's language).

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::Parser;
use rev_voice_relay::client::controller::Speaker;
use rev_voice_relay::client::{
    ClientConnection, ClientController, ConnectionState, ConsoleSynthesizer, FileMicrophone,
    Reaction, ReconnectPolicy,
};
use rev_voice_relay::language::SUPPORTED_LANGUAGES;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Talk to the Rev voice relay from the command line
#[derive(Parser, Debug)]
#[command(name = "rev-voice-client")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Relay WebSocket URL
    #[arg(short, long, default_value = "ws://127.0.0.1:3000/ws")]
    url: String,

    /// Language of the questions (ISO 639-1)
    #[arg(short, long, default_value = "en")]
    language: String,

    /// Speech tags the console synthesizer has voices for
    #[arg(long = "voice", value_delimiter = ',', default_value = "en-US")]
    voices: Vec<String>,

    /// Seconds to wait for each answer
    #[arg(long, default_value_t = 60)]
    response_timeout_secs: u64,

    /// Reconnect attempts before giving up
    #[arg(long, default_value_t = 10)]
    max_retries: u32,

    /// Print the supported languages and exit
    #[arg(long)]
    list_languages: bool,

    /// Recorded questions, one utterance per file
    files: Vec<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "rev_voice_relay=info,rev_voice_client=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let synthesizer = ConsoleSynthesizer::new(cli.voices.clone());

    let mut microphone = FileMicrophone::new(16 * 1024);
    for file in &cli.files {
        microphone.load(file);
    }

    let mut controller =
        ClientController::new(Box::new(microphone), Box::new(synthesizer), &cli.language);

    if cli.list_languages {
        for language in SUPPORTED_LANGUAGES.iter() {
            let mark = if controller.voice_available(language.code) { "voice" } else { "text" };
            println!("{:<4}{:<12}{:<8}{}", language.code, language.name, language.speech_tag, mark);
        }
        return Ok(());
    }

    if cli.files.is_empty() {
        anyhow::bail!("no audio files given; pass one or more recordings to send");
    }

    let switch = controller.set_language(&cli.language);
    println!(
        "Switched to {} ({})",
        switch.name,
        if switch.voice_available { "voice" } else { "text only" }
    );

    let connection = ClientConnection::new(cli.url.clone()).with_policy(ReconnectPolicy {
        max_retries: cli.max_retries,
        ..ReconnectPolicy::default()
    });
    let mut states = connection.subscribe();
    let (out_tx, out_rx) = mpsc::channel(8);
    let (in_tx, mut in_rx) = mpsc::channel(32);
    let connection_task = tokio::spawn(async move { connection.run(out_rx, in_tx).await });

    let response_timeout = Duration::from_secs(cli.response_timeout_secs);

    'utterances: for file in &cli.files {
        if let Err(e) = controller.start_recording() {
            warn!(file = %file.display(), "Skipping utterance: {}", e);
            continue;
        }
        let Some(envelope) = controller.stop_recording() else {
            warn!(file = %file.display(), "Nothing recorded");
            continue;
        };

        let turn_started = Utc::now();
        println!("> {} ({})", file.display(), controller.language());
        out_tx
            .send(envelope)
            .await
            .context("connection task ended before the utterance could be sent")?;

        let deadline = tokio::time::sleep(response_timeout);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                inbound = in_rx.recv() => {
                    let Some(text) = inbound else {
                        warn!("Connection closed while waiting for an answer");
                        break 'utterances;
                    };
                    match controller.on_inbound_text(&text) {
                        Reaction::Answered => {
                            print_entries_since(&controller, turn_started);
                            break;
                        }
                        Reaction::Failed(message) => {
                            eprintln!("! {}", message);
                            controller.dismiss_error();
                            break;
                        }
                        Reaction::Busy => info!("Processing audio..."),
                        Reaction::Interrupted | Reaction::Ignored => {}
                    }
                }
                changed = states.changed() => {
                    if changed.is_err() {
                        break 'utterances;
                    }
                    let state = *states.borrow();
                    controller.on_connection_state(state);
                    info!("{}", state.describe());
                    if state == ConnectionState::Failed {
                        break 'utterances;
                    }
                }
                _ = &mut deadline => {
                    warn!(file = %file.display(), "No answer within {:?}", response_timeout);
                    break;
                }
            }
        }
    }

    drop(out_tx);
    let outcome = connection_task.await.context("connection task panicked")?;

    let stats = controller.stats();
    println!(
        "Sent {} utterance(s), received {} message(s)",
        stats.messages_sent, stats.messages_received
    );

    outcome.map_err(anyhow::Error::from)
}

fn print_entries_since(controller: &ClientController, since: DateTime<Utc>) {
    for entry in controller.view().transcript.iter().filter(|e| e.at >= since) {
        match entry.speaker {
            Speaker::Ai => println!("< {}", entry.text),
            Speaker::System => println!("i {}", entry.text),
        }
    }
}

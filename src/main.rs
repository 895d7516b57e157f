use std::path::PathBuf;
use std::sync::Arc;

use anyhow::anyhow;
use bytes::Bytes;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::info;

use voiceturn::core::collaborators::stub::{
    EnergyScorer, HeuristicEndOfTurn, ScriptedLanguageModel, ScriptedTranscriber,
    SilenceSynthesizer,
};
use voiceturn::core::collaborators::LlmUnit;
use voiceturn::tools::{builtin, ToolRegistry};
use voiceturn::{AudioFrame, Collaborators, FrameBus, RuntimeConfig, Session, SessionEvent};

/// voiceturn - Real-time voice agent runtime
#[derive(Parser, Debug)]
#[command(name = "voiceturn")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short = 'c', long = "config", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Subcommand to run
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run one scripted exchange against the in-process stubs
    Check,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if it exists (must be done before config loading)
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt::init();

    let cli = Cli::parse();

    let config = if let Some(config_path) = cli.config {
        println!("Loading configuration from {}", config_path.display());
        RuntimeConfig::from_file(&config_path).map_err(|e| anyhow!(e.to_string()))?
    } else {
        RuntimeConfig::from_env().map_err(|e| anyhow!(e.to_string()))?
    };
    config.validate().map_err(|e| anyhow!(e.to_string()))?;

    match cli.command {
        Some(Commands::Check) => run_check(config).await,
        None => {
            let mut registry = ToolRegistry::new();
            let registered =
                builtin::register_from_env(&mut registry).map_err(|e| anyhow!(e.to_string()))?;
            println!("Configuration OK; {registered} tool(s) available.");
            println!("No transport attached; run `voiceturn check` for a stubbed exchange.");
            Ok(())
        }
    }
}

/// End-to-end smoke run: scripted user asks about the weather, the stub
/// model answers, and the synthesized reply is counted on the way out.
async fn run_check(config: RuntimeConfig) -> anyhow::Result<()> {
    let collaborators = Collaborators {
        scorer: Arc::new(EnergyScorer),
        transcriber: Arc::new(ScriptedTranscriber::for_utterance(
            "what's the weather like in paris today?",
        )),
        end_of_turn: Arc::new(HeuristicEndOfTurn),
        language_model: Arc::new(ScriptedLanguageModel::new(vec![vec![LlmUnit::Text(
            "I can't see outside from here. Paris is usually lovely this time of year though."
                .to_string(),
        )]])),
        synthesizer: Arc::new(SilenceSynthesizer::default()),
    };

    let depth = config.session.frame_queue_depth;
    let mut bus = FrameBus::new(depth);
    let input = bus.input_sender();
    let mut output = bus
        .take_output()
        .ok_or_else(|| anyhow!("playback endpoint already taken"))?;

    let session = Session::new(config, collaborators, Arc::new(ToolRegistry::new()))
        .map_err(|e| anyhow!(e.to_string()))?;
    let mut events = session.events();
    let shutdown = CancellationToken::new();

    // Stop once the turn closes
    let stop = shutdown.clone();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            info!(?event, "session event");
            if matches!(event, SessionEvent::TurnEnded { .. }) {
                stop.cancel();
            }
        }
    });

    // Feed 600 ms of speech-level audio, then silence until shutdown
    let feeder_stop = shutdown.clone();
    tokio::spawn(async move {
        let loud: Vec<u8> = std::iter::repeat(8_000i16.to_le_bytes())
            .take(320)
            .flatten()
            .collect();
        let mut ts = 0u64;
        for _ in 0..30 {
            let frame = AudioFrame::new(Bytes::from(loud.clone()), 16_000, 1, ts);
            if input.send(frame).await.is_err() {
                return;
            }
            ts += 20;
        }
        while !feeder_stop.is_cancelled() {
            let frame = AudioFrame::silence(320, 16_000, ts);
            if input.send(frame).await.is_err() {
                return;
            }
            ts += 20;
            tokio::time::sleep(tokio::time::Duration::from_millis(20)).await;
        }
    });

    // Count playback frames so the bounded queue keeps moving
    let drain = tokio::spawn(async move {
        let mut frames = 0usize;
        while output.recv().await.is_some() {
            frames += 1;
        }
        frames
    });

    let turns = session
        .run(&mut bus, shutdown)
        .await
        .map_err(|e| anyhow!(e.to_string()))?;
    drop(bus);
    let frames = drain.await.unwrap_or(0);

    for turn in &turns {
        println!(
            "turn {}: heard {:?}, replied {:?} ({})",
            turn.id,
            turn.transcript.final_text().unwrap_or(""),
            turn.reply_text,
            turn.outcome.map(|o| o.to_string()).unwrap_or_default(),
        );
    }
    println!("played {frames} audio frames across {} turn(s)", turns.len());
    Ok(())
}

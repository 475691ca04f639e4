use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use loqa_voicelink::{
    ActivePhase, AudioBackendConfig, AudioBackendFactory, AudioSource, Config, DialogClient,
    EventReceiver, MemoryPools, NullSink, PlaybackSink, RecognizerClient, SessionConfig,
    SessionEvent, SynthesizerClient, TlsConnector, VadConfig, WavFileSink,
};
use tokio::sync::mpsc::error::TryRecvError;
use tokio::time::Instant;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// How long to keep polling for a reply once the uplink has ended
const REPLY_GRACE: Duration = Duration::from_secs(30);

#[derive(Parser)]
#[command(name = "voicelink", version, about = "Realtime speech service client")]
struct Cli {
    /// Config file path, without extension
    #[arg(short, long, global = true, default_value = "config/voicelink")]
    config: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Stream a WAV file to the recognizer and print the transcript
    Recognize {
        #[arg(long)]
        wav: String,
    },
    /// Hold a spoken dialog, using a WAV file as the microphone
    Dialog {
        #[arg(long)]
        wav: String,
        /// Write the assistant's speech to this WAV file
        #[arg(long)]
        out: Option<String>,
        /// Ask the assistant to open with this greeting
        #[arg(long)]
        greeting: Option<String>,
    },
    /// Synthesize text
    Speak {
        text: String,
        #[arg(long)]
        out: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let cfg = Config::load(&cli.config)
        .with_context(|| format!("failed to load config {}", cli.config))?;

    info!("Voicelink v{}", env!("CARGO_PKG_VERSION"));
    info!("Loaded config: {}", cfg.service.name);

    let interrupted = Arc::new(AtomicBool::new(false));
    {
        let interrupted = interrupted.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Interrupted, shutting down");
                interrupted.store(true, Ordering::SeqCst);
            }
        });
    }

    let connector = TlsConnector::new(cfg.timeouts.handshake())?;
    let pools = MemoryPools::new(cfg.memory.fast_pool_bytes, cfg.memory.general_pool_bytes);
    let session = SessionConfig::from_config(&cfg);

    match cli.command {
        Command::Recognize { wav } => {
            let (client, events) = RecognizerClient::new(
                connector,
                cfg.recognizer.clone(),
                VadConfig::from(&cfg.vad),
                session,
                pools,
            );
            recognize(&cfg, client, events, wav, &interrupted).await
        }
        Command::Dialog {
            wav,
            out,
            greeting,
        } => {
            let sink = open_sink(out.as_deref(), cfg.dialog.output_sample_rate)?;
            let (client, events) =
                DialogClient::new(connector, cfg.dialog.clone(), session, pools, sink);
            dialog(&cfg, client, events, wav, greeting, &interrupted).await
        }
        Command::Speak { text, out } => {
            let sink = open_sink(out.as_deref(), cfg.synthesizer.sample_rate)?;
            let (client, events) =
                SynthesizerClient::new(connector, cfg.synthesizer.clone(), session, pools, sink);
            speak(client, events, &text, &interrupted).await
        }
    }
}

fn open_sink(out: Option<&str>, sample_rate: u32) -> Result<Box<dyn PlaybackSink>> {
    match out {
        Some(path) => {
            info!("Writing speech to {}", path);
            Ok(Box::new(WavFileSink::create(path, sample_rate, 1)?))
        }
        None => Ok(Box::new(NullSink::new())),
    }
}

async fn recognize(
    cfg: &Config,
    mut client: RecognizerClient<TlsConnector>,
    mut events: EventReceiver,
    wav: String,
    interrupted: &AtomicBool,
) -> Result<()> {
    let mut backend = AudioBackendFactory::create(
        AudioSource::File(wav),
        AudioBackendConfig::from_config(&cfg.audio),
    )?;
    let mut frames = backend.start().await?;

    client
        .start_recording()
        .await
        .context("failed to start recording")?;

    let mut finished = false;
    while !finished && !interrupted.load(Ordering::SeqCst) {
        while let Ok(frame) = frames.try_recv() {
            client.send_samples(&frame.samples).await?;
        }
        client.poll().await?;

        while let Ok(event) = events.try_recv() {
            log_event(&event);
            match event {
                SessionEvent::RecognitionEnded { text } => {
                    println!("{}", text);
                    finished = true;
                }
                SessionEvent::Disconnected { .. } => finished = true,
                _ => {}
            }
        }
    }

    backend.stop().await?;
    client.disconnect().await?;
    Ok(())
}

async fn dialog(
    cfg: &Config,
    mut client: DialogClient<TlsConnector>,
    mut events: EventReceiver,
    wav: String,
    greeting: Option<String>,
    interrupted: &AtomicBool,
) -> Result<()> {
    client.connect().await.context("failed to connect")?;
    client
        .start_session()
        .await
        .context("failed to start dialog session")?;
    if let Some(greeting) = greeting {
        client.say_hello(&greeting).await?;
    }

    let mut backend = AudioBackendFactory::create(
        AudioSource::File(wav),
        AudioBackendConfig::from_config(&cfg.audio),
    )?;
    let mut frames = backend.start().await?;
    client.start_recording().await?;

    // Set when the utterance ends, by the server or because input ran out
    let mut utterance_ended_at: Option<Instant> = None;
    let mut finished = false;

    while !finished && !interrupted.load(Ordering::SeqCst) {
        loop {
            match frames.try_recv() {
                Ok(frame) => {
                    if client.state().phase() == Some(ActivePhase::Recording) {
                        client.send_samples(&frame.samples).await?;
                    }
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    if utterance_ended_at.is_none() {
                        info!("Input exhausted, waiting for the reply");
                        client.stop_recording().await?;
                        utterance_ended_at = Some(Instant::now());
                    }
                    break;
                }
            }
        }

        client.poll().await?;

        while let Ok(event) = events.try_recv() {
            log_event(&event);
            match event {
                SessionEvent::ChatText { content } => println!("{}", content),
                SessionEvent::RecordingStopped { .. } => {
                    utterance_ended_at.get_or_insert_with(Instant::now);
                }
                SessionEvent::PlaybackFinished if utterance_ended_at.is_some() => finished = true,
                SessionEvent::Disconnected { .. } => finished = true,
                _ => {}
            }
        }

        if utterance_ended_at.is_some_and(|at| at.elapsed() > REPLY_GRACE) {
            warn!("No reply within {:?}", REPLY_GRACE);
            finished = true;
        }
    }

    backend.stop().await?;
    client.shutdown().await?;
    Ok(())
}

async fn speak(
    mut client: SynthesizerClient<TlsConnector>,
    mut events: EventReceiver,
    text: &str,
    interrupted: &AtomicBool,
) -> Result<()> {
    client.speak(text).await.context("failed to start synthesis")?;

    let started = Instant::now();
    let mut finished = false;
    while !finished && !interrupted.load(Ordering::SeqCst) {
        client.poll().await?;

        while let Ok(event) = events.try_recv() {
            log_event(&event);
            if matches!(
                event,
                SessionEvent::PlaybackFinished | SessionEvent::Disconnected { .. }
            ) {
                finished = true;
            }
        }

        if started.elapsed() > REPLY_GRACE {
            warn!("Synthesis did not finish within {:?}", REPLY_GRACE);
            finished = true;
        }
    }

    let stats = client.stats();
    info!(
        "Received {} bytes of audio in {} chunks",
        stats.playback_bytes_received,
        client.chunks_received()
    );
    client.shutdown().await?;
    Ok(())
}

fn log_event(event: &SessionEvent) {
    match event {
        SessionEvent::StateChanged { from, to } => info!("{} -> {}", from, to),
        SessionEvent::Transcript { text, is_final } => {
            info!("Transcript{}: {}", if *is_final { " (final)" } else { "" }, text)
        }
        SessionEvent::ServerError { code, message } => {
            warn!("Server error {:?}: {}", code, message)
        }
        other => info!("{:?}", other),
    }
}

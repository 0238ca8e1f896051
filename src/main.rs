use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::EnvFilter;
use voicepipe_core::{AppConfig, ConfigDiff, EnqueueMetadata};
use voicepipe_session::VoiceSession;

#[derive(Parser)]
#[command(name = "voicepipe", about = "Real-time voice capture and playback pipeline")]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Capture from the microphone and report voice activity until Ctrl-C
    Listen,
    /// Play a WAV file through the playback queue
    Play { file: PathBuf },
    /// Stream raw PCM16 through the gapless scheduler
    Stream {
        file: PathBuf,
        /// Bytes per simulated network chunk
        #[arg(long, default_value_t = 4800)]
        chunk_bytes: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = AppConfig::load_from_file(&cli.config)
        .with_context(|| format!("failed to load config from {:?}", cli.config))?;

    let env_filter = EnvFilter::try_new(&config.general.log_level)
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let subscriber = tracing_subscriber::Registry::default()
        .with(env_filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_ansi(false),
        );

    tracing::subscriber::set_global_default(subscriber)
        .context("failed to set tracing subscriber")?;

    tracing::info!("voicepipe starting");
    tracing::info!(
        "output: {:?} on '{}'",
        config.output.backend,
        config.output.device_name
    );

    let clock = voicepipe_audio::clock_for_output(&config.output, &config.playback);
    let mut session =
        VoiceSession::new(config.clone(), clock).context("invalid session configuration")?;

    // Keep the watcher alive for the whole run.
    let (_watcher, mut reload_rx) = match watch_config(&cli.config) {
        Ok((watcher, rx)) => (Some(watcher), rx),
        Err(e) => {
            tracing::warn!("config hot reload disabled: {e:#}");
            (None, mpsc::unbounded_channel().1)
        }
    };
    let mut current = config;

    let result = match cli.command {
        Command::Listen => listen(&mut session, &mut current, &mut reload_rx).await,
        Command::Play { file } => play(&mut session, &file).await,
        Command::Stream { file, chunk_bytes } => {
            stream(&mut session, &current, &file, chunk_bytes).await
        }
    };

    session.shutdown();
    tracing::info!("voicepipe stopped");
    result
}

async fn listen(
    session: &mut VoiceSession,
    current: &mut AppConfig,
    reload_rx: &mut mpsc::UnboundedReceiver<AppConfig>,
) -> Result<()> {
    session
        .start_capture()
        .with_context(|| format!("failed to start capture on '{}'", current.capture.device_name))?;
    let mut outbound = session
        .take_outbound_receiver()
        .context("outbound receiver already taken")?;
    let mut status = session.subscribe_status();
    let mut speaking = false;
    let mut forwarded: u64 = 0;

    loop {
        tokio::select! {
            Some(frame) = outbound.recv() => {
                forwarded += 1;
                tracing::debug!(bytes = frame.len(), forwarded, "capture frame forwarded");
            }
            Ok(()) = status.changed() => {
                let now_speaking = status.borrow_and_update().is_speaking;
                if now_speaking != speaking {
                    speaking = now_speaking;
                    if speaking {
                        tracing::info!("voice started");
                    } else {
                        tracing::info!(forwarded, "voice ended");
                    }
                }
            }
            Some(new_config) = reload_rx.recv() => {
                apply_reload(session, current, new_config);
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("received Ctrl-C, stopping capture");
                break;
            }
        }
    }

    session.stop_capture();
    tracing::info!(forwarded, "listen finished");
    Ok(())
}

async fn play(session: &mut VoiceSession, file: &Path) -> Result<()> {
    let payload = std::fs::read(file).with_context(|| format!("failed to read {file:?}"))?;
    let id = session
        .enqueue_audio(&payload, EnqueueMetadata::tagged("cli"))
        .with_context(|| format!("failed to enqueue {file:?}"))?;
    tracing::info!(id, "queued {:?}", file);

    let mut ticker = tokio::time::interval(Duration::from_millis(100));
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let status = session.queue_status();
                if status.queue_length == 0 && !status.is_playing {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("received Ctrl-C, stopping playback");
                break;
            }
        }
    }

    if let Some(error) = session.status().last_error {
        tracing::warn!("playback finished with error: {error}");
    }
    Ok(())
}

async fn stream(
    session: &mut VoiceSession,
    config: &AppConfig,
    file: &Path,
    chunk_bytes: usize,
) -> Result<()> {
    let data = std::fs::read(file).with_context(|| format!("failed to read {file:?}"))?;
    // Whole samples only.
    let chunk_bytes = (chunk_bytes.max(2) / 2) * 2;
    let sample_rate = config.playback.sample_rate;
    let mut status = session.subscribe_status();
    let mut chunks_sent = 0u64;

    for (i, chunk) in data.chunks(chunk_bytes).enumerate() {
        let header = format!(
            r#"{{"type":"audio_chunk","size":{},"format":"pcm","sample_rate":{},"channels":1,"bits_per_sample":16,"streaming":true,"chunk_id":"chunk_{}","chunk_count":{}}}"#,
            chunk.len(),
            sample_rate,
            i,
            i + 1
        );
        session
            .handle_text(&header)
            .context("failed to announce chunk")?;
        if session.handle_binary(chunk.to_vec()).await {
            chunks_sent += 1;
        }

        // Deliver faster than real time, the way a network burst arrives.
        let chunk_secs = chunk.len() as f64 / 2.0 / sample_rate as f64;
        tokio::time::sleep(Duration::from_secs_f64(chunk_secs / 2.0)).await;
    }

    let complete = format!(
        r#"{{"type":"audio_complete","chunks_sent":{},"total_size":{},"format":"pcm"}}"#,
        chunks_sent,
        data.len()
    );
    session
        .handle_text(&complete)
        .context("failed to complete stream")?;
    tracing::info!(chunks_sent, bytes = data.len(), "stream sent, waiting for playback");

    tokio::select! {
        result = status.wait_for(|s| !s.is_playing) => {
            result.context("session status closed")?;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received Ctrl-C, stopping stream");
        }
    }
    Ok(())
}

/// Watch the config file and deliver each successfully parsed revision.
fn watch_config(
    path: &Path,
) -> Result<(RecommendedWatcher, mpsc::UnboundedReceiver<AppConfig>)> {
    let (tx, rx) = mpsc::unbounded_channel();
    let config_path = path.to_path_buf();

    let mut watcher = RecommendedWatcher::new(
        move |res: notify::Result<Event>| {
            let Ok(event) = res else {
                return;
            };
            if !matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_)) {
                return;
            }
            match AppConfig::load_from_file(&config_path) {
                Ok(config) => {
                    let _ = tx.send(config);
                }
                Err(e) => tracing::warn!("ignoring config change: {e}"),
            }
        },
        Config::default(),
    )
    .context("failed to create config watcher")?;

    watcher
        .watch(path, RecursiveMode::NonRecursive)
        .with_context(|| format!("failed to watch {path:?}"))?;
    tracing::info!("watching {:?} for changes", path);

    Ok((watcher, rx))
}

fn apply_reload(session: &mut VoiceSession, current: &mut AppConfig, new_config: AppConfig) {
    let diff = ConfigDiff::diff(current, &new_config);
    if diff.is_empty() {
        return;
    }

    if let Some(vad) = diff.vad_change {
        match session.update_vad_config(vad) {
            Ok(()) => tracing::info!("vad settings reloaded"),
            Err(e) => tracing::warn!("vad settings rejected: {e}"),
        }
    }
    if let Some(volume) = diff.volume_change {
        session.set_volume(volume);
        tracing::info!(volume, "volume reloaded");
    }
    if let Some(gate) = diff.gate_on_voice_change {
        session.set_gate_on_voice(gate);
        tracing::info!(gate, "voice gate reloaded");
    }
    for field in &diff.non_reloadable {
        tracing::warn!("{field} changed; restart to apply");
    }

    *current = new_config;
}

use anyhow::{Context, Result};
use parley::SessionConfig;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const API_KEY_VAR: &str = "GEMINI_API_KEY";

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "parley=debug,info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Parley voice session");

    let config = match std::env::args().nth(1) {
        Some(path) => SessionConfig::from_toml_file(&path)
            .with_context(|| format!("Failed to load config from {}", path))?,
        None => SessionConfig::default(),
    };

    let api_key = std::env::var(API_KEY_VAR)
        .with_context(|| format!("{} is not set", API_KEY_VAR))?;

    run(config.with_api_key(api_key)).await
}

#[cfg(feature = "audio-io")]
async fn run(config: SessionConfig) -> Result<()> {
    use parley::audio::CpalBackend;
    use parley::session::WebSocketTransport;
    use parley::VoiceSession;

    let print_transcripts = config.enable_transcripts;
    let mut session = VoiceSession::new(config, CpalBackend::new(), WebSocketTransport::new());
    if print_transcripts {
        session.set_transcript_callback(|entry| {
            println!(
                "[{}] {:?}: {}",
                entry.timestamp.format("%H:%M:%S"),
                entry.role,
                entry.text
            );
        });
    }

    session.connect().await?;
    info!("Listening, press Ctrl-C to stop");

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            event = session.next_event() => match event {
                Some(event) => session.dispatch(event),
                None => break,
            },
            _ = &mut ctrl_c => {
                info!("Interrupted, shutting down");
                break;
            }
        }
    }

    session.disconnect();

    if let Some(error) = session.last_error() {
        anyhow::bail!(error);
    }
    Ok(())
}

#[cfg(not(feature = "audio-io"))]
async fn run(_config: SessionConfig) -> Result<()> {
    anyhow::bail!("Built without the audio-io feature, no audio devices available")
}

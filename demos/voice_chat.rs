// demos/voice_chat.rs
//
// Talk to the model through the default microphone and speakers.
// Run with: cargo run --example voice_chat --features cpal-backend
use gemini_live_voice::device::CpalBackend;
use gemini_live_voice::{ConnectionState, LiveConfig, LiveSessionBuilder};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = LiveConfig::from_env()?;
    info!("[Main] Using model {} with voice {}.", config.model, config.voice_name);
    let manager = LiveSessionBuilder::from_config(config)
        .output_audio_transcription(true)
        .audio_backend(CpalBackend::new())
        .build()?;

    let mut transitions = manager.subscribe_transitions();
    manager.connect();
    info!("[Main] Speak when connected. Ctrl+C to quit.");

    let mut meter = tokio::time::interval(Duration::from_millis(500));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("[Main] Ctrl+C received.");
                break;
            }
            state = transitions.recv() => match state {
                Ok(ConnectionState::Error) => {
                    warn!("[Main] Session failed: {}", manager.last_error().unwrap_or_default());
                }
                Ok(ConnectionState::Disconnected) => {
                    info!("[Main] Session ended.");
                    break;
                }
                Ok(state) => info!("[Main] Session is {}.", state),
                Err(RecvError::Lagged(skipped)) => warn!("[Main] Missed {} state change(s).", skipped),
                Err(RecvError::Closed) => break,
            },
            _ = meter.tick(), if manager.connection_state() == ConnectionState::Connected => {
                let level = manager.volume();
                info!("[Main] Mic {:<20} {:.2}", "#".repeat((level * 20.0) as usize), level);
            }
        }
    }

    manager.disconnect().await;
    info!("[Main] Disconnected.");
    Ok(())
}

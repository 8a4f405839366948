//! Realtime voice sessions against the Gemini Live API.
//!
//! A [`LiveSessionManager`] captures the microphone at 16 kHz, streams it as
//! base64 PCM frames over the live connection and plays the model's 24 kHz
//! replies back to back on the output clock, cutting playback short when the
//! server reports that the user interrupted.
//!
//! Hardware is reached through the `device` traits. The `cpal-backend`
//! feature provides `device::CpalBackend` for the host's sound devices.
//!
//! ```no_run
//! # use gemini_live_voice::{LiveConfig, LiveSessionBuilder, device::AudioBackend};
//! # async fn run(backend: impl AudioBackend) -> Result<(), gemini_live_voice::LiveError> {
//! let manager = LiveSessionBuilder::from_config(LiveConfig::from_env()?)
//!     .audio_backend(backend)
//!     .build()?;
//! manager.connect();
//! let mut state = manager.subscribe_state();
//! while state.changed().await.is_ok() {
//!     println!("session is {}", *state.borrow());
//! }
//! manager.disconnect().await;
//! # Ok(())
//! # }
//! ```

pub mod audio;
pub mod client;
pub mod config;
pub mod device;
pub mod error;
pub mod types;

pub use client::{
    ConnectionState, GeminiLiveTransport, LiveSessionBuilder, LiveSessionManager, Transport,
    TransportEvent, TransportLink,
};
pub use config::LiveConfig;
pub use error::{DecodeError, LiveError, LiveResult};

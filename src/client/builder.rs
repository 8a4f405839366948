use super::connection::GeminiLiveTransport;
use super::handle::LiveSessionManager;
use super::transport::Transport;
use crate::config::LiveConfig;
use crate::device::AudioBackend;
use crate::error::LiveError;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;

pub struct LiveSessionBuilder {
    pub(crate) config: LiveConfig,
    pub(crate) backend: Option<Arc<dyn AudioBackend>>,
    pub(crate) transport: Option<Arc<dyn Transport>>,
}

impl LiveSessionBuilder {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self::from_config(LiveConfig::new(api_key))
    }

    pub fn from_config(config: LiveConfig) -> Self {
        Self {
            config,
            backend: None,
            transport: None,
        }
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.config.model = model.into();
        self
    }

    pub fn voice(mut self, voice_name: impl Into<String>) -> Self {
        self.config.voice_name = voice_name.into();
        self
    }

    pub fn system_instruction(mut self, instruction: impl Into<String>) -> Self {
        self.config.system_instruction = Some(instruction.into());
        self
    }

    pub fn without_system_instruction(mut self) -> Self {
        self.config.system_instruction = None;
        self
    }

    pub fn frame_size(mut self, samples: usize) -> Self {
        self.config.frame_size = samples;
        self
    }

    pub fn volume_gain(mut self, gain: f32) -> Self {
        self.config.volume_gain = gain;
        self
    }

    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.config.handshake_timeout_ms = timeout.as_millis().try_into().unwrap_or(u64::MAX);
        self
    }

    /// Asks the server to transcribe its spoken replies; transcripts are logged.
    pub fn output_audio_transcription(mut self, enabled: bool) -> Self {
        self.config.transcribe_output = enabled;
        self
    }

    pub fn audio_backend(mut self, backend: impl AudioBackend) -> Self {
        self.backend = Some(Arc::new(backend));
        self
    }

    /// Replaces the default WebSocket transport.
    pub fn transport(mut self, transport: impl Transport) -> Self {
        self.transport = Some(Arc::new(transport));
        self
    }

    /// Validates the configuration and binds the manager to the current
    /// Tokio runtime, which will run its session tasks.
    pub fn build(self) -> Result<LiveSessionManager, LiveError> {
        self.config.validate()?;
        let backend = self
            .backend
            .ok_or_else(|| LiveError::Config("an audio backend is required".to_string()))?;
        let runtime = Handle::try_current().map_err(|_| {
            LiveError::Config("LiveSessionManager must be built inside a Tokio runtime".to_string())
        })?;
        let transport = match self.transport {
            Some(transport) => transport,
            None => Arc::new(GeminiLiveTransport::new(&self.config)),
        };
        Ok(LiveSessionManager::new(self.config, backend, transport, runtime))
    }
}

use crate::error::LiveError;
use crate::types::{
    AudioTranscriptionConfig, BidiGenerateContentSetup, Content, GenerationConfig,
    PrebuiltVoiceConfig, ResponseModality, SpeechConfig, VoiceConfig,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DEFAULT_MODEL: &str = "models/gemini-2.5-flash-native-audio-preview-09-2025";
pub const DEFAULT_VOICE: &str = "Kore";
pub const DEFAULT_SYSTEM_INSTRUCTION: &str =
    "أنت مهندس صيانة طابعات خبير تتحدث مع زميل لك في الميدان عبر الصوت. \
     كن احترافياً وعملياً ومختصراً، واستخدم المصطلحات الإنجليزية التقنية بشكل طبيعي، \
     وساعد في تشخيص العطل خطوة بخطوة.";

/// Settings for one live voice session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LiveConfig {
    pub api_key: String,
    pub model: String,
    pub voice_name: String,
    pub system_instruction: Option<String>,
    /// Rate of the capture context and of every outbound frame.
    pub input_sample_rate: u32,
    /// Rate of the playback context; inbound audio is converted to it.
    pub output_sample_rate: u32,
    /// Samples per captured frame.
    pub frame_size: usize,
    /// Multiplier applied to the RMS level before clamping to [0, 1].
    pub volume_gain: f32,
    pub capture_channel_capacity: usize,
    pub outbound_queue_capacity: usize,
    pub transport_channel_capacity: usize,
    pub max_consecutive_decode_failures: u32,
    pub handshake_timeout_ms: u64,
    pub prune_interval_ms: u64,
    pub transcribe_output: bool,
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            model: DEFAULT_MODEL.to_string(),
            voice_name: DEFAULT_VOICE.to_string(),
            system_instruction: Some(DEFAULT_SYSTEM_INSTRUCTION.to_string()),
            input_sample_rate: 16000,
            output_sample_rate: 24000,
            frame_size: 4096,
            volume_gain: 5.0,
            capture_channel_capacity: 32,
            outbound_queue_capacity: 64,
            transport_channel_capacity: 100,
            max_consecutive_decode_failures: 5,
            handshake_timeout_ms: 15_000,
            prune_interval_ms: 250,
            transcribe_output: false,
        }
    }
}

impl LiveConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            ..Default::default()
        }
    }

    /// Reads `GEMINI_API_KEY` (or `API_KEY`), `GEMINI_MODEL` and `GEMINI_VOICE`,
    /// loading a `.env` file first when one exists.
    pub fn from_env() -> Result<Self, LiveError> {
        dotenv::dotenv().ok();
        let api_key = std::env::var("GEMINI_API_KEY")
            .or_else(|_| std::env::var("API_KEY"))
            .map_err(|_| LiveError::Config("GEMINI_API_KEY not set".to_string()))?;
        let mut config = Self::new(api_key);
        if let Ok(model) = std::env::var("GEMINI_MODEL") {
            config.model = model;
        }
        if let Ok(voice) = std::env::var("GEMINI_VOICE") {
            config.voice_name = voice;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), LiveError> {
        if self.api_key.trim().is_empty() {
            return Err(LiveError::Config("api_key must not be empty".to_string()));
        }
        if self.input_sample_rate == 0 || self.output_sample_rate == 0 {
            return Err(LiveError::Config(
                "sample rates must be greater than zero".to_string(),
            ));
        }
        if self.frame_size == 0 {
            return Err(LiveError::Config("frame_size must be greater than zero".to_string()));
        }
        if self.capture_channel_capacity == 0
            || self.outbound_queue_capacity == 0
            || self.transport_channel_capacity == 0
        {
            return Err(LiveError::Config(
                "channel capacities must be greater than zero".to_string(),
            ));
        }
        if !self.volume_gain.is_finite() || self.volume_gain < 0.0 {
            return Err(LiveError::Config(
                "volume_gain must be a non-negative number".to_string(),
            ));
        }
        Ok(())
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn prune_interval(&self) -> Duration {
        Duration::from_millis(self.prune_interval_ms.max(1))
    }

    /// MIME type attached to every outbound frame.
    pub fn input_mime_type(&self) -> String {
        format!("audio/pcm;rate={}", self.input_sample_rate)
    }

    /// The first message sent on a fresh connection.
    pub fn setup_message(&self) -> BidiGenerateContentSetup {
        BidiGenerateContentSetup {
            model: self.model.clone(),
            generation_config: Some(GenerationConfig {
                response_modalities: Some(vec![ResponseModality::Audio]),
                speech_config: Some(SpeechConfig {
                    voice_config: Some(VoiceConfig {
                        prebuilt_voice_config: PrebuiltVoiceConfig {
                            voice_name: self.voice_name.clone(),
                        },
                    }),
                    language_code: None,
                }),
                ..Default::default()
            }),
            system_instruction: self.system_instruction.as_deref().map(Content::from_text),
            output_audio_transcription: self
                .transcribe_output
                .then(AudioTranscriptionConfig::default),
            ..Default::default()
        }
    }
}

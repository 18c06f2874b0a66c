use async_trait::async_trait;
use base64::{ engine::general_purpose::STANDARD, Engine as _ };
use log::{ info, error };
use std::sync::Arc;
use reqwest::{ Client as HttpClient, header::CONTENT_TYPE };
use serde::Serialize;
use std::error::Error;
use std::time::Duration;

use crate::cli::Args;

pub const DEFAULT_VOICE: &str = "pt-BR-Neural2-B";
pub const DEFAULT_MIME_TYPE: &str = "audio/mpeg";

#[derive(Debug, Clone, PartialEq)]
pub struct SpeechAudio {
    pub bytes: Vec<u8>,
    pub mime_type: String,
}

impl SpeechAudio {
    /// Audio travels to the browser inside a JSON text frame.
    pub fn to_base64(&self) -> String {
        STANDARD.encode(&self.bytes)
    }
}

#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    async fn synthesize(&self, text: &str) -> Result<SpeechAudio, Box<dyn Error + Send + Sync>>;
}

#[derive(Debug, Clone)]
pub struct TtsConfig {
    pub url: String,
    pub voice: String,
    pub speed: f32,
}

#[derive(Serialize)]
struct TtsRequest<'a> {
    text: &'a str,
    voice: &'a str,
    speed: f32,
}

/// Client for the hosted text-to-speech endpoint.
pub struct TtsClient {
    http: HttpClient,
    config: TtsConfig,
}

impl TtsClient {
    pub fn new(config: TtsConfig) -> Result<Self, Box<dyn Error + Send + Sync>> {
        if config.url.trim().is_empty() {
            return Err("TTS endpoint URL is required".into());
        }
        let http = HttpClient::builder().timeout(Duration::from_secs(20)).build()?;
        Ok(Self { http, config })
    }

    fn request_body<'a>(&'a self, text: &'a str) -> TtsRequest<'a> {
        TtsRequest {
            text,
            voice: &self.config.voice,
            speed: self.config.speed,
        }
    }
}

#[async_trait]
impl SpeechSynthesizer for TtsClient {
    async fn synthesize(&self, text: &str) -> Result<SpeechAudio, Box<dyn Error + Send + Sync>> {
        if text.trim().is_empty() {
            return Err("Cannot synthesize empty text".into());
        }
        info!("TtsClient::synthesize() → voice={} chars={}", self.config.voice, text.chars().count());

        let response = self.http
            .post(&self.config.url)
            .json(&self.request_body(text))
            .send().await?
            .error_for_status()?;

        let mime_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .filter(|v| v.starts_with("audio/"))
            .unwrap_or(DEFAULT_MIME_TYPE)
            .to_string();
        let bytes = response.bytes().await?.to_vec();
        if bytes.is_empty() {
            return Err("TTS endpoint returned no audio".into());
        }

        Ok(SpeechAudio { bytes, mime_type })
    }
}

/// Hosted TTS when `TTS_URL` is set. `None` means replies are spoken by the
/// browser's native voice.
pub fn initialize_tts(args: &Args) -> Option<Arc<dyn SpeechSynthesizer>> {
    let url = match args.tts_url.as_deref().map(str::trim).filter(|u| !u.is_empty()) {
        Some(url) => url.to_string(),
        None => {
            info!("TTS_URL not set, replies will use native speech synthesis");
            return None;
        }
    };
    let config = TtsConfig {
        url,
        voice: args.tts_voice.clone(),
        speed: args.tts_speed,
    };
    match TtsClient::new(config) {
        Ok(client) => {
            info!("✅ TTS client configured (voice={})", args.tts_voice);
            Some(Arc::new(client))
        }
        Err(e) => {
            error!("Failed to create TTS client: {}", e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> TtsConfig {
        TtsConfig {
            url: "http://localhost:9/tts".into(),
            voice: DEFAULT_VOICE.into(),
            speed: 1.1,
        }
    }

    #[test]
    fn requires_an_endpoint() {
        let mut cfg = config();
        cfg.url = "  ".into();
        assert!(TtsClient::new(cfg).is_err());
    }

    #[test]
    fn request_body_carries_text_voice_and_speed() {
        let client = TtsClient::new(config()).unwrap();
        let body = serde_json::to_value(client.request_body("Olá")).unwrap();
        assert_eq!(body["text"], "Olá");
        assert_eq!(body["voice"], DEFAULT_VOICE);
        assert!((body["speed"].as_f64().unwrap() - 1.1).abs() < 1e-6);
    }

    #[tokio::test]
    async fn empty_text_is_rejected_without_a_request() {
        let client = TtsClient::new(config()).unwrap();
        assert!(client.synthesize("   ").await.is_err());
    }

    #[test]
    fn audio_is_base64_encoded_for_the_client() {
        let audio = SpeechAudio { bytes: b"ID3".to_vec(), mime_type: DEFAULT_MIME_TYPE.into() };
        assert_eq!(audio.to_base64(), "SUQz");
    }
}

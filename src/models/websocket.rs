use serde::{ Serialize, Deserialize };

use super::chat::Message;
use crate::voice::{ PlaybackOutcome, VoiceState };

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type")]
pub enum ClientMessage {
    #[serde(rename = "chat")] Chat {
        content: String,
    },
    #[serde(rename = "clear")]
    Clear,
    #[serde(rename = "history")]
    History,
    #[serde(rename = "voice_start")]
    VoiceStart,
    #[serde(rename = "voice_stop")]
    VoiceStop,
    /// Final transcript produced by the browser speech recognizer.
    #[serde(rename = "voice_transcript")] VoiceTranscript {
        text: String,
    },
    /// Raw error code reported by the recognizer, e.g. `not-allowed` or `no-speech`.
    #[serde(rename = "voice_error")] VoiceError {
        error: String,
    },
    #[serde(rename = "voice_recognition_ended")]
    VoiceRecognitionEnded,
    #[serde(rename = "voice_playback_ended")] VoicePlaybackEnded {
        #[serde(default)]
        audio_id: Option<String>,
        outcome: PlaybackOutcome,
    },
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type")]
pub enum ServerMessage {
    #[serde(rename = "response")] Response {
        message: Message,
    },
    #[serde(rename = "user_message")] UserMessage {
        message: Message,
    },
    #[serde(rename = "error")] Error {
        message: String,
    },
    #[serde(rename = "processing")]
    Processing,
    #[serde(rename = "history")] History {
        messages: Vec<Message>,
    },
    #[serde(rename = "cleared")] Cleared {
        removed: usize,
    },
    #[serde(rename = "voice_state")] VoiceState {
        state: VoiceState,
        active: bool,
    },
    #[serde(rename = "start_recognition")] StartRecognition {
        lang: String,
    },
    #[serde(rename = "stop_recognition")]
    StopRecognition,
    #[serde(rename = "abort_recognition")]
    AbortRecognition,
    #[serde(rename = "play_audio")] PlayAudio {
        audio_id: String,
        mime_type: String,
        /// Base64 encoded audio bytes.
        data: String,
    },
    #[serde(rename = "speak_native")] SpeakNative {
        text: String,
        lang: String,
        rate: f32,
        pitch: f32,
        volume: f32,
    },
    #[serde(rename = "cancel_speech")]
    CancelSpeech,
    #[serde(rename = "stop_all_audio")] StopAllAudio {
        audio_ids: Vec<String>,
        /// Also stop every audio/video element on the page, not just the session's clips.
        include_page_media: bool,
    },
    #[serde(rename = "permission_denied")]
    PermissionDenied,
}

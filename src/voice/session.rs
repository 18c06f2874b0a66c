use log::{ debug, info, warn };
use std::sync::{ Arc, Mutex, MutexGuard };
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::{ VoiceEffect, VoiceEvent, VoiceMachine, VoiceState, DEFAULT_SILENCE_TIMEOUT };
use crate::conversation::{ ConversationController, SendOutcome };
use crate::models::websocket::{ ClientMessage, ServerMessage };
use crate::tts::SpeechSynthesizer;

pub const DEFAULT_VOICE_ERROR: &str = "Erro ao processar. Tente novamente.";
pub const DEFAULT_SPEECH_LANG: &str = "pt-BR";

pub const NATIVE_RATE: f32 = 1.0;
pub const NATIVE_PITCH: f32 = 1.0;
pub const NATIVE_VOLUME: f32 = 0.9;

#[derive(Debug, Clone)]
pub struct VoiceConfig {
    pub silence_timeout: Duration,
    /// Recognition and native speech language, e.g. `pt-BR`.
    pub lang: String,
    /// Spoken instead of a reply when generation fails.
    pub error_text: String,
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            silence_timeout: DEFAULT_SILENCE_TIMEOUT,
            lang: DEFAULT_SPEECH_LANG.to_string(),
            error_text: DEFAULT_VOICE_ERROR.to_string(),
        }
    }
}

fn send(out_tx: &mpsc::UnboundedSender<ServerMessage>, message: ServerMessage) {
    if out_tx.send(message).is_err() {
        debug!("Voice frame dropped, connection closed");
    }
}

fn lock_audio(active: &Mutex<Vec<String>>) -> MutexGuard<'_, Vec<String>> {
    active.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Runs a [`VoiceMachine`] for one connection.
///
/// Client commands go out on `out_tx`. Delayed work (the silence timer,
/// recognition restarts, resuming after playback, finished replies) comes
/// back as [`VoiceEvent`]s on the receiver returned by [`VoiceSession::new`],
/// which the connection loop feeds into [`VoiceSession::handle`].
pub struct VoiceSession {
    machine: VoiceMachine,
    config: VoiceConfig,
    controller: Arc<ConversationController>,
    tts: Option<Arc<dyn SpeechSynthesizer>>,
    out_tx: mpsc::UnboundedSender<ServerMessage>,
    events_tx: mpsc::UnboundedSender<VoiceEvent>,
    silence_timer: Option<JoinHandle<()>>,
    /// Speech, restart and resume tasks. Aborted on stop.
    tasks: Vec<JoinHandle<()>>,
    active_audio: Arc<Mutex<Vec<String>>>,
}

impl VoiceSession {
    pub fn new(
        controller: Arc<ConversationController>,
        tts: Option<Arc<dyn SpeechSynthesizer>>,
        config: VoiceConfig,
        out_tx: mpsc::UnboundedSender<ServerMessage>
    ) -> (Self, mpsc::UnboundedReceiver<VoiceEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let session = Self {
            machine: VoiceMachine::new(config.silence_timeout),
            config,
            controller,
            tts,
            out_tx,
            events_tx,
            silence_timer: None,
            tasks: Vec::new(),
            active_audio: Arc::new(Mutex::new(Vec::new())),
        };
        (session, events_rx)
    }

    pub fn state(&self) -> VoiceState {
        self.machine.state()
    }

    pub fn is_active(&self) -> bool {
        self.machine.is_active()
    }

    pub fn permission_denied(&self) -> bool {
        self.machine.permission_denied()
    }

    pub fn active_audio(&self) -> Vec<String> {
        lock_audio(&self.active_audio).clone()
    }

    /// Feeds a voice frame from the client. Returns `false` for frames that
    /// are not about voice.
    pub fn handle_client_message(&mut self, message: &ClientMessage) -> bool {
        let event = match message {
            ClientMessage::VoiceStart => VoiceEvent::Start,
            ClientMessage::VoiceStop => VoiceEvent::Stop,
            ClientMessage::VoiceTranscript { text } => VoiceEvent::Transcript(text.clone()),
            ClientMessage::VoiceError { error } => VoiceEvent::RecognitionError(error.clone()),
            ClientMessage::VoiceRecognitionEnded => VoiceEvent::RecognitionEnded,
            ClientMessage::VoicePlaybackEnded { audio_id, outcome } => {
                if let Some(id) = audio_id {
                    lock_audio(&self.active_audio).retain(|a| a != id);
                }
                VoiceEvent::PlaybackEnded(*outcome)
            }
            _ => {
                return false;
            }
        };
        self.handle(event);
        true
    }

    pub fn handle(&mut self, event: VoiceEvent) {
        for effect in self.machine.handle(event) {
            self.apply(effect);
        }
    }

    fn apply(&mut self, effect: VoiceEffect) {
        match effect {
            VoiceEffect::StartRecognition => {
                send(&self.out_tx, ServerMessage::StartRecognition { lang: self.config.lang.clone() });
            }
            VoiceEffect::RestartRecognition { after } => {
                self.schedule(after, VoiceEvent::RecognitionRestartDue);
            }
            VoiceEffect::StopRecognition => send(&self.out_tx, ServerMessage::StopRecognition),
            VoiceEffect::AbortRecognition => send(&self.out_tx, ServerMessage::AbortRecognition),
            VoiceEffect::ArmSilenceTimer { id, after } => {
                self.cancel_silence_timer();
                let events_tx = self.events_tx.clone();
                self.silence_timer = Some(
                    tokio::spawn(async move {
                        tokio::time::sleep(after).await;
                        let _ = events_tx.send(VoiceEvent::SilenceElapsed(id));
                    })
                );
            }
            VoiceEffect::CancelSilenceTimer => self.cancel_silence_timer(),
            VoiceEffect::RequestReply { turn, text } => self.request_reply(turn, text),
            VoiceEffect::Speak(text) => self.speak(text),
            VoiceEffect::CancelSpeech => send(&self.out_tx, ServerMessage::CancelSpeech),
            VoiceEffect::StopAllAudio => {
                for task in self.tasks.drain(..) {
                    task.abort();
                }
                let audio_ids: Vec<String> = lock_audio(&self.active_audio).drain(..).collect();
                send(&self.out_tx, ServerMessage::StopAllAudio { audio_ids, include_page_media: true });
            }
            VoiceEffect::ScheduleResume { after } => {
                self.schedule(after, VoiceEvent::ResumeListening);
            }
            VoiceEffect::PermissionDenied => {
                warn!("Microphone permission denied for user {}", self.controller.user_id());
                send(&self.out_tx, ServerMessage::PermissionDenied);
            }
            VoiceEffect::StateChanged(state) => {
                send(&self.out_tx, ServerMessage::VoiceState {
                    state,
                    active: state != VoiceState::Idle,
                });
            }
        }
    }

    fn cancel_silence_timer(&mut self) {
        if let Some(timer) = self.silence_timer.take() {
            timer.abort();
        }
    }

    fn track(&mut self, task: JoinHandle<()>) {
        self.tasks.retain(|t| !t.is_finished());
        self.tasks.push(task);
    }

    fn schedule(&mut self, after: Duration, event: VoiceEvent) {
        let events_tx = self.events_tx.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let _ = events_tx.send(event);
        });
        self.track(task);
    }

    /// Replies always finish so the conversation never stays loading. A
    /// reply for an abandoned turn is dropped by the machine.
    fn request_reply(&self, turn: u64, text: String) {
        let controller = Arc::clone(&self.controller);
        let out_tx = self.out_tx.clone();
        let events_tx = self.events_tx.clone();
        let error_text = self.config.error_text.clone();
        tokio::spawn(async move {
            let spoken = match controller.send(&text).await {
                SendOutcome::Replied { user, reply } => {
                    send(&out_tx, ServerMessage::UserMessage { message: user });
                    let spoken = reply.content.clone();
                    send(&out_tx, ServerMessage::Response { message: reply });
                    spoken
                }
                SendOutcome::Failed { user, reply, error } => {
                    warn!("Voice reply failed: {}", error);
                    send(&out_tx, ServerMessage::UserMessage { message: user });
                    send(&out_tx, ServerMessage::Response { message: reply });
                    error_text
                }
                SendOutcome::Rejected => {
                    warn!("Voice transcript rejected, another message is in flight");
                    error_text
                }
                SendOutcome::Discarded => {
                    debug!("Voice reply dropped, the conversation was cleared");
                    error_text
                }
            };
            let _ = events_tx.send(VoiceEvent::ReplyReady { turn, text: spoken });
        });
    }

    fn speak(&mut self, text: String) {
        let tts = self.tts.clone();
        let out_tx = self.out_tx.clone();
        let active_audio = Arc::clone(&self.active_audio);
        let lang = self.config.lang.clone();
        let task = tokio::spawn(async move {
            if let Some(tts) = tts {
                match tts.synthesize(&text).await {
                    Ok(audio) => {
                        let audio_id = format!("audio_{}", Uuid::new_v4());
                        lock_audio(&active_audio).push(audio_id.clone());
                        info!("Playing {} bytes of synthesized speech", audio.bytes.len());
                        send(&out_tx, ServerMessage::PlayAudio {
                            audio_id,
                            mime_type: audio.mime_type.clone(),
                            data: audio.to_base64(),
                        });
                        return;
                    }
                    Err(e) => {
                        warn!("TTS failed, falling back to native speech: {}", e);
                    }
                }
            }
            send(&out_tx, ServerMessage::SpeakNative {
                text,
                lang,
                rate: NATIVE_RATE,
                pitch: NATIVE_PITCH,
                volume: NATIVE_VOLUME,
            });
        });
        self.track(task);
    }
}

impl Drop for VoiceSession {
    fn drop(&mut self) {
        self.cancel_silence_timer();
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::ReplyGenerator;
    use crate::models::chat::Message;
    use crate::tts::SpeechAudio;
    use crate::voice::PlaybackOutcome;
    use async_trait::async_trait;
    use std::error::Error;
    use tokio::time::Instant;

    struct EchoGenerator;

    #[async_trait]
    impl ReplyGenerator for EchoGenerator {
        async fn generate_reply(
            &self,
            _user_id: &str,
            _history: &[Message],
            text: &str
        ) -> Result<String, Box<dyn Error + Send + Sync>> {
            Ok(format!("eco: {}", text))
        }
    }

    struct FailingGenerator;

    #[async_trait]
    impl ReplyGenerator for FailingGenerator {
        async fn generate_reply(
            &self,
            _user_id: &str,
            _history: &[Message],
            _text: &str
        ) -> Result<String, Box<dyn Error + Send + Sync>> {
            Err("gateway down".into())
        }
    }

    struct GatedGenerator {
        gate: Arc<tokio::sync::Notify>,
    }

    #[async_trait]
    impl ReplyGenerator for GatedGenerator {
        async fn generate_reply(
            &self,
            _user_id: &str,
            _history: &[Message],
            text: &str
        ) -> Result<String, Box<dyn Error + Send + Sync>> {
            self.gate.notified().await;
            Ok(format!("eco: {}", text))
        }
    }

    struct FakeTts {
        fail: bool,
    }

    #[async_trait]
    impl SpeechSynthesizer for FakeTts {
        async fn synthesize(&self, _text: &str) -> Result<SpeechAudio, Box<dyn Error + Send + Sync>> {
            if self.fail {
                return Err("tts unavailable".into());
            }
            Ok(SpeechAudio { bytes: vec![1, 2, 3], mime_type: "audio/mpeg".into() })
        }
    }

    type Harness = (
        VoiceSession,
        mpsc::UnboundedReceiver<VoiceEvent>,
        mpsc::UnboundedReceiver<ServerMessage>,
    );

    fn harness(generator: Arc<dyn ReplyGenerator>, tts: Option<Arc<dyn SpeechSynthesizer>>) -> Harness {
        let controller = Arc::new(ConversationController::new("u1", generator, None));
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (session, events_rx) = VoiceSession::new(controller, tts, VoiceConfig::default(), out_tx);
        (session, events_rx, out_rx)
    }

    fn drain(out: &mut mpsc::UnboundedReceiver<ServerMessage>) -> Vec<ServerMessage> {
        let mut frames = Vec::new();
        while let Ok(frame) = out.try_recv() {
            frames.push(frame);
        }
        frames
    }

    fn voice_state(state: VoiceState) -> ServerMessage {
        ServerMessage::VoiceState { state, active: state != VoiceState::Idle }
    }

    /// Starts listening and speaks one transcript; returns once the reply is ready.
    async fn ask(
        session: &mut VoiceSession,
        events: &mut mpsc::UnboundedReceiver<VoiceEvent>,
        text: &str
    ) -> VoiceEvent {
        session.handle(VoiceEvent::Start);
        session.handle_client_message(&ClientMessage::VoiceTranscript { text: text.into() });
        events.recv().await.unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn full_turn_with_hosted_speech() {
        let (mut session, mut events, mut out) = harness(
            Arc::new(EchoGenerator),
            Some(Arc::new(FakeTts { fail: false }))
        );

        session.handle(VoiceEvent::Start);
        assert_eq!(drain(&mut out), vec![
            voice_state(VoiceState::Listening),
            ServerMessage::StartRecognition { lang: "pt-BR".into() },
        ]);

        session.handle_client_message(&ClientMessage::VoiceTranscript { text: "olá".into() });
        let ready = events.recv().await.unwrap();
        assert_eq!(ready, VoiceEvent::ReplyReady { turn: 1, text: "eco: olá".into() });

        let frames = drain(&mut out);
        assert_eq!(frames[0], ServerMessage::StopRecognition);
        assert_eq!(frames[1], voice_state(VoiceState::Processing));
        assert!(matches!(&frames[2], ServerMessage::UserMessage { message } if message.content == "olá"));
        assert!(matches!(&frames[3], ServerMessage::Response { message } if message.content == "eco: olá"));

        session.handle(ready);
        assert_eq!(out.recv().await.unwrap(), voice_state(VoiceState::Speaking));
        let audio_id = match out.recv().await.unwrap() {
            ServerMessage::PlayAudio { audio_id, mime_type, data } => {
                assert_eq!(mime_type, "audio/mpeg");
                assert_eq!(data, "AQID");
                audio_id
            }
            other => panic!("expected audio, got {:?}", other),
        };
        assert_eq!(session.active_audio(), vec![audio_id.clone()]);

        let ended_at = Instant::now();
        session.handle_client_message(&ClientMessage::VoicePlaybackEnded {
            audio_id: Some(audio_id),
            outcome: PlaybackOutcome::Completed,
        });
        assert!(session.active_audio().is_empty());

        let resume = events.recv().await.unwrap();
        assert_eq!(resume, VoiceEvent::ResumeListening);
        assert!(ended_at.elapsed() >= Duration::from_millis(150));
        assert!(ended_at.elapsed() < Duration::from_millis(300));

        session.handle(resume);
        assert_eq!(session.state(), VoiceState::Listening);

        // Only the timer armed on resuming is still alive.
        let silence = events.recv().await.unwrap();
        assert_eq!(silence, VoiceEvent::SilenceElapsed(2));
    }

    #[tokio::test(start_paused = true)]
    async fn silence_timeout_goes_idle() {
        let (mut session, mut events, mut out) = harness(Arc::new(EchoGenerator), None);
        let started = Instant::now();
        session.handle(VoiceEvent::Start);

        let event = events.recv().await.unwrap();
        assert_eq!(event, VoiceEvent::SilenceElapsed(1));
        assert!(started.elapsed() >= Duration::from_secs(10));

        session.handle(event);
        assert_eq!(session.state(), VoiceState::Idle);
        let frames = drain(&mut out);
        assert_eq!(&frames[frames.len() - 2..], &[
            ServerMessage::StopRecognition,
            voice_state(VoiceState::Idle),
        ]);
    }

    #[tokio::test(start_paused = true)]
    async fn recognition_end_restarts_without_new_timer() {
        let (mut session, mut events, mut out) = harness(Arc::new(EchoGenerator), None);
        session.handle(VoiceEvent::Start);
        drain(&mut out);

        session.handle_client_message(&ClientMessage::VoiceRecognitionEnded);
        let event = events.recv().await.unwrap();
        assert_eq!(event, VoiceEvent::RecognitionRestartDue);
        session.handle(event);
        assert_eq!(drain(&mut out), vec![ServerMessage::StartRecognition { lang: "pt-BR".into() }]);

        assert_eq!(events.recv().await.unwrap(), VoiceEvent::SilenceElapsed(1));
    }

    #[tokio::test(start_paused = true)]
    async fn tts_failure_falls_back_to_native_speech() {
        let (mut session, mut events, mut out) = harness(
            Arc::new(EchoGenerator),
            Some(Arc::new(FakeTts { fail: true }))
        );
        let ready = ask(&mut session, &mut events, "bom dia").await;
        drain(&mut out);
        session.handle(ready);

        assert_eq!(out.recv().await.unwrap(), voice_state(VoiceState::Speaking));
        assert_eq!(out.recv().await.unwrap(), ServerMessage::SpeakNative {
            text: "eco: bom dia".into(),
            lang: "pt-BR".into(),
            rate: 1.0,
            pitch: 1.0,
            volume: 0.9,
        });

        let ended_at = Instant::now();
        session.handle_client_message(&ClientMessage::VoicePlaybackEnded {
            audio_id: None,
            outcome: PlaybackOutcome::NativeCompleted,
        });
        assert_eq!(events.recv().await.unwrap(), VoiceEvent::ResumeListening);
        assert!(ended_at.elapsed() >= Duration::from_millis(800));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_reply_speaks_the_voice_error() {
        let (mut session, mut events, mut out) = harness(Arc::new(FailingGenerator), None);
        let ready = ask(&mut session, &mut events, "olá").await;
        assert_eq!(ready, VoiceEvent::ReplyReady { turn: 1, text: DEFAULT_VOICE_ERROR.into() });

        let frames = drain(&mut out);
        assert!(
            frames
                .iter()
                .any(
                    |f|
                        matches!(f, ServerMessage::Response { message } if message.content.starts_with("Desculpe"))
                )
        );
    }

    #[tokio::test(start_paused = true)]
    async fn stop_silences_everything() {
        let (mut session, mut events, mut out) = harness(
            Arc::new(EchoGenerator),
            Some(Arc::new(FakeTts { fail: false }))
        );
        let ready = ask(&mut session, &mut events, "olá").await;
        session.handle(ready);
        let audio_id = loop {
            if let ServerMessage::PlayAudio { audio_id, .. } = out.recv().await.unwrap() {
                break audio_id;
            }
        };
        session.handle_client_message(&ClientMessage::VoicePlaybackEnded {
            audio_id: None,
            outcome: PlaybackOutcome::Failed,
        });

        session.handle_client_message(&ClientMessage::VoiceStop);
        assert_eq!(drain(&mut out), vec![
            ServerMessage::AbortRecognition,
            ServerMessage::CancelSpeech,
            ServerMessage::StopAllAudio { audio_ids: vec![audio_id], include_page_media: true },
            voice_state(VoiceState::Idle),
        ]);

        // The pending resume was cancelled.
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(events.try_recv().is_err());
        assert_eq!(session.state(), VoiceState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn late_reply_from_a_stopped_turn_is_not_spoken() {
        let gate = Arc::new(tokio::sync::Notify::new());
        let (mut session, mut events, mut out) = harness(Arc::new(GatedGenerator { gate: gate.clone() }), None);

        session.handle(VoiceEvent::Start);
        session.handle_client_message(&ClientMessage::VoiceTranscript { text: "primeira".into() });
        session.handle_client_message(&ClientMessage::VoiceStop);
        session.handle(VoiceEvent::Start);
        session.handle_client_message(&ClientMessage::VoiceTranscript { text: "segunda".into() });

        // The first turn still holds the conversation, so the second is refused.
        let current = events.recv().await.unwrap();
        assert_eq!(current, VoiceEvent::ReplyReady { turn: 2, text: DEFAULT_VOICE_ERROR.into() });

        gate.notify_one();
        let stale = events.recv().await.unwrap();
        assert_eq!(stale, VoiceEvent::ReplyReady { turn: 1, text: "eco: primeira".into() });
        drain(&mut out);

        session.handle(stale);
        assert_eq!(session.state(), VoiceState::Processing);
        assert!(drain(&mut out).is_empty());

        session.handle(current);
        assert_eq!(out.recv().await.unwrap(), voice_state(VoiceState::Speaking));
        assert!(
            matches!(out.recv().await.unwrap(), ServerMessage::SpeakNative { text, .. } if text == DEFAULT_VOICE_ERROR)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn permission_denied_is_reported() {
        let (mut session, mut events, mut out) = harness(Arc::new(EchoGenerator), None);
        session.handle(VoiceEvent::Start);
        drain(&mut out);

        session.handle_client_message(&ClientMessage::VoiceError { error: "not-allowed".into() });
        assert_eq!(drain(&mut out), vec![ServerMessage::PermissionDenied, voice_state(VoiceState::Idle)]);
        assert!(session.permission_denied());

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn ignores_chat_frames() {
        let (mut session, _events, _out) = harness(Arc::new(EchoGenerator), None);
        assert!(!session.handle_client_message(&ClientMessage::History));
    }
}

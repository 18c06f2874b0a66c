//! Hands-free voice conversation.
//!
//! [`VoiceMachine`] is a pure state machine: every [`VoiceEvent`] yields the
//! next [`VoiceState`] plus a list of [`VoiceEffect`]s. It never sleeps or
//! does I/O. [`session::VoiceSession`] interprets the effects against a
//! connection: client commands, the silence timer, replies and speech.

pub mod session;

use log::debug;
use serde::{ Deserialize, Serialize };
use std::time::Duration;

pub use self::session::{ VoiceConfig, VoiceSession };

pub const DEFAULT_SILENCE_TIMEOUT: Duration = Duration::from_secs(10);

pub const RESUME_AFTER_AUDIO: Duration = Duration::from_millis(150);
pub const RESUME_AFTER_AUDIO_ERROR: Duration = Duration::from_millis(300);
pub const RESUME_AFTER_NATIVE_SPEECH: Duration = Duration::from_millis(800);

pub const RESTART_AFTER_ERROR: Duration = Duration::from_millis(200);
pub const RESTART_AFTER_END: Duration = Duration::from_millis(100);

/// Recognizer error codes meaning the microphone is off limits.
const PERMISSION_ERRORS: &[&str] = &["not-allowed", "permission-denied"];

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum VoiceState {
    Idle,
    Listening,
    Processing,
    Speaking,
}

/// How the client's playback of a reply finished.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PlaybackOutcome {
    /// Hosted TTS audio played to the end.
    Completed,
    /// Hosted TTS audio failed to load or play.
    Failed,
    /// The browser's native speech synthesis finished.
    NativeCompleted,
}

impl PlaybackOutcome {
    pub fn resume_delay(self) -> Duration {
        match self {
            PlaybackOutcome::Completed => RESUME_AFTER_AUDIO,
            PlaybackOutcome::Failed => RESUME_AFTER_AUDIO_ERROR,
            PlaybackOutcome::NativeCompleted => RESUME_AFTER_NATIVE_SPEECH,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum VoiceEvent {
    Start,
    Stop,
    Transcript(String),
    SilenceElapsed(u64),
    RecognitionError(String),
    RecognitionEnded,
    /// A delayed recognition restart is due.
    RecognitionRestartDue,
    /// The reply for the turn started by `RequestReply { turn, .. }`.
    ReplyReady {
        turn: u64,
        text: String,
    },
    PlaybackEnded(PlaybackOutcome),
    ResumeListening,
}

#[derive(Debug, Clone, PartialEq)]
pub enum VoiceEffect {
    StartRecognition,
    RestartRecognition {
        after: Duration,
    },
    StopRecognition,
    AbortRecognition,
    ArmSilenceTimer {
        id: u64,
        after: Duration,
    },
    CancelSilenceTimer,
    RequestReply {
        turn: u64,
        text: String,
    },
    Speak(String),
    CancelSpeech,
    StopAllAudio,
    ScheduleResume {
        after: Duration,
    },
    PermissionDenied,
    StateChanged(VoiceState),
}

pub fn is_permission_error(kind: &str) -> bool {
    PERMISSION_ERRORS.contains(&kind.trim())
}

#[derive(Debug, Clone)]
pub struct VoiceMachine {
    state: VoiceState,
    permission_denied: bool,
    silence_timeout: Duration,
    pending_timer: Option<u64>,
    next_timer_id: u64,
    /// Turn whose reply is awaited while processing.
    pending_turn: Option<u64>,
    next_turn_id: u64,
}

impl Default for VoiceMachine {
    fn default() -> Self {
        Self::new(DEFAULT_SILENCE_TIMEOUT)
    }
}

impl VoiceMachine {
    pub fn new(silence_timeout: Duration) -> Self {
        Self {
            state: VoiceState::Idle,
            permission_denied: false,
            silence_timeout,
            pending_timer: None,
            next_timer_id: 0,
            pending_turn: None,
            next_turn_id: 0,
        }
    }

    pub fn state(&self) -> VoiceState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.state != VoiceState::Idle
    }

    pub fn permission_denied(&self) -> bool {
        self.permission_denied
    }

    pub fn pending_timer(&self) -> Option<u64> {
        self.pending_timer
    }

    pub fn pending_turn(&self) -> Option<u64> {
        self.pending_turn
    }

    fn set_state(&mut self, state: VoiceState, effects: &mut Vec<VoiceEffect>) {
        if self.state != state {
            debug!("Voice state {:?} -> {:?}", self.state, state);
            self.state = state;
            effects.push(VoiceEffect::StateChanged(state));
        }
    }

    fn cancel_timer(&mut self, effects: &mut Vec<VoiceEffect>) {
        if self.pending_timer.take().is_some() {
            effects.push(VoiceEffect::CancelSilenceTimer);
        }
    }

    fn enter_listening(&mut self) -> Vec<VoiceEffect> {
        let mut effects = Vec::new();
        self.set_state(VoiceState::Listening, &mut effects);
        self.cancel_timer(&mut effects);
        self.next_timer_id += 1;
        self.pending_timer = Some(self.next_timer_id);
        effects.push(VoiceEffect::ArmSilenceTimer {
            id: self.next_timer_id,
            after: self.silence_timeout,
        });
        effects.push(VoiceEffect::StartRecognition);
        effects
    }

    /// Applies one event. Events that make no sense in the current state
    /// yield no effects.
    pub fn handle(&mut self, event: VoiceEvent) -> Vec<VoiceEffect> {
        let mut effects = Vec::new();
        match (self.state, event) {
            (_, VoiceEvent::Stop) => {
                self.cancel_timer(&mut effects);
                self.pending_turn = None;
                effects.push(VoiceEffect::AbortRecognition);
                effects.push(VoiceEffect::CancelSpeech);
                effects.push(VoiceEffect::StopAllAudio);
                self.set_state(VoiceState::Idle, &mut effects);
            }
            (VoiceState::Idle, VoiceEvent::Start) => {
                self.permission_denied = false;
                return self.enter_listening();
            }
            (VoiceState::Listening, VoiceEvent::Transcript(text)) => {
                let text = text.trim();
                if text.is_empty() {
                    return effects;
                }
                self.cancel_timer(&mut effects);
                effects.push(VoiceEffect::StopRecognition);
                self.set_state(VoiceState::Processing, &mut effects);
                self.next_turn_id += 1;
                self.pending_turn = Some(self.next_turn_id);
                effects.push(VoiceEffect::RequestReply { turn: self.next_turn_id, text: text.to_string() });
            }
            (VoiceState::Listening, VoiceEvent::SilenceElapsed(id)) => {
                if self.pending_timer != Some(id) {
                    debug!("Ignoring stale silence timer {}", id);
                    return effects;
                }
                self.pending_timer = None;
                effects.push(VoiceEffect::StopRecognition);
                self.set_state(VoiceState::Idle, &mut effects);
            }
            (VoiceState::Listening, VoiceEvent::RecognitionError(kind)) => {
                if is_permission_error(&kind) {
                    self.permission_denied = true;
                    self.cancel_timer(&mut effects);
                    effects.push(VoiceEffect::PermissionDenied);
                    self.set_state(VoiceState::Idle, &mut effects);
                } else {
                    debug!("Recognition error '{}', restarting", kind);
                    effects.push(VoiceEffect::RestartRecognition { after: RESTART_AFTER_ERROR });
                }
            }
            (VoiceState::Listening, VoiceEvent::RecognitionEnded) => {
                effects.push(VoiceEffect::RestartRecognition { after: RESTART_AFTER_END });
            }
            (VoiceState::Listening, VoiceEvent::RecognitionRestartDue) => {
                effects.push(VoiceEffect::StartRecognition);
            }
            (VoiceState::Processing, VoiceEvent::ReplyReady { turn, text }) => {
                if self.pending_turn != Some(turn) {
                    debug!("Ignoring reply for stale turn {}", turn);
                    return effects;
                }
                self.pending_turn = None;
                self.set_state(VoiceState::Speaking, &mut effects);
                effects.push(VoiceEffect::Speak(text));
            }
            (VoiceState::Speaking, VoiceEvent::PlaybackEnded(outcome)) => {
                effects.push(VoiceEffect::ScheduleResume { after: outcome.resume_delay() });
            }
            (VoiceState::Speaking, VoiceEvent::ResumeListening) => {
                return self.enter_listening();
            }
            (state, event) => {
                debug!("Voice event {:?} ignored in state {:?}", event, state);
            }
        }
        effects
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn listening() -> VoiceMachine {
        let mut machine = VoiceMachine::default();
        machine.handle(VoiceEvent::Start);
        machine
    }

    #[test]
    fn start_arms_one_timer_and_listens() {
        let mut machine = VoiceMachine::default();
        let effects = machine.handle(VoiceEvent::Start);
        assert_eq!(effects, vec![
            VoiceEffect::StateChanged(VoiceState::Listening),
            VoiceEffect::ArmSilenceTimer { id: 1, after: DEFAULT_SILENCE_TIMEOUT },
            VoiceEffect::StartRecognition,
        ]);
        assert_eq!(machine.pending_timer(), Some(1));

        assert!(machine.handle(VoiceEvent::Start).is_empty());
    }

    #[test]
    fn transcript_moves_to_processing() {
        let mut machine = listening();
        let effects = machine.handle(VoiceEvent::Transcript("  que horas são ".into()));
        assert_eq!(effects, vec![
            VoiceEffect::CancelSilenceTimer,
            VoiceEffect::StopRecognition,
            VoiceEffect::StateChanged(VoiceState::Processing),
            VoiceEffect::RequestReply { turn: 1, text: "que horas são".into() },
        ]);
        assert_eq!(machine.pending_timer(), None);
        assert_eq!(machine.pending_turn(), Some(1));
    }

    #[test]
    fn blank_transcript_is_ignored() {
        let mut machine = listening();
        assert!(machine.handle(VoiceEvent::Transcript("   ".into())).is_empty());
        assert_eq!(machine.state(), VoiceState::Listening);
    }

    #[test]
    fn silence_returns_to_idle_but_stale_timers_do_not() {
        let mut machine = listening();
        assert!(machine.handle(VoiceEvent::SilenceElapsed(7)).is_empty());
        assert_eq!(machine.state(), VoiceState::Listening);

        let effects = machine.handle(VoiceEvent::SilenceElapsed(1));
        assert_eq!(effects, vec![
            VoiceEffect::StopRecognition,
            VoiceEffect::StateChanged(VoiceState::Idle),
        ]);
        assert!(!machine.is_active());
    }

    #[test]
    fn recognition_errors_restart_without_rearming() {
        let mut machine = listening();
        assert_eq!(machine.handle(VoiceEvent::RecognitionError("no-speech".into())), vec![
            VoiceEffect::RestartRecognition { after: RESTART_AFTER_ERROR },
        ]);
        assert_eq!(machine.handle(VoiceEvent::RecognitionEnded), vec![
            VoiceEffect::RestartRecognition { after: RESTART_AFTER_END },
        ]);
        assert_eq!(machine.handle(VoiceEvent::RecognitionRestartDue), vec![
            VoiceEffect::StartRecognition,
        ]);
        assert_eq!(machine.pending_timer(), Some(1));
    }

    #[test]
    fn permission_errors_stop_listening() {
        let mut machine = listening();
        let effects = machine.handle(VoiceEvent::RecognitionError("not-allowed".into()));
        assert_eq!(effects, vec![
            VoiceEffect::CancelSilenceTimer,
            VoiceEffect::PermissionDenied,
            VoiceEffect::StateChanged(VoiceState::Idle),
        ]);
        assert!(machine.permission_denied());

        machine.handle(VoiceEvent::Start);
        assert!(!machine.permission_denied());
    }

    #[test]
    fn full_turn_resumes_listening_with_a_fresh_timer() {
        let mut machine = listening();
        machine.handle(VoiceEvent::Transcript("olá".into()));
        assert_eq!(machine.handle(VoiceEvent::ReplyReady { turn: 1, text: "Oi!".into() }), vec![
            VoiceEffect::StateChanged(VoiceState::Speaking),
            VoiceEffect::Speak("Oi!".into()),
        ]);
        assert_eq!(machine.handle(VoiceEvent::PlaybackEnded(PlaybackOutcome::NativeCompleted)), vec![
            VoiceEffect::ScheduleResume { after: RESUME_AFTER_NATIVE_SPEECH },
        ]);
        let effects = machine.handle(VoiceEvent::ResumeListening);
        assert_eq!(effects[0], VoiceEffect::StateChanged(VoiceState::Listening));
        assert!(effects.contains(&VoiceEffect::ArmSilenceTimer { id: 2, after: DEFAULT_SILENCE_TIMEOUT }));
        assert_eq!(machine.pending_timer(), Some(2));
    }

    #[test]
    fn playback_delays_depend_on_outcome() {
        assert_eq!(PlaybackOutcome::Completed.resume_delay(), Duration::from_millis(150));
        assert_eq!(PlaybackOutcome::Failed.resume_delay(), Duration::from_millis(300));
        assert_eq!(PlaybackOutcome::NativeCompleted.resume_delay(), Duration::from_millis(800));
    }

    #[test]
    fn stop_from_any_state_goes_idle() {
        let mut machine = listening();
        let effects = machine.handle(VoiceEvent::Stop);
        assert_eq!(effects, vec![
            VoiceEffect::CancelSilenceTimer,
            VoiceEffect::AbortRecognition,
            VoiceEffect::CancelSpeech,
            VoiceEffect::StopAllAudio,
            VoiceEffect::StateChanged(VoiceState::Idle),
        ]);

        let mut machine = listening();
        machine.handle(VoiceEvent::Transcript("olá".into()));
        machine.handle(VoiceEvent::Stop);
        assert_eq!(machine.state(), VoiceState::Idle);
        assert!(machine.handle(VoiceEvent::ReplyReady { turn: 1, text: "tarde demais".into() }).is_empty());
    }

    #[test]
    fn replies_from_an_abandoned_turn_are_ignored() {
        let mut machine = listening();
        machine.handle(VoiceEvent::Transcript("primeira".into()));
        machine.handle(VoiceEvent::Stop);
        machine.handle(VoiceEvent::Start);
        let effects = machine.handle(VoiceEvent::Transcript("segunda".into()));
        assert!(effects.contains(&VoiceEffect::RequestReply { turn: 2, text: "segunda".into() }));

        assert!(machine.handle(VoiceEvent::ReplyReady { turn: 1, text: "antiga".into() }).is_empty());
        assert_eq!(machine.state(), VoiceState::Processing);

        assert_eq!(machine.handle(VoiceEvent::ReplyReady { turn: 2, text: "nova".into() }), vec![
            VoiceEffect::StateChanged(VoiceState::Speaking),
            VoiceEffect::Speak("nova".into()),
        ]);
        assert_eq!(machine.pending_turn(), None);
    }

    #[test]
    fn never_more_than_one_pending_timer() {
        let mut machine = VoiceMachine::default();
        let mut armed = 0;
        let mut cancelled = 0;
        let script = vec![
            VoiceEvent::Start,
            VoiceEvent::RecognitionEnded,
            VoiceEvent::Transcript("um".into()),
            VoiceEvent::ReplyReady { turn: 1, text: "dois".into() },
            VoiceEvent::PlaybackEnded(PlaybackOutcome::Completed),
            VoiceEvent::ResumeListening,
            VoiceEvent::SilenceElapsed(1),
            VoiceEvent::Transcript("três".into()),
            VoiceEvent::Stop,
            VoiceEvent::Start
        ];
        for event in script {
            for effect in machine.handle(event) {
                match effect {
                    VoiceEffect::ArmSilenceTimer { .. } => {
                        armed += 1;
                    }
                    VoiceEffect::CancelSilenceTimer => {
                        cancelled += 1;
                    }
                    _ => {}
                }
            }
            assert!(armed - cancelled <= 1);
        }
        assert_eq!(armed - cancelled, 1);
    }
}

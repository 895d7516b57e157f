//! Session orchestration.
//!
//! One session owns one conversation: it scores inbound audio, opens a
//! transcription stream per utterance, decides when the user's turn is
//! over, and drives reply generation and synthesis for the agent's turn.
//! A `SpeechStarted` while the agent has audible output is a barge-in;
//! before any output it retracts the turn-end decision instead, and the
//! user's earlier words are carried into the resumed utterance.
//!
//! At most one turn generates or speaks at a time. A violation of that
//! invariant aborts the session rather than letting two replies interleave.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use futures::StreamExt;
use tokio::sync::{broadcast, mpsc};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::RuntimeConfig;
use crate::core::audio::{flush_playback, AudioFrame, FrameBus};
use crate::core::collaborators::{
    call_with_retry, ChatMessage, EndOfTurnModel, LanguageModel, RetryPolicy, RevisionStream,
    Role, SpeechSynthesizer, Transcriber, VoiceActivityScorer,
};
use crate::core::eot::EndOfTurnEstimator;
use crate::core::events::SessionEvent;
use crate::core::gate::{GateEvent, SpeechGate};
use crate::core::reply::{ReplyGenerator, ReplyOutcome, SegmentSink};
use crate::core::synth::{SynthReport, SynthesisPipeline};
use crate::core::transcript::{Transcript, TranscriptRevision};
use crate::core::turn::{SessionState, Turn, TurnOutcome};
use crate::errors::{AgentError, AgentResult};
use crate::tools::{ToolDispatcher, ToolRegistry};

const TICK: Duration = Duration::from_millis(50);

/// The model endpoints a session talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub scorer: Arc<dyn VoiceActivityScorer>,
    pub transcriber: Arc<dyn Transcriber>,
    pub end_of_turn: Arc<dyn EndOfTurnModel>,
    pub language_model: Arc<dyn LanguageModel>,
    pub synthesizer: Arc<dyn SpeechSynthesizer>,
}

/// An utterance in flight: the frame feed into the transcriber and the
/// revision stream coming back.
struct Utterance {
    frames_tx: mpsc::Sender<AudioFrame>,
    revisions: RevisionStream,
    transcript: Transcript,
    started_at_ms: u64,
}

/// The one turn currently generating or speaking.
struct ActiveTurn {
    turn: Turn,
    token: CancellationToken,
    produced: Arc<AtomicBool>,
    handle: JoinHandle<AgentResult<(ReplyOutcome, SynthReport)>>,
    _pump: JoinHandle<()>,
}

pub struct Session {
    config: RuntimeConfig,
    collaborators: Collaborators,
    generator: Arc<ReplyGenerator>,
    pipeline: Arc<SynthesisPipeline>,
    retry: RetryPolicy,
    call_timeout: Duration,
    /// Token of the active turn, swapped whole on each turn boundary
    active_token: ArcSwap<CancellationToken>,
    events_tx: broadcast::Sender<SessionEvent>,
}

impl Session {
    pub fn new(
        config: RuntimeConfig,
        collaborators: Collaborators,
        registry: Arc<ToolRegistry>,
    ) -> AgentResult<Self> {
        config.validate()?;
        let retry = RetryPolicy {
            attempts: config.session.retry_attempts,
            initial_delay: Duration::from_millis(config.session.retry_initial_delay_ms),
            max_delay: Duration::from_millis(config.session.retry_max_delay_ms),
            ..Default::default()
        };
        let call_timeout = Duration::from_millis(config.session.collaborator_timeout_ms);
        let dispatcher = Arc::new(ToolDispatcher::new(registry, call_timeout));
        let (events_tx, _) = broadcast::channel(64);
        let generator = Arc::new(ReplyGenerator::new(
            Arc::clone(&collaborators.language_model),
            dispatcher,
            config.reply.clone(),
            retry.clone(),
            call_timeout,
            events_tx.clone(),
        ));
        let pipeline = Arc::new(SynthesisPipeline::new(
            Arc::clone(&collaborators.synthesizer),
            config.synth.clone(),
            retry.clone(),
            call_timeout,
        ));
        Ok(Self {
            config,
            collaborators,
            generator,
            pipeline,
            retry,
            call_timeout,
            active_token: ArcSwap::from_pointee(CancellationToken::new()),
            events_tx,
        })
    }

    /// Observability feed. Subscribe before `run`.
    pub fn events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events_tx.subscribe()
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events_tx.send(event);
    }

    /// Run the conversation until the shutdown token fires or the audio
    /// transport closes. Returns every turn the session saw, in order.
    pub async fn run(
        self,
        bus: &mut FrameBus,
        shutdown: CancellationToken,
    ) -> AgentResult<Vec<Turn>> {
        let mut input_rx = bus
            .take_input()
            .ok_or(AgentError::ChannelClosed("audio input"))?;
        let output_tx = bus.output_sender();

        let mut gate = SpeechGate::new(self.config.gate.clone());
        let estimator = EndOfTurnEstimator::new(self.config.eot.clone());
        let mut state = SessionState::Idle;
        let mut history: Vec<ChatMessage> = Vec::new();
        let mut turns: Vec<Turn> = Vec::new();
        let mut utterance: Option<Utterance> = None;
        let mut active: Option<ActiveTurn> = None;
        let mut carryover: Option<String> = None;
        let mut tick = tokio::time::interval(TICK);

        // Session clock: last frame timestamp plus wall time since it
        let mut last_frame_ts: u64 = 0;
        let mut last_frame_at = Instant::now();

        info!(%state, "session started");
        if let Some(instruction) = self.config.reply.greeting_instruction.clone() {
            info!("opening with greeting turn");
            let turn = Turn::agent_initiated(0);
            self.emit(SessionEvent::TurnStarted { turn_id: turn.id });
            active = Some(self.start_turn(turn, history.clone(), Some(instruction), &output_tx));
            state = SessionState::Generating;
        } else {
            state = SessionState::Listening;
        }
        debug!(%state, "session ready");

        loop {
            let now_ms = last_frame_ts + last_frame_at.elapsed().as_millis() as u64;

            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!("session shutdown requested");
                    if let Some(mut act) = active.take() {
                        act.token.cancel();
                        let joined = (&mut act.handle).await;
                        self.complete_turn(act, joined, now_ms, &mut history, &mut turns, &output_tx)
                            .await?;
                    }
                    break;
                }

                frame = input_rx.recv() => {
                    let Some(frame) = frame else {
                        debug!("audio transport closed");
                        if let Some(act) = active.as_ref() {
                            act.token.cancel();
                        }
                        if let Some(mut act) = active.take() {
                            let joined = (&mut act.handle).await;
                            self.complete_turn(act, joined, now_ms, &mut history, &mut turns, &output_tx)
                                .await?;
                        }
                        break;
                    };
                    last_frame_ts = frame.timestamp_ms;
                    last_frame_at = Instant::now();

                    if let Some(u) = utterance.as_ref() {
                        // A closed stream just means the engine finished first
                        let _ = u.frames_tx.send(frame.clone()).await;
                    }
                    let scored =
                        tokio::time::timeout(self.call_timeout, self.collaborators.scorer.score(&frame))
                            .await;
                    let score = match scored {
                        Ok(Ok(score)) => score,
                        Ok(Err(e)) => {
                            warn!(error = %e, "VAD score failed, skipping frame");
                            continue;
                        }
                        Err(_) => {
                            warn!("VAD score timed out, skipping frame");
                            continue;
                        }
                    };
                    if let Some(event) = gate.process(score, frame.timestamp_ms) {
                        self.on_gate_event(
                            event, &mut state, &mut utterance, &mut active,
                            &mut carryover, &mut history, &mut turns, &output_tx,
                            &gate, &estimator,
                        ).await?;
                        // A retraction or barge-in may need a fresh utterance
                        if matches!(event, GateEvent::SpeechStarted { at_ms: _ })
                            && utterance.is_none()
                            && state == SessionState::Listening
                        {
                            utterance = self.open_utterance(frame.timestamp_ms, &shutdown).await?;
                        }
                    }
                }

                revision = next_revision(&mut utterance) => {
                    match revision {
                        Some(Ok(rev)) => {
                            if let Some(u) = utterance.as_mut() {
                                if let Err(e) = u.transcript.push(rev) {
                                    warn!(error = %e, "dropping out-of-order revision");
                                }
                            }
                            if state == SessionState::Listening {
                                if let Some(decision) = self
                                    .assess_turn_end(&utterance, &gate, &estimator, now_ms)
                                    .await
                                {
                                    if decision {
                                        self.begin_agent_turn(
                                            &mut state, &mut utterance, &mut active,
                                            &mut carryover, &mut history, &mut turns,
                                            &output_tx, now_ms,
                                        ).await?;
                                    }
                                }
                            }
                        }
                        Some(Err(e)) => {
                            warn!(error = %e, "transcription stream error");
                        }
                        None => {
                            // Engine signalled end of utterance
                            debug!("transcription stream ended");
                            if state == SessionState::Listening {
                                self.begin_agent_turn(
                                    &mut state, &mut utterance, &mut active,
                                    &mut carryover, &mut history, &mut turns,
                                    &output_tx, now_ms,
                                ).await?;
                            } else {
                                utterance = None;
                            }
                        }
                    }
                }

                joined = reply_finished(&mut active) => {
                    let act = match active.take() {
                        Some(act) => act,
                        None => continue,
                    };
                    self.complete_turn(act, joined, now_ms, &mut history, &mut turns, &output_tx)
                        .await?;
                    state = SessionState::Listening;
                    info!(%state, "turn closed");
                }

                _ = tick.tick() => {
                    if let Some(event) = gate.check_watchdog(now_ms) {
                        self.on_gate_event(
                            event, &mut state, &mut utterance, &mut active,
                            &mut carryover, &mut history, &mut turns, &output_tx,
                            &gate, &estimator,
                        ).await?;
                    }
                    // Re-assess as silence accumulates; the silence ceiling
                    // inside the estimator closes the turn on its own
                    if state == SessionState::Listening
                        && !gate.is_open()
                        && utterance.as_ref().map(|u| !u.transcript.is_empty()).unwrap_or(false)
                    {
                        if let Some(true) = self
                            .assess_turn_end(&utterance, &gate, &estimator, now_ms)
                            .await
                        {
                            self.begin_agent_turn(
                                &mut state, &mut utterance, &mut active, &mut carryover,
                                &mut history, &mut turns, &output_tx, now_ms,
                            ).await?;
                        }
                    }
                    if state == SessionState::Generating {
                        if let Some(act) = active.as_ref() {
                            if act.produced.load(Ordering::Acquire) {
                                state = SessionState::Speaking;
                                debug!(%state, "first audio dispatched");
                            }
                        }
                    }
                }
            }
        }

        state = SessionState::Idle;
        info!(%state, turns = turns.len(), "session ended");
        Ok(turns)
    }

    /// React to a gate boundary. SpeechStarted while a turn is active is a
    /// barge-in if the reply is audible, a retraction otherwise.
    #[allow(clippy::too_many_arguments)]
    async fn on_gate_event(
        &self,
        event: GateEvent,
        state: &mut SessionState,
        utterance: &mut Option<Utterance>,
        active: &mut Option<ActiveTurn>,
        carryover: &mut Option<String>,
        history: &mut Vec<ChatMessage>,
        turns: &mut Vec<Turn>,
        output_tx: &mpsc::Sender<AudioFrame>,
        gate: &SpeechGate,
        estimator: &EndOfTurnEstimator,
    ) -> AgentResult<()> {
        match event {
            GateEvent::SpeechStarted { at_ms } => {
                if let Some(mut act) = active.take() {
                    if act.produced.load(Ordering::Acquire) {
                        info!(at_ms, turn_id = %act.turn.id, "barge-in");
                        self.emit(SessionEvent::BargeIn {
                            turn_id: act.turn.id,
                            at_ms,
                        });
                        self.active_token.load().cancel();
                        *state = SessionState::Listening;
                        // The cancelled turn is recorded when its task acks
                        *active = Some(act);
                    } else {
                        info!(at_ms, "turn-end retracted, user resumed");
                        self.emit(SessionEvent::TurnRetracted {
                            turn_id: act.turn.id,
                        });
                        act.token.cancel();
                        if let Ok(Err(e)) = (&mut act.handle).await {
                            debug!(error = %e, "discarded error from retracted turn");
                        }
                        *carryover = Some(act.turn.transcript.text().to_string());
                        if act.turn.transcript.revision_count() > 0 {
                            // Drop the embryonic user entry from history
                            if matches!(history.last(), Some(m) if m.role == Role::User) {
                                history.pop();
                            }
                        }
                        *state = SessionState::Listening;
                    }
                }
            }
            GateEvent::SpeechEnded { at_ms } => {
                if *state == SessionState::Listening {
                    if let Some(true) = self
                        .assess_turn_end(utterance, gate, estimator, at_ms)
                        .await
                    {
                        self.begin_agent_turn(
                            state, utterance, active, carryover, history, turns, output_tx,
                            at_ms,
                        )
                        .await?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Score the current transcript against the eagerness threshold.
    /// None when there is nothing to assess yet.
    async fn assess_turn_end(
        &self,
        utterance: &Option<Utterance>,
        gate: &SpeechGate,
        estimator: &EndOfTurnEstimator,
        now_ms: u64,
    ) -> Option<bool> {
        let u = utterance.as_ref()?;
        if u.transcript.is_empty() {
            return None;
        }
        let scored = tokio::time::timeout(
            self.call_timeout,
            self.collaborators.end_of_turn.completeness(u.transcript.text()),
        )
        .await;
        let completeness = match scored {
            Ok(Ok(score)) => score,
            Ok(Err(e)) => {
                // Degraded: lean on the silence ceiling alone
                warn!(error = %e, "end-of-turn model failed");
                0.0
            }
            Err(_) => {
                warn!("end-of-turn model timed out");
                0.0
            }
        };
        Some(
            estimator
                .assess(completeness, gate.silence_run_ms(now_ms))
                .is_ended(),
        )
    }

    /// Open a transcription stream for a new utterance. A fresh frame
    /// channel is made per attempt so a failed open cannot leak a closed
    /// sender. Returns `None` when the session shut down mid-open.
    async fn open_utterance(
        &self,
        started_at_ms: u64,
        shutdown: &CancellationToken,
    ) -> AgentResult<Option<Utterance>> {
        let depth = self.config.session.frame_queue_depth;
        let transcriber = Arc::clone(&self.collaborators.transcriber);
        let opened = call_with_retry("stt", &self.retry, self.call_timeout, shutdown, || {
            let transcriber = Arc::clone(&transcriber);
            async move {
                let (frames_tx, frames_rx) = mpsc::channel(depth);
                let revisions = transcriber.stream_utterance(frames_rx).await?;
                Ok((frames_tx, revisions))
            }
        })
        .await?;
        Ok(opened.map(|(frames_tx, revisions)| {
            debug!(started_at_ms, "utterance opened");
            Utterance {
                frames_tx,
                revisions,
                transcript: Transcript::new(),
                started_at_ms,
            }
        }))
    }

    /// Close the utterance and launch the agent's turn for it.
    #[allow(clippy::too_many_arguments)]
    async fn begin_agent_turn(
        &self,
        state: &mut SessionState,
        utterance: &mut Option<Utterance>,
        active: &mut Option<ActiveTurn>,
        carryover: &mut Option<String>,
        history: &mut Vec<ChatMessage>,
        turns: &mut Vec<Turn>,
        output_tx: &mpsc::Sender<AudioFrame>,
        now_ms: u64,
    ) -> AgentResult<()> {
        let Some(u) = utterance.take() else {
            return Ok(());
        };
        let (transcript, text) = seal_transcript(u.transcript, carryover.take())?;
        if text.trim().is_empty() {
            debug!("empty utterance discarded");
            return Ok(());
        }
        *state = SessionState::Deciding;

        // A predecessor may still be tearing down after a barge-in; wait
        // for its ack. A live predecessor means the state machine broke.
        if let Some(mut act) = active.take() {
            if !act.token.is_cancelled() {
                return Err(AgentError::InvariantViolation(format!(
                    "turn {} still active when a new turn began",
                    act.turn.id
                )));
            }
            let joined = (&mut act.handle).await;
            self.complete_turn(act, joined, now_ms, history, turns, output_tx)
                .await?;
        }

        info!(%text, "user turn closed, generating reply");
        history.push(ChatMessage::new(Role::User, text));
        let turn = Turn::new(transcript, u.started_at_ms);
        self.emit(SessionEvent::TurnStarted { turn_id: turn.id });
        *active = Some(self.start_turn(turn, history.clone(), None, output_tx));
        *state = SessionState::Generating;
        Ok(())
    }

    /// Spawn generation + synthesis for one turn, with a playback pump that
    /// flushes queued audio the moment the turn is cancelled.
    fn start_turn(
        &self,
        turn: Turn,
        history: Vec<ChatMessage>,
        instruction: Option<String>,
        output_tx: &mpsc::Sender<AudioFrame>,
    ) -> ActiveTurn {
        let token = CancellationToken::new();
        self.active_token.store(Arc::new(token.clone()));

        let (seg_tx, seg_rx) = mpsc::channel(self.config.synth.segment_queue_depth);
        let (frame_tx, mut frame_rx) =
            mpsc::channel::<AudioFrame>(self.config.session.frame_queue_depth);
        let sink = SegmentSink::new(seg_tx);
        let produced = sink.produced_handle();

        let pump_token = token.clone();
        let pump_out = output_tx.clone();
        let pump = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = pump_token.cancelled() => {
                        let dropped = flush_playback(&mut frame_rx);
                        debug!(dropped, "playback flushed on cancellation");
                        break;
                    }
                    frame = frame_rx.recv() => match frame {
                        Some(frame) => {
                            if pump_out.send(frame).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
            }
        });

        let generator = Arc::clone(&self.generator);
        let pipeline = Arc::clone(&self.pipeline);
        let gen_token = token.clone();
        let turn_id = turn.id;
        let handle = tokio::spawn(async move {
            let generate = async {
                let result = generator
                    .generate(turn_id, history, instruction, &gen_token, &sink)
                    .await;
                drop(sink);
                result
            };
            let synthesize = pipeline.run(seg_rx, frame_tx, &gen_token);
            let (reply, report) = tokio::join!(generate, synthesize);
            let report = report?;
            Ok((reply?, report))
        });

        ActiveTurn {
            turn,
            token,
            produced,
            handle,
            _pump: pump,
        }
    }

    /// Fold a finished (or cancelled, or failed) turn task into the record.
    async fn complete_turn(
        &self,
        act: ActiveTurn,
        joined: Result<AgentResult<(ReplyOutcome, SynthReport)>, JoinError>,
        now_ms: u64,
        history: &mut Vec<ChatMessage>,
        turns: &mut Vec<Turn>,
        output_tx: &mpsc::Sender<AudioFrame>,
    ) -> AgentResult<()> {
        let ActiveTurn {
            mut turn, token, ..
        } = act;

        let result = joined.map_err(|e| {
            AgentError::InvariantViolation(format!("turn task panicked: {e}"))
        })?;

        let outcome = match result {
            Ok((reply, report)) => {
                debug!(
                    turn_id = %turn.id,
                    segments = report.segments,
                    frames = report.frames,
                    "turn audio delivered"
                );
                turn.reply_text = reply.text;
                turn.invocations = reply.invocations;
                if token.is_cancelled() {
                    TurnOutcome::Interrupted
                } else {
                    if !turn.reply_text.is_empty() {
                        history.push(ChatMessage::new(Role::Assistant, turn.reply_text.clone()));
                    }
                    TurnOutcome::Completed
                }
            }
            Err(e) if token.is_cancelled() => {
                debug!(error = %e, "error from cancelled turn ignored");
                TurnOutcome::Interrupted
            }
            Err(e) if e.is_turn_local() => {
                error!(error = %e, turn_id = %turn.id, "turn failed, speaking fallback");
                self.speak_fallback(output_tx).await;
                turn.reply_text = self.config.reply.fallback_utterance.clone();
                TurnOutcome::Failed
            }
            Err(e) => return Err(e),
        };

        turn.close(outcome, now_ms);
        self.emit(SessionEvent::TurnEnded {
            turn_id: turn.id,
            outcome,
        });
        info!(turn_id = %turn.id, %outcome, "turn recorded");
        turns.push(turn);
        Ok(())
    }

    /// Best-effort apology straight through the synthesizer. A synth outage
    /// here leaves the turn silent; there is nothing further to degrade to.
    async fn speak_fallback(&self, output_tx: &mpsc::Sender<AudioFrame>) {
        let text = self.config.reply.fallback_utterance.clone();
        match self.collaborators.synthesizer.synthesize(&text).await {
            Ok(mut frames) => {
                while let Some(frame) = frames.next().await {
                    match frame {
                        Ok(frame) => {
                            if output_tx.send(frame).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            warn!(error = %e, "fallback synthesis interrupted");
                            break;
                        }
                    }
                }
            }
            Err(e) => warn!(error = %e, "fallback synthesis unavailable"),
        }
    }
}

/// Seal the transcript, folding in text carried over from a retracted
/// decision. The combined text becomes the permanent final revision.
fn seal_transcript(
    mut transcript: Transcript,
    carryover: Option<String>,
) -> AgentResult<(Transcript, String)> {
    let mut text = transcript.text().to_string();
    if let Some(prev) = carryover.filter(|p| !p.trim().is_empty()) {
        text = if text.is_empty() {
            prev
        } else {
            format!("{prev} {text}")
        };
    }

    if transcript.is_sealed() {
        if transcript.final_text() == Some(text.as_str()) {
            return Ok((transcript, text));
        }
        let mut combined = Transcript::new();
        combined.push(TranscriptRevision::final_revision(text.clone(), 1))?;
        return Ok((combined, text));
    }
    let next = transcript.latest().map(|r| r.revision + 1).unwrap_or(1);
    transcript.push(TranscriptRevision::final_revision(text.clone(), next))?;
    Ok((transcript, text))
}

/// Pending forever while no utterance is open, so the select loop only
/// wakes for revisions when there is a stream to read.
async fn next_revision(
    utterance: &mut Option<Utterance>,
) -> Option<crate::core::collaborators::CollabResult<TranscriptRevision>> {
    match utterance {
        Some(u) => u.revisions.next().await,
        None => std::future::pending().await,
    }
}

async fn reply_finished(
    active: &mut Option<ActiveTurn>,
) -> Result<AgentResult<(ReplyOutcome, SynthReport)>, JoinError> {
    match active {
        Some(act) => (&mut act.handle).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_unsealed_transcript() {
        let mut t = Transcript::new();
        t.push(TranscriptRevision::partial("hello there", 1)).unwrap();
        let (sealed, text) = seal_transcript(t, None).unwrap();
        assert!(sealed.is_sealed());
        assert_eq!(text, "hello there");
    }

    #[test]
    fn seal_folds_in_carryover() {
        let mut t = Transcript::new();
        t.push(TranscriptRevision::final_revision("the weather", 1))
            .unwrap();
        let (sealed, text) =
            seal_transcript(t, Some("what is".to_string())).unwrap();
        assert_eq!(text, "what is the weather");
        assert_eq!(sealed.final_text(), Some("what is the weather"));
    }

    #[test]
    fn seal_keeps_already_sealed_without_carryover() {
        let mut t = Transcript::new();
        t.push(TranscriptRevision::partial("a", 3)).unwrap();
        t.push(TranscriptRevision::final_revision("a b", 7)).unwrap();
        let (sealed, text) = seal_transcript(t, None).unwrap();
        assert_eq!(sealed.revision_count(), 2);
        assert_eq!(text, "a b");
    }
}

//! End-to-end session flows against the in-process stub collaborators.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, StreamExt};
use serde_json::{json, Value};
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep, timeout, Duration};
use tokio_util::sync::CancellationToken;

use voiceturn::core::collaborators::stub::{
    EnergyScorer, HeuristicEndOfTurn, ScriptedLanguageModel, ScriptedTranscriber,
    SilenceSynthesizer,
};
use voiceturn::core::collaborators::{
    CollabError, CollabResult, EndOfTurnModel, LanguageModel, LlmUnit, RevisionStream,
    SpeechSynthesizer, SynthStream, Transcriber, UnitStream,
};
use voiceturn::core::transcript::TranscriptRevision;
use voiceturn::tools::{
    InputSchema, PropertySchema, Tool, ToolContext, ToolError, ToolRegistry, ToolSchema,
};
use voiceturn::{
    AudioFrame, Collaborators, FrameBus, RuntimeConfig, Session, SessionEvent, Turn, TurnOutcome,
};

const TEST_DEADLINE: Duration = Duration::from_secs(20);

fn loud_frame(ts: u64) -> AudioFrame {
    let pcm: Vec<u8> = std::iter::repeat(8_000i16.to_le_bytes())
        .take(320)
        .flatten()
        .collect();
    AudioFrame::new(Bytes::from(pcm), 16_000, 1, ts)
}

async fn send_speech(tx: &mpsc::Sender<AudioFrame>, ts: &mut u64, frames: usize) {
    for _ in 0..frames {
        if tx.send(loud_frame(*ts)).await.is_err() {
            return;
        }
        *ts += 20;
        sleep(Duration::from_millis(1)).await;
    }
}

async fn send_silence(tx: &mpsc::Sender<AudioFrame>, ts: &mut u64, frames: usize) {
    for _ in 0..frames {
        if tx.send(AudioFrame::silence(320, 16_000, *ts)).await.is_err() {
            return;
        }
        *ts += 20;
        sleep(Duration::from_millis(1)).await;
    }
}

struct Outcome {
    turns: Vec<Turn>,
    events: Vec<SessionEvent>,
    frames_played: usize,
}

/// Run a session to completion: the feeder drives audio in, playback is
/// drained and counted, and the session stops after `stop_after` turns end.
async fn drive<F, Fut>(
    config: RuntimeConfig,
    collaborators: Collaborators,
    registry: ToolRegistry,
    stop_after: usize,
    feeder: F,
) -> Outcome
where
    F: FnOnce(mpsc::Sender<AudioFrame>, watch::Receiver<usize>, CancellationToken) -> Fut,
    F: Send + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    let mut bus = FrameBus::new(256);
    let input = bus.input_sender();
    let mut output = bus.take_output().unwrap();

    let session = Session::new(config, collaborators, Arc::new(registry)).unwrap();
    let mut events_rx = session.events();
    let shutdown = CancellationToken::new();

    let events: Arc<Mutex<Vec<SessionEvent>>> = Arc::new(Mutex::new(Vec::new()));
    let events_sink = Arc::clone(&events);
    let stop = shutdown.clone();
    tokio::spawn(async move {
        let mut ended = 0;
        while let Ok(event) = events_rx.recv().await {
            let is_end = matches!(event, SessionEvent::TurnEnded { .. });
            events_sink.lock().unwrap().push(event);
            if is_end {
                ended += 1;
                if ended >= stop_after {
                    stop.cancel();
                }
            }
        }
    });

    let (frames_tx, frames_rx) = watch::channel(0usize);
    let drain = tokio::spawn(async move {
        let mut count = 0usize;
        while output.recv().await.is_some() {
            count += 1;
            let _ = frames_tx.send(count);
        }
        count
    });

    tokio::spawn(feeder(input, frames_rx, shutdown.clone()));

    let turns = timeout(TEST_DEADLINE, session.run(&mut bus, shutdown))
        .await
        .expect("session deadlocked")
        .expect("session aborted");
    drop(bus);
    let frames_played = drain.await.unwrap();

    let events = events.lock().unwrap().clone();
    Outcome {
        turns,
        events,
        frames_played,
    }
}

struct FakeWeather;

#[async_trait]
impl Tool for FakeWeather {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "lookup_weather".to_string(),
            description: "Look up current weather for a location".to_string(),
            parameters: InputSchema::new().property(
                "city_name",
                PropertySchema::string("The location to look up"),
                true,
            ),
        }
    }

    async fn run(&self, arguments: Value, _ctx: &ToolContext) -> Result<Value, ToolError> {
        assert_eq!(arguments["city_name"], "Paris");
        Ok(json!({"temperature_celsius": 18.0, "weather_report": "light rain"}))
    }
}

struct StuckTool;

#[async_trait]
impl Tool for StuckTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "slow_lookup".to_string(),
            description: "Never finishes in time".to_string(),
            parameters: InputSchema::new(),
        }
    }

    async fn run(&self, _arguments: Value, _ctx: &ToolContext) -> Result<Value, ToolError> {
        sleep(Duration::from_secs(60)).await;
        Ok(Value::Null)
    }
}

/// Synthesizer that paces frames out in real time, so a reply stays
/// audible long enough to interrupt.
struct PacedSynthesizer;

#[async_trait]
impl SpeechSynthesizer for PacedSynthesizer {
    async fn synthesize(&self, text: &str) -> CollabResult<SynthStream> {
        let frames = text.split_whitespace().count().max(1) * 3;
        Ok(stream::iter(0..frames)
            .then(|i| async move {
                sleep(Duration::from_millis(20)).await;
                Ok(AudioFrame::silence(320, 16_000, (i as u64) * 20))
            })
            .boxed())
    }
}

/// Language model that waits before answering, holding the retraction
/// window open.
struct DelayedLanguageModel {
    inner: ScriptedLanguageModel,
    delay: Duration,
}

#[async_trait]
impl LanguageModel for DelayedLanguageModel {
    async fn generate(
        &self,
        request: voiceturn::core::collaborators::GenerationRequest,
    ) -> CollabResult<UnitStream> {
        sleep(self.delay).await;
        self.inner.generate(request).await
    }
}

/// Transcriber that emits scripted partials and then keeps the stream
/// open, as a live engine would while the user is silent.
struct OpenEndedTranscriber {
    scripts: Mutex<Vec<Vec<TranscriptRevision>>>,
}

#[async_trait]
impl Transcriber for OpenEndedTranscriber {
    async fn stream_utterance(
        &self,
        mut frames: mpsc::Receiver<AudioFrame>,
    ) -> CollabResult<RevisionStream> {
        let script = self.scripts.lock().unwrap().remove(0);
        tokio::spawn(async move { while frames.recv().await.is_some() {} });
        Ok(stream::iter(script.into_iter().map(Ok))
            .chain(stream::pending())
            .boxed())
    }
}

/// Transcriber whose first stream open fails, as a dropped connection
/// would, and recovers on the retry.
struct FlakyTranscriber {
    inner: ScriptedTranscriber,
    failed: std::sync::atomic::AtomicBool,
}

#[async_trait]
impl Transcriber for FlakyTranscriber {
    async fn stream_utterance(
        &self,
        frames: mpsc::Receiver<AudioFrame>,
    ) -> CollabResult<RevisionStream> {
        if !self.failed.swap(true, std::sync::atomic::Ordering::SeqCst) {
            return Err(CollabError::new("stt connection dropped"));
        }
        self.inner.stream_utterance(frames).await
    }
}

/// End-of-turn model that never answers.
struct HungEndOfTurn;

#[async_trait]
impl EndOfTurnModel for HungEndOfTurn {
    async fn completeness(&self, _text: &str) -> CollabResult<f32> {
        std::future::pending().await
    }
}

fn base_collaborators(transcripts: Vec<&str>, llm: ScriptedLanguageModel) -> Collaborators {
    let scripts = transcripts
        .iter()
        .map(|t| {
            let words: Vec<&str> = t.split_whitespace().collect();
            let mut script: Vec<TranscriptRevision> = (1..words.len())
                .map(|i| TranscriptRevision::partial(words[..i].join(" "), i as u64))
                .collect();
            script.push(TranscriptRevision::final_revision(
                words.join(" "),
                words.len() as u64,
            ));
            script
        })
        .collect();
    Collaborators {
        scorer: Arc::new(EnergyScorer),
        transcriber: Arc::new(ScriptedTranscriber::new(scripts)),
        end_of_turn: Arc::new(HeuristicEndOfTurn),
        language_model: Arc::new(llm),
        synthesizer: Arc::new(SilenceSynthesizer::default()),
    }
}

#[tokio::test]
async fn weather_question_completes_with_tool_call() {
    let llm = ScriptedLanguageModel::new(vec![
        vec![LlmUnit::ToolCall {
            name: "lookup_weather".to_string(),
            arguments: json!({"city_name": "Paris"}),
        }],
        vec![LlmUnit::Text(
            "It's around eighteen degrees with light rain in Paris.".to_string(),
        )],
    ]);
    let collaborators = base_collaborators(vec!["what's the weather in Paris"], llm);
    let mut registry = ToolRegistry::new();
    registry.register(Arc::new(FakeWeather)).unwrap();

    let outcome = drive(
        RuntimeConfig::default(),
        collaborators,
        registry,
        1,
        |input, _frames, stop| async move {
            let mut ts = 0;
            send_speech(&input, &mut ts, 30).await;
            while !stop.is_cancelled() {
                send_silence(&input, &mut ts, 1).await;
            }
        },
    )
    .await;

    assert_eq!(outcome.turns.len(), 1);
    let turn = &outcome.turns[0];
    assert_eq!(turn.outcome, Some(TurnOutcome::Completed));
    assert_eq!(
        turn.transcript.final_text(),
        Some("what's the weather in Paris")
    );
    assert_eq!(turn.invocations.len(), 1);
    assert_eq!(turn.invocations[0].tool, "lookup_weather");
    assert_eq!(turn.invocations[0].arguments, json!({"city_name": "Paris"}));
    assert!(turn.invocations[0].succeeded());
    assert!(turn.reply_text.contains("eighteen degrees"));
    assert!(outcome.frames_played > 0);
    assert!(outcome
        .events
        .iter()
        .any(|e| matches!(e, SessionEvent::ToolInvoked { tool, .. } if tool == "lookup_weather")));
}

#[tokio::test]
async fn barge_in_interrupts_and_next_turn_completes() {
    let llm = ScriptedLanguageModel::new(vec![
        vec![LlmUnit::Text(
            "Let me tell you a very long story about many things that will take a while to say. \
             It keeps going with more and more detail. And even more after that."
                .to_string(),
        )],
        vec![LlmUnit::Text("Sure, stopping now.".to_string())],
    ]);
    let mut collaborators =
        base_collaborators(vec!["tell me a story", "never mind stop please"], llm);
    collaborators.synthesizer = Arc::new(PacedSynthesizer);

    let outcome = drive(
        RuntimeConfig::default(),
        collaborators,
        ToolRegistry::new(),
        2,
        |input, mut frames, stop| async move {
            let mut ts = 0;
            send_speech(&input, &mut ts, 30).await;
            send_silence(&input, &mut ts, 20).await;
            // Wait until the reply is audible, then talk over it
            let _ = frames.wait_for(|&n| n > 3).await;
            send_speech(&input, &mut ts, 30).await;
            while !stop.is_cancelled() {
                send_silence(&input, &mut ts, 1).await;
            }
        },
    )
    .await;

    assert_eq!(outcome.turns.len(), 2);
    assert_eq!(outcome.turns[0].outcome, Some(TurnOutcome::Interrupted));
    assert_eq!(outcome.turns[1].outcome, Some(TurnOutcome::Completed));
    assert!(outcome
        .events
        .iter()
        .any(|e| matches!(e, SessionEvent::BargeIn { .. })));

    // The long reply was cut off: far fewer frames than the full story
    // plus the short second reply would produce
    let story_words = 28;
    assert!(outcome.frames_played < story_words * 3);
}

#[tokio::test]
async fn tool_timeout_is_recovered_within_the_turn() {
    let llm = ScriptedLanguageModel::new(vec![
        vec![LlmUnit::ToolCall {
            name: "slow_lookup".to_string(),
            arguments: json!({}),
        }],
        vec![LlmUnit::Text(
            "That lookup is taking too long, sorry. Try again in a moment.".to_string(),
        )],
    ]);
    let collaborators = base_collaborators(vec!["look up my thing"], llm);
    let mut registry = ToolRegistry::new();
    registry.register(Arc::new(StuckTool)).unwrap();

    let mut config = RuntimeConfig::default();
    config.session.collaborator_timeout_ms = 200;

    let outcome = drive(config, collaborators, registry, 1, |input, _frames, stop| async move {
        let mut ts = 0;
        send_speech(&input, &mut ts, 30).await;
        while !stop.is_cancelled() {
            send_silence(&input, &mut ts, 1).await;
        }
    })
    .await;

    assert_eq!(outcome.turns.len(), 1);
    let turn = &outcome.turns[0];
    assert_eq!(turn.outcome, Some(TurnOutcome::Completed));
    assert_eq!(turn.invocations.len(), 1);
    assert!(!turn.invocations[0].succeeded());
    assert!(turn.invocations[0]
        .error
        .as_deref()
        .unwrap()
        .contains("timed out"));
    assert!(turn.reply_text.contains("taking too long"));
}

#[tokio::test]
async fn greeting_turn_precedes_listening() {
    let llm = ScriptedLanguageModel::new(vec![vec![LlmUnit::Text(
        "Hello there! How can I help you today?".to_string(),
    )]]);
    let collaborators = base_collaborators(vec![], llm);

    let mut config = RuntimeConfig::default();
    config.reply.greeting_instruction = Some("Greet the user and offer your assistance.".into());

    let outcome = drive(
        config,
        collaborators,
        ToolRegistry::new(),
        1,
        |input, _frames, stop| async move {
            let mut ts = 0;
            while !stop.is_cancelled() {
                send_silence(&input, &mut ts, 1).await;
            }
        },
    )
    .await;

    assert_eq!(outcome.turns.len(), 1);
    let turn = &outcome.turns[0];
    assert_eq!(turn.outcome, Some(TurnOutcome::Completed));
    assert!(turn.transcript.is_empty());
    assert!(turn.reply_text.contains("Hello there"));
    assert!(outcome.frames_played > 0);
}

#[tokio::test]
async fn silence_ceiling_closes_undecided_turn() {
    let llm = ScriptedLanguageModel::new(vec![vec![LlmUnit::Text("Go on.".to_string())]]);
    let mut collaborators = base_collaborators(vec![], llm);
    // Trailing conjunction keeps the completeness score near zero
    collaborators.transcriber = Arc::new(OpenEndedTranscriber {
        scripts: Mutex::new(vec![vec![TranscriptRevision::partial(
            "i was wondering and",
            1,
        )]]),
    });

    let mut config = RuntimeConfig::default();
    config.eot.eagerness = 0.9;
    config.eot.silence_ceiling_ms = 600;

    let outcome = drive(
        config,
        collaborators,
        ToolRegistry::new(),
        1,
        |input, _frames, stop| async move {
            let mut ts = 0;
            send_speech(&input, &mut ts, 30).await;
            while !stop.is_cancelled() {
                send_silence(&input, &mut ts, 1).await;
            }
        },
    )
    .await;

    assert_eq!(outcome.turns.len(), 1);
    let turn = &outcome.turns[0];
    assert_eq!(turn.outcome, Some(TurnOutcome::Completed));
    assert_eq!(turn.transcript.final_text(), Some("i was wondering and"));
}

#[tokio::test]
async fn speech_before_first_output_retracts_and_merges() {
    let llm = DelayedLanguageModel {
        inner: ScriptedLanguageModel::new(vec![
            vec![LlmUnit::Text("Paris is lovely.".to_string())],
            vec![LlmUnit::Text("Paris is lovely.".to_string())],
        ]),
        delay: Duration::from_millis(500),
    };
    let collaborators = Collaborators {
        scorer: Arc::new(EnergyScorer),
        transcriber: Arc::new(OpenEndedTranscriber {
            scripts: Mutex::new(vec![
                vec![TranscriptRevision::partial("tell me about paris", 1)],
                vec![TranscriptRevision::partial("please?", 1)],
            ]),
        }),
        end_of_turn: Arc::new(HeuristicEndOfTurn),
        language_model: Arc::new(llm),
        synthesizer: Arc::new(SilenceSynthesizer::default()),
    };

    let mut config = RuntimeConfig::default();
    config.eot.silence_ceiling_ms = 400;

    let outcome = drive(
        config,
        collaborators,
        ToolRegistry::new(),
        1,
        |input, _frames, stop| async move {
            let mut ts = 0;
            // First utterance, then enough silence to close the turn
            send_speech(&input, &mut ts, 10).await;
            send_silence(&input, &mut ts, 40).await;
            // Resume speaking before the delayed model produces anything
            send_speech(&input, &mut ts, 30).await;
            while !stop.is_cancelled() {
                send_silence(&input, &mut ts, 1).await;
            }
        },
    )
    .await;

    // The retracted decision never became a recorded turn
    assert_eq!(outcome.turns.len(), 1);
    let turn = &outcome.turns[0];
    assert_eq!(turn.outcome, Some(TurnOutcome::Completed));
    assert_eq!(
        turn.transcript.final_text(),
        Some("tell me about paris please?")
    );
    assert_eq!(turn.reply_text, "Paris is lovely.");
    assert!(!outcome
        .events
        .iter()
        .any(|e| matches!(e, SessionEvent::BargeIn { .. })));
    // The discarded turn still closed out its start event
    assert!(outcome
        .events
        .iter()
        .any(|e| matches!(e, SessionEvent::TurnRetracted { .. })));
}

#[tokio::test]
async fn transient_transcriber_outage_is_retried() {
    let llm = ScriptedLanguageModel::new(vec![vec![LlmUnit::Text(
        "Hello to you too.".to_string(),
    )]]);
    let mut collaborators = base_collaborators(vec![], llm);
    collaborators.transcriber = Arc::new(FlakyTranscriber {
        inner: ScriptedTranscriber::new(vec![vec![TranscriptRevision::final_revision(
            "hello there",
            1,
        )]]),
        failed: std::sync::atomic::AtomicBool::new(false),
    });

    let outcome = drive(
        RuntimeConfig::default(),
        collaborators,
        ToolRegistry::new(),
        1,
        |input, _frames, stop| async move {
            let mut ts = 0;
            send_speech(&input, &mut ts, 30).await;
            while !stop.is_cancelled() {
                send_silence(&input, &mut ts, 1).await;
            }
        },
    )
    .await;

    assert_eq!(outcome.turns.len(), 1);
    let turn = &outcome.turns[0];
    assert_eq!(turn.outcome, Some(TurnOutcome::Completed));
    assert_eq!(turn.transcript.final_text(), Some("hello there"));
}

#[tokio::test]
async fn hung_end_of_turn_model_does_not_stall_the_session() {
    let llm = ScriptedLanguageModel::new(vec![vec![LlmUnit::Text("Noted.".to_string())]]);
    let mut collaborators = base_collaborators(vec![], llm);
    collaborators.end_of_turn = Arc::new(HungEndOfTurn);
    collaborators.transcriber = Arc::new(OpenEndedTranscriber {
        scripts: Mutex::new(vec![vec![TranscriptRevision::partial("remember the milk", 1)]]),
    });

    let mut config = RuntimeConfig::default();
    config.session.collaborator_timeout_ms = 200;
    config.eot.eagerness = 0.9;
    config.eot.silence_ceiling_ms = 600;

    let outcome = drive(
        config,
        collaborators,
        ToolRegistry::new(),
        1,
        |input, _frames, stop| async move {
            let mut ts = 0;
            send_speech(&input, &mut ts, 30).await;
            while !stop.is_cancelled() {
                send_silence(&input, &mut ts, 1).await;
            }
        },
    )
    .await;

    // The silence ceiling closes the turn despite the dead model
    assert_eq!(outcome.turns.len(), 1);
    assert_eq!(outcome.turns[0].outcome, Some(TurnOutcome::Completed));
    assert_eq!(
        outcome.turns[0].transcript.final_text(),
        Some("remember the milk")
    );
}

#[tokio::test]
async fn sequential_turns_share_history() {
    let llm = ScriptedLanguageModel::new(vec![
        vec![LlmUnit::Text("I like blue.".to_string())],
        vec![LlmUnit::Text("Still blue.".to_string())],
    ]);
    let collaborators = base_collaborators(
        vec!["what's your favorite color", "are you sure about that"],
        llm,
    );

    let outcome = drive(
        RuntimeConfig::default(),
        collaborators,
        ToolRegistry::new(),
        2,
        |input, mut frames, stop| async move {
            let mut ts = 0;
            send_speech(&input, &mut ts, 30).await;
            send_silence(&input, &mut ts, 20).await;
            let _ = frames.wait_for(|&n| n > 0).await;
            // Let the first reply finish before speaking again
            send_silence(&input, &mut ts, 30).await;
            send_speech(&input, &mut ts, 30).await;
            while !stop.is_cancelled() {
                send_silence(&input, &mut ts, 1).await;
            }
        },
    )
    .await;

    assert_eq!(outcome.turns.len(), 2);
    assert!(outcome
        .turns
        .iter()
        .all(|t| t.outcome == Some(TurnOutcome::Completed)));
    let started = outcome
        .events
        .iter()
        .filter(|e| matches!(e, SessionEvent::TurnStarted { .. }))
        .count();
    assert_eq!(started, 2);
}

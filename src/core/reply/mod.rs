//! Reply generation.
//!
//! Drives the language model for one turn: streams text through the
//! segmenter into synthesis, runs tool calls through the dispatcher and
//! folds their results back into the model's context, and serializes any
//! proactive utterances a tool requests. The tool loop is bounded; a model
//! that keeps calling tools without producing text fails the turn.

pub mod segmenter;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

pub use segmenter::{ReplySegment, Segmenter};

use crate::config::ReplyConfig;
use crate::core::collaborators::{
    call_with_retry, ChatMessage, GenerationRequest, LanguageModel, LlmUnit, RetryPolicy, Role,
};
use crate::core::events::SessionEvent;
use crate::errors::{AgentError, AgentResult};
use crate::tools::{ToolContext, ToolDispatcher, ToolInvocation};

/// Where finished segments go, with a flag the session reads to tell a
/// retraction from a barge-in.
#[derive(Clone)]
pub struct SegmentSink {
    tx: mpsc::Sender<ReplySegment>,
    produced: Arc<AtomicBool>,
}

impl SegmentSink {
    pub fn new(tx: mpsc::Sender<ReplySegment>) -> Self {
        Self {
            tx,
            produced: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Whether any segment has been dispatched to synthesis. Once true the
    /// turn-end decision can no longer be retracted.
    pub fn has_produced(&self) -> bool {
        self.produced.load(Ordering::Acquire)
    }

    /// Shared flag for callers that outlive the sink.
    pub fn produced_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.produced)
    }

    async fn send(&self, segment: ReplySegment) -> AgentResult<()> {
        self.produced.store(true, Ordering::Release);
        self.tx
            .send(segment)
            .await
            .map_err(|_| AgentError::ChannelClosed("segment queue"))
    }
}

/// What one generation run produced.
#[derive(Debug, Default)]
pub struct ReplyOutcome {
    /// Full reply text actually dispatched to synthesis
    pub text: String,
    /// Tool calls made along the way, in order
    pub invocations: Vec<ToolInvocation>,
}

pub struct ReplyGenerator {
    llm: Arc<dyn LanguageModel>,
    dispatcher: Arc<ToolDispatcher>,
    config: ReplyConfig,
    retry: RetryPolicy,
    call_timeout: Duration,
    /// Tool activity is reported here as it happens, not at turn close
    events: broadcast::Sender<SessionEvent>,
}

impl ReplyGenerator {
    pub fn new(
        llm: Arc<dyn LanguageModel>,
        dispatcher: Arc<ToolDispatcher>,
        config: ReplyConfig,
        retry: RetryPolicy,
        call_timeout: Duration,
        events: broadcast::Sender<SessionEvent>,
    ) -> Self {
        Self {
            llm,
            dispatcher,
            config,
            retry,
            call_timeout,
            events,
        }
    }

    /// Generate one reply. Returns early with a partial outcome when the
    /// token fires; the caller inspects the token to tell the difference.
    ///
    /// `ToolLoopExceeded` and `CollaboratorUnavailable` are turn-fatal and
    /// bubble up for the session's fallback handling.
    pub async fn generate(
        &self,
        turn_id: Uuid,
        mut history: Vec<ChatMessage>,
        instruction: Option<String>,
        token: &CancellationToken,
        sink: &SegmentSink,
    ) -> AgentResult<ReplyOutcome> {
        let mut outcome = ReplyOutcome::default();
        let mut segmenter = Segmenter::new(&self.config);
        let mut tool_calls = 0u32;

        let (proactive_tx, mut proactive_rx) = mpsc::channel::<String>(4);
        let ctx = ToolContext::new(proactive_tx, token.clone());

        loop {
            let request = GenerationRequest {
                history: history.clone(),
                instruction: instruction.clone(),
                tools: self.dispatcher.schemas(),
            };
            let llm = Arc::clone(&self.llm);
            let stream = call_with_retry("llm", &self.retry, self.call_timeout, token, || {
                llm.generate(request.clone())
            })
            .await?;
            let Some(mut stream) = stream else {
                return Ok(outcome);
            };

            let mut pending_tool: Option<(String, serde_json::Value)> = None;
            loop {
                let unit = tokio::select! {
                    biased;
                    _ = token.cancelled() => return Ok(outcome),
                    unit = stream.next() => unit,
                };
                match unit {
                    Some(Ok(LlmUnit::Text(text))) => {
                        for segment in segmenter.push(&text) {
                            push_text(&mut outcome.text, &segment.text);
                            sink.send(segment).await?;
                        }
                    }
                    Some(Ok(LlmUnit::ToolCall { name, arguments })) => {
                        pending_tool = Some((name, arguments));
                        break;
                    }
                    Some(Err(e)) => {
                        return Err(AgentError::CollaboratorUnavailable {
                            collaborator: "llm",
                            reason: e.to_string(),
                        });
                    }
                    None => break,
                }
            }

            let Some((name, arguments)) = pending_tool else {
                // Stream ended on text: the reply is complete
                if let Some(tail) = segmenter.flush() {
                    push_text(&mut outcome.text, &tail.text);
                    sink.send(tail).await?;
                }
                return Ok(outcome);
            };

            tool_calls += 1;
            if tool_calls > self.config.max_tool_calls {
                return Err(AgentError::ToolLoopExceeded {
                    limit: self.config.max_tool_calls,
                });
            }

            info!(tool = %name, round = tool_calls, "model requested tool");
            let _ = self.events.send(SessionEvent::ToolInvoked {
                turn_id,
                tool: name.clone(),
            });
            let Some(invocation) = self.dispatcher.dispatch(&name, arguments, &ctx).await else {
                // Cancelled mid-call; the late result was discarded
                return Ok(outcome);
            };
            let _ = self.events.send(SessionEvent::ToolResult {
                turn_id,
                tool: invocation.tool.clone(),
                ok: invocation.succeeded(),
                latency_ms: invocation.latency_ms,
            });
            history.push(ChatMessage::new(Role::Tool, invocation.feedback()));
            outcome.invocations.push(invocation);

            // Serialize proactive utterances the tool requested before the
            // next generation round
            while let Ok(say) = proactive_rx.try_recv() {
                debug!("speaking proactive update");
                self.speak_instruction(&say, token, sink, &mut outcome)
                    .await?;
            }
        }
    }

    /// One text-only generation round for a proactive instruction.
    async fn speak_instruction(
        &self,
        instruction: &str,
        token: &CancellationToken,
        sink: &SegmentSink,
        outcome: &mut ReplyOutcome,
    ) -> AgentResult<()> {
        let request = GenerationRequest {
            history: Vec::new(),
            instruction: Some(instruction.to_string()),
            tools: Vec::new(),
        };
        let llm = Arc::clone(&self.llm);
        let stream = call_with_retry("llm", &self.retry, self.call_timeout, token, || {
            llm.generate(request.clone())
        })
        .await?;
        let Some(mut stream) = stream else {
            return Ok(());
        };

        let mut segmenter = Segmenter::new(&self.config);
        loop {
            let unit = tokio::select! {
                biased;
                _ = token.cancelled() => return Ok(()),
                unit = stream.next() => unit,
            };
            match unit {
                Some(Ok(LlmUnit::Text(text))) => {
                    for segment in segmenter.push(&text) {
                        push_text(&mut outcome.text, &segment.text);
                        sink.send(segment).await?;
                    }
                }
                // Tool calls are not honored in a proactive round
                Some(Ok(LlmUnit::ToolCall { name, .. })) => {
                    debug!(tool = %name, "ignoring tool call in proactive round");
                }
                Some(Err(e)) => {
                    return Err(AgentError::CollaboratorUnavailable {
                        collaborator: "llm",
                        reason: e.to_string(),
                    });
                }
                None => break,
            }
        }
        if let Some(tail) = segmenter.flush() {
            push_text(&mut outcome.text, &tail.text);
            sink.send(tail).await?;
        }
        Ok(())
    }
}

fn push_text(acc: &mut String, text: &str) {
    if !acc.is_empty() {
        acc.push(' ');
    }
    acc.push_str(text);
}

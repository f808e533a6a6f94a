//! Session orchestrator
//!
//! One worker per live session: a FIFO task queue, an event bus, a
//! cancellation token, and volatile scheduler state. Exactly one task
//! runs at a time within a session; tasks for distinct sessions run
//! concurrently. Workers are sticky (resolved personas and clients are
//! reused across tasks) and evicted on idle timeout or explicit close.

use crate::events::{EventBus, SessionEvent};
use crate::persona_runtime::{PersonaRuntime, ReplyEvent, ReplyMode, ReplyRequest};
use crate::scheduler::{next_turn, SchedulerState, TurnInput};
use crate::tools::ToolContext;
use chrono::Utc;
use parley_core::{
    collection_name, MessageRowId, ParleyError, Persona, Session, SessionId, StoreError,
};
use parley_store::{ConversationStore, PersonaStore};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Hard cap on history loaded per task, regardless of memory windows.
const MAX_HISTORY_HARD_CAP: usize = 128;

/// Orchestrator tunables; see the environment table in the service
/// crate for the corresponding variables.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Wall-clock deadline per LLM call.
    pub llm_timeout: Duration,
    /// Idle time after which a session's runtime binding is evicted.
    pub idle_eviction: Duration,
    /// Cap on history entries loaded per task.
    pub max_history: usize,
    /// Event-bus capacity per subscriber.
    pub event_buffer: usize,
    /// Fixed scheduler seed; random when absent.
    pub scheduler_seed: Option<u64>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            llm_timeout: Duration::from_secs(60),
            idle_eviction: Duration::from_secs(1800),
            max_history: MAX_HISTORY_HARD_CAP,
            event_buffer: 64,
            scheduler_seed: None,
        }
    }
}

impl OrchestratorConfig {
    /// Clamp to the hard history cap.
    pub fn effective_max_history(&self) -> usize {
        self.max_history.clamp(1, MAX_HISTORY_HARD_CAP)
    }
}

// ============================================================================
// WORKER PLUMBING
// ============================================================================

/// One queued turn.
struct TurnTask {
    content: String,
    target_personas: Option<Vec<String>>,
}

/// Handle to a live session worker.
#[derive(Clone)]
struct WorkerHandle {
    queue_tx: mpsc::Sender<TurnTask>,
    bus: EventBus,
    cancel: CancellationToken,
    last_activity: Arc<Mutex<Instant>>,
}

impl WorkerHandle {
    fn touch(&self) {
        *self.last_activity.lock().expect("clock poisoned") = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        self.last_activity
            .lock()
            .expect("clock poisoned")
            .elapsed()
    }
}

/// Everything a worker loop needs, cloned out of the orchestrator.
#[derive(Clone)]
struct WorkerContext {
    session: Session,
    personas: Arc<dyn PersonaStore>,
    conversations: Arc<dyn ConversationStore>,
    runtime: Arc<PersonaRuntime>,
    config: OrchestratorConfig,
    bus: EventBus,
    cancel: CancellationToken,
    last_activity: Arc<Mutex<Instant>>,
}

// ============================================================================
// ORCHESTRATOR
// ============================================================================

/// Per-process session orchestrator. Higher layers route by session id,
/// so each session's traffic lands on one process and its one worker.
pub struct SessionOrchestrator {
    personas: Arc<dyn PersonaStore>,
    conversations: Arc<dyn ConversationStore>,
    runtime: Arc<PersonaRuntime>,
    config: OrchestratorConfig,
    workers: Arc<Mutex<HashMap<String, WorkerHandle>>>,
}

impl SessionOrchestrator {
    pub fn new(
        personas: Arc<dyn PersonaStore>,
        conversations: Arc<dyn ConversationStore>,
        runtime: Arc<PersonaRuntime>,
        config: OrchestratorConfig,
    ) -> Self {
        let workers: Arc<Mutex<HashMap<String, WorkerHandle>>> = Arc::default();
        spawn_reaper(Arc::downgrade(&workers), config.idle_eviction);
        Self {
            personas,
            conversations,
            runtime,
            config,
            workers,
        }
    }

    /// Append the user message (immediately visible to history reads),
    /// emit `message.new`, and queue a turn. Returns once the message is
    /// committed and the task queued; generation happens asynchronously.
    pub async fn enqueue(
        &self,
        session_id: &SessionId,
        content: &str,
        target_personas: Option<Vec<String>>,
    ) -> Result<MessageRowId, ParleyError> {
        let session = self.conversations.get_session(session_id).await?;
        let worker = self.ensure_worker(&session);
        worker.touch();

        let message = self
            .conversations
            .append_message(session_id, session.user_sender(), content)
            .await?;

        worker.bus.publish(SessionEvent::MessageNew {
            message_id: message.id,
            sender: message.sender.clone(),
            content: message.content.clone(),
            timestamp: message.created_at,
        });

        worker
            .queue_tx
            .send(TurnTask {
                content: content.to_string(),
                target_personas,
            })
            .await
            .map_err(|_| {
                ParleyError::Store(StoreError::Database {
                    reason: "session worker queue closed".to_string(),
                })
            })?;

        Ok(message.id)
    }

    /// Subscribe to a session's live event stream. Late subscribers see
    /// only future events.
    pub async fn subscribe(
        &self,
        session_id: &SessionId,
    ) -> Result<broadcast::Receiver<SessionEvent>, ParleyError> {
        let session = self.conversations.get_session(session_id).await?;
        let worker = self.ensure_worker(&session);
        worker.touch();
        Ok(worker.bus.subscribe())
    }

    /// Cancel any in-flight task and drop the runtime binding. Called on
    /// session deletion and shutdown; the conversation rows are the
    /// caller's to delete.
    pub fn close_session(&self, session_id: &SessionId) {
        let handle = self
            .workers
            .lock()
            .expect("workers poisoned")
            .remove(session_id.as_str());
        if let Some(handle) = handle {
            info!(session_id = %session_id, "closing session worker");
            handle.cancel.cancel();
        }
    }

    /// Number of live runtime bindings (for tests and health reporting).
    pub fn live_sessions(&self) -> usize {
        self.workers.lock().expect("workers poisoned").len()
    }

    fn ensure_worker(&self, session: &Session) -> WorkerHandle {
        let mut workers = self.workers.lock().expect("workers poisoned");
        if let Some(handle) = workers.get(session.id.as_str()) {
            return handle.clone();
        }

        let (queue_tx, queue_rx) = mpsc::channel(64);
        let bus = EventBus::new(self.config.event_buffer);
        let cancel = CancellationToken::new();
        let last_activity = Arc::new(Mutex::new(Instant::now()));

        let handle = WorkerHandle {
            queue_tx,
            bus: bus.clone(),
            cancel: cancel.clone(),
            last_activity: last_activity.clone(),
        };
        workers.insert(session.id.as_str().to_string(), handle.clone());

        let ctx = WorkerContext {
            session: session.clone(),
            personas: self.personas.clone(),
            conversations: self.conversations.clone(),
            runtime: self.runtime.clone(),
            config: self.config.clone(),
            bus,
            cancel,
            last_activity,
        };
        tokio::spawn(worker_loop(ctx, queue_rx));
        info!(session_id = %session.id, "session worker started");

        handle
    }
}

impl std::fmt::Debug for SessionOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionOrchestrator")
            .field("live_sessions", &self.live_sessions())
            .finish()
    }
}

/// Background eviction of idle workers. Holds only a weak reference so
/// dropping the orchestrator stops the reaper.
fn spawn_reaper(workers: Weak<Mutex<HashMap<String, WorkerHandle>>>, idle_eviction: Duration) {
    let tick = idle_eviction.min(Duration::from_secs(60)).max(Duration::from_millis(100));
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(tick).await;
            let Some(workers) = workers.upgrade() else {
                return;
            };
            let mut workers = workers.lock().expect("workers poisoned");
            let expired: Vec<String> = workers
                .iter()
                .filter(|(_, handle)| handle.idle_for() >= idle_eviction)
                .map(|(id, _)| id.clone())
                .collect();
            for id in expired {
                if let Some(handle) = workers.remove(&id) {
                    debug!(session_id = %id, "evicting idle session worker");
                    handle.cancel.cancel();
                }
            }
        }
    });
}

// ============================================================================
// WORKER LOOP
// ============================================================================

async fn worker_loop(ctx: WorkerContext, mut queue_rx: mpsc::Receiver<TurnTask>) {
    let mut scheduler = match ctx.config.scheduler_seed {
        Some(seed) => SchedulerState::with_seed(seed),
        None => SchedulerState::new(),
    };

    loop {
        let task = tokio::select! {
            _ = ctx.cancel.cancelled() => break,
            task = queue_rx.recv() => match task {
                Some(task) => task,
                None => break,
            },
        };

        *ctx.last_activity.lock().expect("clock poisoned") = Instant::now();
        process_task(&ctx, &mut scheduler, task).await;
        *ctx.last_activity.lock().expect("clock poisoned") = Instant::now();
    }

    debug!(session_id = %ctx.session.id, "session worker stopped");
}

async fn process_task(ctx: &WorkerContext, scheduler: &mut SchedulerState, task: TurnTask) {
    let personas = match ctx.personas.list_personas(&ctx.session.owner).await {
        Ok(personas) => personas,
        Err(e) => {
            error!(session_id = %ctx.session.id, error = %e, "failed to load personas");
            ctx.bus.publish(SessionEvent::SystemError {
                reason: "failed to load personas".to_string(),
            });
            return;
        }
    };
    if personas.is_empty() {
        ctx.bus.publish(SessionEvent::SystemError {
            reason: "no personas configured".to_string(),
        });
        return;
    }

    let input = TurnInput {
        text: &task.content,
        target_personas: task.target_personas.as_deref(),
        is_fresh_user_message: true,
    };
    let speakers: Vec<Persona> = next_turn(&personas, scheduler, &input)
        .into_iter()
        .cloned()
        .collect();
    if speakers.is_empty() {
        debug!(session_id = %ctx.session.id, "scheduler selected nobody this turn");
        return;
    }

    // History bounded by the widest window among this turn's speakers.
    let history_limit = speakers
        .iter()
        .map(|p| p.memory_window)
        .max()
        .unwrap_or(1)
        .min(ctx.config.effective_max_history());
    let history = match ctx
        .conversations
        .list_messages(&ctx.session.id, history_limit)
        .await
    {
        Ok(history) => history,
        Err(e) => {
            // Session vanished mid-task (deleted); stop quietly.
            debug!(session_id = %ctx.session.id, error = %e, "history load failed");
            return;
        }
    };

    for persona in speakers {
        if ctx.cancel.is_cancelled() {
            return;
        }
        run_speaker(ctx, &persona, &history, &task).await;
    }
}

/// Pending-reply id: sanitized handle plus a short random suffix.
fn pending_message_id(handle: &str) -> String {
    let safe: String = handle
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '_' })
        .collect();
    let suffix = &uuid::Uuid::new_v4().simple().to_string()[..8];
    format!("{}_{}", safe.to_lowercase(), suffix)
}

async fn run_speaker(
    ctx: &WorkerContext,
    persona: &Persona,
    history: &[parley_core::Message],
    task: &TurnTask,
) {
    let message_id = pending_message_id(&persona.handle);
    ctx.bus.publish(SessionEvent::AgentStart {
        message_id: message_id.clone(),
        sender: persona.handle.clone(),
        session_id: ctx.session.id.as_str().to_string(),
        timestamp: Utc::now(),
    });

    // Resolve the chat endpoint; config problems fail this speaker only.
    let llm = match ctx.personas.resolve_llm_config(persona).await {
        Ok(llm) => llm,
        Err(e) => {
            warn!(sender = %persona.handle, error = %e, "llm config resolution failed");
            ctx.bus.publish(SessionEvent::AgentError {
                message_id,
                sender: persona.handle.clone(),
                reason: format!("configuration error: {}", e),
            });
            return;
        }
    };

    // Knowledge binding: personas without an embedding profile simply
    // run without retrieval; a broken embedder on a persona that has
    // one is a per-speaker error.
    let (mode, tool_ctx) = if persona.embedding_profile_id.is_some() {
        match ctx.personas.resolve_embedding_config(persona).await {
            Ok(embed) => (
                ReplyMode::Retrieval,
                Some(ToolContext {
                    owner: persona.owner.clone(),
                    persona_id: persona.id,
                    collection: collection_name(&persona.owner, persona.id),
                    embed,
                    default_top_k: persona.rag_top_k,
                }),
            ),
            Err(e) => {
                warn!(sender = %persona.handle, error = %e, "embedding config resolution failed");
                ctx.bus.publish(SessionEvent::AgentError {
                    message_id,
                    sender: persona.handle.clone(),
                    reason: format!("configuration error: {}", e),
                });
                return;
            }
        }
    } else {
        (ReplyMode::Direct, None)
    };

    let cancel = ctx.cancel.child_token();
    let mut stream = ctx.runtime.stream_reply(ReplyRequest {
        persona: persona.clone(),
        llm,
        history: history.to_vec(),
        user_sender: ctx.session.user_sender().to_string(),
        user_message: task.content.clone(),
        mode,
        tool_ctx,
        cancel: cancel.clone(),
        timeout: ctx.config.llm_timeout,
    });

    let mut assembled = String::new();
    let mut finished = false;
    while let Some(event) = stream.recv().await {
        match event {
            ReplyEvent::Chunk(content) => {
                assembled.push_str(&content);
                ctx.bus.publish(SessionEvent::AgentChunk {
                    message_id: message_id.clone(),
                    sender: persona.handle.clone(),
                    content,
                });
            }
            ReplyEvent::Done { full_text } => {
                finish_reply(ctx, persona, &message_id, full_text).await;
                finished = true;
                break;
            }
            ReplyEvent::Failed { error } => {
                warn!(sender = %persona.handle, error = %error, "reply failed");
                ctx.bus.publish(SessionEvent::AgentError {
                    message_id: message_id.clone(),
                    sender: persona.handle.clone(),
                    reason: error.to_string(),
                });
                finished = true;
                break;
            }
        }
    }

    if !finished {
        // Stream closed without a terminal event: cancellation. Emit the
        // terminal agent.end with whatever was assembled; persist nothing.
        ctx.bus.publish(SessionEvent::AgentEnd {
            message_id,
            sender: persona.handle.clone(),
            content: assembled,
            persisted_message_id: None,
            timestamp: Utc::now(),
        });
    }
}

/// Persist a completed reply and emit `agent.end`. Commit happens here,
/// off the chunk hot path; empty replies are not persisted.
async fn finish_reply(ctx: &WorkerContext, persona: &Persona, message_id: &str, full_text: String) {
    let mut persisted_message_id = None;
    if !full_text.is_empty() && !ctx.cancel.is_cancelled() {
        match ctx
            .conversations
            .append_message(&ctx.session.id, &persona.handle, &full_text)
            .await
        {
            Ok(message) => persisted_message_id = Some(message.id),
            Err(e) => {
                error!(sender = %persona.handle, error = %e, "failed to persist reply");
                ctx.bus.publish(SessionEvent::AgentError {
                    message_id: message_id.to_string(),
                    sender: persona.handle.clone(),
                    reason: "failed to persist reply".to_string(),
                });
                return;
            }
        }
    }

    ctx.bus.publish(SessionEvent::AgentEnd {
        message_id: message_id.to_string(),
        sender: persona.handle.clone(),
        content: full_text,
        persisted_message_id,
        timestamp: Utc::now(),
    });
}

use std::sync::Arc;

use quill_llm::{
    ChunkEvent, ChunkPayload, ChunkSource, ChunkStream, DEFAULT_OPENAI_MODEL, SessionId,
    SourceHandle, SourceMessage, StreamRequest,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::events::{SessionUpdate, Wakeup};
use super::message::{Conversation, ConversationRejection, Message, MessageId, MessageStatus, Role};
use super::typewriter::{RevealPacing, ScheduledTick, TickOutcome, Typewriter};
use super::view::MessageView;

pub const GENERIC_FAILURE_TEXT: &str =
    "Failed to get response from the assistant. Please try again.";
pub const CANCELLED_TEXT: &str = "Response cancelled.";
const STREAM_ENDED_EARLY: &str = "the response ended before a terminal event";

pub const DEFAULT_SUGGESTIONS: [&str; 3] = [
    "Tell me more",
    "How does this work?",
    "Can you explain further?",
];

/// Text shown in place of a reply that failed.
pub fn describe_failure(description: &str) -> String {
    let description = description.trim();
    if description.is_empty() {
        GENERIC_FAILURE_TEXT.to_string()
    } else {
        format!("Error: {description}")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionOptions {
    pub model_id: String,
    pub preamble: Option<String>,
    pub pacing: RevealPacing,
    /// Attached to every reply that completes.
    pub suggestions: Vec<String>,
    /// Fixes the reveal jitter when set.
    pub reveal_seed: Option<u64>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            model_id: DEFAULT_OPENAI_MODEL.to_string(),
            preamble: None,
            pacing: RevealPacing::default(),
            suggestions: DEFAULT_SUGGESTIONS.map(str::to_string).to_vec(),
            reveal_seed: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitRejection {
    EmptyText,
    InFlight { active: MessageId },
    UnknownMessage,
    SuggestionHidden,
    UnknownSuggestion,
    Conversation(ConversationRejection),
}

impl From<ConversationRejection> for SubmitRejection {
    fn from(rejection: ConversationRejection) -> Self {
        match rejection {
            ConversationRejection::InFlightExists { active } => Self::InFlight { active },
            other => Self::Conversation(other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    Accepted {
        user: MessageId,
        assistant: MessageId,
    },
    Rejected(SubmitRejection),
}

impl SubmitOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted { .. })
    }
}

struct ActiveStream {
    session: SessionId,
    message_id: MessageId,
    stream: ChunkStream,
    worker: JoinHandle<()>,
}

impl ActiveStream {
    fn stop(mut self) {
        self.stream.cancel();
        self.worker.abort();
    }
}

/// Owns the conversation and drives one reply at a time.
///
/// Nothing here is shared: a single task alternates between [`next_wakeup`] and [`handle`].
/// Source workers run as spawned tasks and only talk back through their chunk channel,
/// so [`submit`] must be called from inside a tokio runtime.
///
/// [`next_wakeup`]: SessionController::next_wakeup
/// [`handle`]: SessionController::handle
/// [`submit`]: SessionController::submit
pub struct SessionController {
    source: Arc<dyn ChunkSource>,
    options: SessionOptions,
    conversation: Conversation,
    typewriter: Typewriter,
    active: Option<ActiveStream>,
    next_message_id: u64,
    next_session_id: u64,
    updates: mpsc::UnboundedSender<SessionUpdate>,
}

impl SessionController {
    pub fn new(
        source: Arc<dyn ChunkSource>,
        options: SessionOptions,
    ) -> (Self, mpsc::UnboundedReceiver<SessionUpdate>) {
        let typewriter = match options.reveal_seed {
            Some(seed) => Typewriter::with_seed(options.pacing, seed),
            None => Typewriter::new(options.pacing),
        };
        let (updates, updates_rx) = mpsc::unbounded_channel();

        (
            Self {
                source,
                options,
                conversation: Conversation::new(),
                typewriter,
                active: None,
                next_message_id: 1,
                next_session_id: 1,
                updates,
            },
            updates_rx,
        )
    }

    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    pub fn conversation(&self) -> &Conversation {
        &self.conversation
    }

    pub fn typewriter(&self) -> &Typewriter {
        &self.typewriter
    }

    pub fn source_id(&self) -> &str {
        self.source.id()
    }

    /// A source is open or a reveal still has ticks to run.
    pub fn is_busy(&self) -> bool {
        self.active.is_some() || self.typewriter.next_tick().is_some()
    }

    /// Seeds an already-final assistant message, shown without animation.
    pub fn greet(&mut self, text: impl Into<String>, suggestions: Vec<String>) -> Option<MessageId> {
        let message = Message::assistant_finalized(self.alloc_message_id(), text, suggestions);
        let message_id = message.id;

        if let Err(rejection) = self.conversation.push_frozen(message.clone()) {
            tracing::debug!(?rejection, "skipped greeting");
            return None;
        }
        self.emit(SessionUpdate::MessageAppended(message));
        Some(message_id)
    }

    pub fn submit(&mut self, text: impl Into<String>) -> SubmitOutcome {
        let text = text.into();
        let text = text.trim();
        if text.is_empty() {
            tracing::debug!("ignored empty submission");
            return SubmitOutcome::Rejected(SubmitRejection::EmptyText);
        }

        if let Some(active) = self.conversation.in_flight() {
            tracing::debug!(
                message_id = active.id.0,
                "ignored submission while a reply is in flight"
            );
            return SubmitOutcome::Rejected(SubmitRejection::InFlight { active: active.id });
        }

        // A stream whose message already left the in-flight slot must not keep
        // feeding the conversation. Every terminal path clears `active` today.
        if let Some(orphan) = self.active.take() {
            tracing::warn!(
                session = orphan.session.0,
                "stopping a source that outlived its message"
            );
            self.typewriter.discard(orphan.message_id);
            orphan.stop();
        }

        let user = Message::user(self.alloc_message_id(), text);
        let user_id = user.id;
        if let Err(rejection) = self.conversation.push_frozen(user.clone()) {
            return SubmitOutcome::Rejected(rejection.into());
        }
        self.emit(SessionUpdate::MessageAppended(user));

        let session = self.alloc_session_id();
        let request = self.build_request(session);

        let assistant = Message::assistant_in_flight(self.alloc_message_id());
        let assistant_id = assistant.id;
        if let Err(rejection) = self.conversation.open_in_flight(assistant.clone()) {
            return SubmitOutcome::Rejected(rejection.into());
        }
        self.typewriter.begin(assistant_id);
        self.emit(SessionUpdate::MessageAppended(assistant));

        match self.source.open(request) {
            Ok(SourceHandle { stream, worker }) => {
                tracing::info!(
                    session = session.0,
                    message_id = assistant_id.0,
                    source = self.source.id(),
                    "opened reply stream"
                );
                self.active = Some(ActiveStream {
                    session,
                    message_id: assistant_id,
                    stream,
                    worker: tokio::spawn(worker),
                });
            }
            Err(error) => {
                tracing::warn!(session = session.0, error = %error, "failed to open reply stream");
                self.fail_in_flight(describe_failure(&error.user_message()));
            }
        }

        SubmitOutcome::Accepted {
            user: user_id,
            assistant: assistant_id,
        }
    }

    /// Submits the text of a suggestion chip, if the chip is currently shown.
    pub fn choose_suggestion(&mut self, message_id: MessageId, index: usize) -> SubmitOutcome {
        let Some(view) = self.view(message_id) else {
            return SubmitOutcome::Rejected(SubmitRejection::UnknownMessage);
        };
        if !view.suggestions_visible {
            tracing::debug!(message_id = message_id.0, "suggestions are not shown yet");
            return SubmitOutcome::Rejected(SubmitRejection::SuggestionHidden);
        }
        let Some(text) = view.suggestions.get(index).cloned() else {
            return SubmitOutcome::Rejected(SubmitRejection::UnknownSuggestion);
        };

        self.submit(text)
    }

    /// Stops the reply in flight. Returns false when there was none.
    pub fn cancel(&mut self) -> bool {
        let Some(message_id) = self.conversation.in_flight().map(|message| message.id) else {
            return false;
        };

        tracing::info!(message_id = message_id.0, "cancelling reply");
        self.fail_in_flight(CANCELLED_TEXT.to_string());
        true
    }

    /// Tears everything down. Pending ticks become stale.
    pub fn shutdown(&mut self) {
        self.cancel();
        if let Some(active) = self.active.take() {
            active.stop();
        }
        let discarded = self.typewriter.discard_all();
        tracing::debug!(discarded, "session shut down");
    }

    /// Waits for the next chunk or reveal tick. Cancel safe.
    ///
    /// Returns `None` once nothing is left to wait for.
    pub async fn next_wakeup(&mut self) -> Option<Wakeup> {
        let tick = self.typewriter.next_tick();
        let Some(active) = self.active.as_mut() else {
            let tick = tick?;
            tokio::time::sleep_until(tick.due).await;
            return Some(Wakeup::Tick(tick));
        };

        let session = active.session;
        tokio::select! {
            biased;
            event = active.stream.recv() => Some(match event {
                Some(event) => Wakeup::Chunk(event),
                None => Wakeup::StreamClosed(session),
            }),
            tick = wait_for_tick(tick) => Some(Wakeup::Tick(tick)),
        }
    }

    pub fn handle(&mut self, wakeup: Wakeup) {
        match wakeup {
            Wakeup::Chunk(event) => self.handle_chunk(event),
            Wakeup::StreamClosed(session) => self.handle_stream_closed(session),
            Wakeup::Tick(tick) => self.handle_tick(tick),
        }
    }

    /// Drives the session until no source is open and every reveal finished.
    pub async fn run_until_settled(&mut self) {
        while let Some(wakeup) = self.next_wakeup().await {
            self.handle(wakeup);
        }
    }

    pub fn views(&self) -> Vec<MessageView> {
        self.conversation
            .iter()
            .map(|message| MessageView::project(message, &self.typewriter))
            .collect()
    }

    pub fn view(&self, message_id: MessageId) -> Option<MessageView> {
        self.conversation
            .get(message_id)
            .map(|message| MessageView::project(message, &self.typewriter))
    }

    fn handle_chunk(&mut self, event: ChunkEvent) {
        if !self.stream_is_current(event.session) {
            tracing::debug!(session = event.session.0, "dropped chunk from a stale stream");
            return;
        }

        match event.payload {
            ChunkPayload::Increment(fragment) => self.apply_increments(fragment),
            ChunkPayload::Complete => self.complete_in_flight(),
            ChunkPayload::Failed(description) => {
                self.fail_in_flight(describe_failure(&description));
            }
        }
    }

    fn handle_stream_closed(&mut self, session: SessionId) {
        if !self.stream_is_current(session) {
            return;
        }

        tracing::warn!(session = session.0, "reply stream closed without a terminal event");
        self.fail_in_flight(describe_failure(STREAM_ENDED_EARLY));
    }

    fn handle_tick(&mut self, tick: ScheduledTick) {
        let Some(message) = self.conversation.get(tick.message_id) else {
            self.typewriter.discard(tick.message_id);
            return;
        };

        let finalized = message.status == MessageStatus::Finalized;
        let outcome = self
            .typewriter
            .fire(tick, &message.text, finalized, Instant::now());

        match outcome {
            TickOutcome::Stale => {
                tracing::trace!(message_id = tick.message_id.0, "ignored stale reveal tick");
            }
            TickOutcome::Advanced {
                displayed_chars, ..
            }
            | TickOutcome::CaughtUp { displayed_chars } => {
                self.emit(SessionUpdate::RevealAdvanced {
                    message_id: tick.message_id,
                    displayed_chars,
                });
            }
            TickOutcome::Completed { displayed_chars } => {
                self.emit(SessionUpdate::RevealAdvanced {
                    message_id: tick.message_id,
                    displayed_chars,
                });
                self.emit_reveal_completed(tick.message_id);
            }
        }
    }

    /// Applies `first` plus every increment already queued behind it as one update.
    fn apply_increments(&mut self, first: String) {
        let mut fragments = vec![first];
        let mut trailing = None;
        if let Some(active) = self.active.as_mut() {
            while let Some(event) = active.stream.try_recv() {
                match event.payload {
                    ChunkPayload::Increment(fragment) => fragments.push(fragment),
                    _ => {
                        trailing = Some(event);
                        break;
                    }
                }
            }
        }

        let Some(accumulator) = self.conversation.accumulator_mut() else {
            return;
        };
        let update = accumulator
            .on_increments(fragments.iter().map(String::as_str))
            .update();

        if let Some(message) = update {
            tracing::trace!(
                message_id = message.id.0,
                fragments = fragments.len(),
                "applied reply increments"
            );
            self.typewriter
                .on_growth(message.id, &message.text, Instant::now());
            self.emit(SessionUpdate::MessageUpdated(message));
        }

        if let Some(event) = trailing {
            self.handle_chunk(event);
        }
    }

    fn complete_in_flight(&mut self) {
        let suggestions = self.options.suggestions.clone();
        let Some(accumulator) = self.conversation.accumulator_mut() else {
            return;
        };
        let Some(message) = accumulator.on_complete(suggestions).update() else {
            return;
        };

        self.active = None;
        self.conversation.freeze_in_flight();
        tracing::info!(
            message_id = message.id.0,
            chars = message.char_len(),
            "reply completed"
        );

        let outcome = self
            .typewriter
            .on_finalized(message.id, &message.text, Instant::now());
        let message_id = message.id;
        self.emit(SessionUpdate::MessageUpdated(message));
        if let TickOutcome::Completed { .. } = outcome {
            self.emit_reveal_completed(message_id);
        }
    }

    /// Fails the in-flight message with `text` and shows it at once.
    fn fail_in_flight(&mut self, text: String) {
        let Some(accumulator) = self.conversation.accumulator_mut() else {
            return;
        };
        let Some(message) = accumulator.on_error(text).update() else {
            return;
        };

        if let Some(active) = self.active.take() {
            active.stop();
        }
        self.conversation.freeze_in_flight();
        tracing::warn!(message_id = message.id.0, error = %message.text, "reply failed");

        let message_id = message.id;
        let had_reveal = self.typewriter.short_circuit(message_id);
        self.emit(SessionUpdate::MessageUpdated(message));
        if had_reveal {
            self.emit_reveal_completed(message_id);
        }
    }

    fn build_request(&self, session: SessionId) -> StreamRequest {
        let messages = self
            .conversation
            .iter()
            .filter(|message| message.status == MessageStatus::Finalized)
            .filter(|message| !message.text.trim().is_empty())
            .map(|message| SourceMessage::new(source_role(message.role), message.text.clone()))
            .collect();

        let request = StreamRequest::new(session, self.options.model_id.clone(), messages);
        match &self.options.preamble {
            Some(preamble) => request.with_preamble(preamble.clone()),
            None => request,
        }
    }

    fn stream_is_current(&self, session: SessionId) -> bool {
        self.active
            .as_ref()
            .is_some_and(|active| active.session == session)
    }

    fn emit_reveal_completed(&self, message_id: MessageId) {
        tracing::debug!(message_id = message_id.0, "reveal completed");
        self.emit(SessionUpdate::RevealCompleted(message_id));
    }

    fn emit(&self, update: SessionUpdate) {
        let _ = self.updates.send(update);
    }

    fn alloc_message_id(&mut self) -> MessageId {
        let id = MessageId::new(self.next_message_id);
        self.next_message_id = self.next_message_id.saturating_add(1);
        id
    }

    fn alloc_session_id(&mut self) -> SessionId {
        let id = SessionId::new(self.next_session_id);
        self.next_session_id = self.next_session_id.saturating_add(1);
        id
    }
}

impl Drop for SessionController {
    fn drop(&mut self) {
        if let Some(active) = self.active.take() {
            active.stop();
        }
    }
}

async fn wait_for_tick(tick: Option<ScheduledTick>) -> ScheduledTick {
    match tick {
        Some(tick) => {
            tokio::time::sleep_until(tick.due).await;
            tick
        }
        None => std::future::pending().await,
    }
}

fn source_role(role: Role) -> quill_llm::Role {
    match role {
        Role::User => quill_llm::Role::User,
        Role::Assistant => quill_llm::Role::Assistant,
    }
}

use std::future::Future;
use std::pin::Pin;

use snafu::Snafu;
use tokio::sync::{mpsc, oneshot};

/// Identifier for one streaming session.
///
/// Every opened source gets a fresh id so events from a cancelled stream can be told apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl SessionId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }
}

/// Speaker role as seen by the upstream assistant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceConfig {
    pub source_kind: String,
    pub api_key: String,
    pub endpoint: String,
    pub request_timeout_secs: Option<u64>,
}

impl SourceConfig {
    pub fn new(
        source_kind: impl Into<String>,
        api_key: impl Into<String>,
        endpoint: impl Into<String>,
    ) -> Self {
        Self {
            source_kind: source_kind.into().trim().to_string(),
            api_key: api_key.into().trim().to_string(),
            endpoint: endpoint.into().trim().to_string(),
            request_timeout_secs: None,
        }
    }

    pub fn with_request_timeout_secs(mut self, secs: u64) -> Self {
        self.request_timeout_secs = Some(secs);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceMessage {
    pub role: Role,
    pub content: String,
}

impl SourceMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// Everything a source needs to open one response stream.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamRequest {
    pub session: SessionId,
    pub model_id: String,
    /// Full conversational context, oldest first. The last entry is the prompt.
    pub messages: Vec<SourceMessage>,
    pub preamble: Option<String>,
}

impl StreamRequest {
    pub fn new(
        session: SessionId,
        model_id: impl Into<String>,
        messages: Vec<SourceMessage>,
    ) -> Self {
        Self {
            session,
            model_id: model_id.into(),
            messages,
            preamble: None,
        }
    }

    pub fn with_preamble(mut self, preamble: impl Into<String>) -> Self {
        self.preamble = Some(preamble.into());
        self
    }

    /// Returns the newest user turn, which is what gets answered.
    pub fn latest_user_message(&self) -> Option<&SourceMessage> {
        self.messages
            .iter()
            .rev()
            .find(|message| matches!(message.role, Role::User))
    }
}

/// What a source can emit. Exactly one terminal payload ends every stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkPayload {
    Increment(String),
    Complete,
    Failed(String),
}

impl ChunkPayload {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Failed(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkEvent {
    pub session: SessionId,
    pub payload: ChunkPayload,
}

pub type SourceWorker = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;
pub type SourceResult<T> = Result<T, SourceError>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SourceError {
    #[snafu(display("missing API key for source '{source_kind}'"))]
    MissingApiKey {
        stage: &'static str,
        source_kind: String,
    },
    #[snafu(display("chunk source '{source_kind}' is not supported"))]
    UnsupportedSource {
        stage: &'static str,
        source_kind: String,
    },
    #[snafu(display("stream request for session {session:?} has no messages"))]
    EmptyMessageSet {
        stage: &'static str,
        session: SessionId,
    },
    #[snafu(display("failed to build http client on `{stage}`, {source}"))]
    BuildHttpClient {
        stage: &'static str,
        source: reqwest::Error,
    },
    #[snafu(display("request failed on `{stage}`, {source}"))]
    Request {
        stage: &'static str,
        source: reqwest::Error,
    },
    #[snafu(display("assistant endpoint returned {status}: {detail}"))]
    Status {
        stage: &'static str,
        status: u16,
        reason: String,
        detail: String,
    },
    #[snafu(display("response body was not valid UTF-8 at byte {offset}"))]
    Decode { stage: &'static str, offset: usize },
    #[snafu(display("rig http client failed on `{stage}`, {source}"))]
    RigHttpClient {
        stage: &'static str,
        source: rig::http_client::Error,
    },
    #[snafu(display("completions failed on `{stage}`, {source}"))]
    CompletionsFailed {
        stage: &'static str,
        source: rig::completion::CompletionError,
    },
    #[snafu(display("scripted source failed: {description}"))]
    Scripted {
        stage: &'static str,
        description: String,
    },
}

impl SourceError {
    /// Short description safe to put in front of a user.
    ///
    /// Transport internals (URLs, socket errors, provider payloads) stay in the logs.
    pub fn user_message(&self) -> String {
        match self {
            Self::MissingApiKey { .. } => {
                "The assistant is not configured. Please set an API key.".to_string()
            }
            Self::UnsupportedSource { source_kind, .. } => {
                format!("Unsupported assistant source '{source_kind}'.")
            }
            Self::EmptyMessageSet { .. } => "There was nothing to send.".to_string(),
            Self::BuildHttpClient { .. } => "Could not prepare the request.".to_string(),
            Self::Request { source, .. } => {
                if source.is_timeout() {
                    "The assistant took too long to respond.".to_string()
                } else if source.is_connect() {
                    "Could not reach the assistant.".to_string()
                } else {
                    "The connection to the assistant was interrupted.".to_string()
                }
            }
            Self::Status { reason, detail, .. } => {
                let detail = detail.trim();
                if detail.is_empty() {
                    format!("Network response was not ok: {reason}")
                } else {
                    format!("Network response was not ok: {reason} - {detail}")
                }
            }
            Self::Decode { .. } => "The assistant sent a reply that could not be read.".to_string(),
            Self::RigHttpClient { .. } => "Could not reach the assistant.".to_string(),
            Self::CompletionsFailed { .. } => "The assistant failed to respond.".to_string(),
            Self::Scripted { description, .. } => description.clone(),
        }
    }
}

/// Receiving half of one response stream.
///
/// Dropping it tells the worker to stop.
pub struct ChunkStream {
    session: SessionId,
    events: mpsc::UnboundedReceiver<ChunkEvent>,
    cancel_tx: Option<oneshot::Sender<()>>,
}

pub struct SourceHandle {
    pub stream: ChunkStream,
    pub worker: SourceWorker,
}

impl ChunkStream {
    pub(crate) fn new(
        session: SessionId,
        events: mpsc::UnboundedReceiver<ChunkEvent>,
        cancel_tx: oneshot::Sender<()>,
    ) -> Self {
        Self {
            session,
            events,
            cancel_tx: Some(cancel_tx),
        }
    }

    pub fn session(&self) -> SessionId {
        self.session
    }

    /// Waits for the next event. Cancel safe.
    pub async fn recv(&mut self) -> Option<ChunkEvent> {
        self.events.recv().await
    }

    pub fn try_recv(&mut self) -> Option<ChunkEvent> {
        self.events.try_recv().ok()
    }

    pub fn cancel(&mut self) -> bool {
        self.cancel_tx
            .take()
            .map(|tx| tx.send(()).is_ok())
            .unwrap_or(false)
    }
}

impl Drop for ChunkStream {
    fn drop(&mut self) {
        if let Some(cancel_tx) = self.cancel_tx.take() {
            let _ = cancel_tx.send(());
        }
    }
}

pub trait ChunkSource: Send + Sync {
    fn id(&self) -> &str;
    fn open(&self, request: StreamRequest) -> SourceResult<SourceHandle>;
}

/// Sending half handed to workers. Keeps the one-terminal-event contract.
pub(crate) struct ChunkSink {
    session: SessionId,
    tx: mpsc::UnboundedSender<ChunkEvent>,
    terminated: bool,
}

impl ChunkSink {
    /// Returns false once the receiver is gone.
    pub(crate) fn increment(&mut self, text: impl Into<String>) -> bool {
        let text = text.into();
        if self.terminated {
            return false;
        }
        if text.is_empty() {
            return true;
        }
        self.send(ChunkPayload::Increment(text))
    }

    pub(crate) fn complete(&mut self) {
        if !self.terminated {
            self.send(ChunkPayload::Complete);
            self.terminated = true;
        }
    }

    pub(crate) fn fail(&mut self, error: &SourceError) {
        if !self.terminated {
            self.send(ChunkPayload::Failed(error.user_message()));
            self.terminated = true;
        }
    }

    fn send(&self, payload: ChunkPayload) -> bool {
        self.tx
            .send(ChunkEvent {
                session: self.session,
                payload,
            })
            .is_ok()
    }
}

pub(crate) fn make_event_stream(
    session: SessionId,
) -> (ChunkSink, ChunkStream, oneshot::Receiver<()>) {
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let (cancel_tx, cancel_rx) = oneshot::channel();
    (
        ChunkSink {
            session,
            tx: event_tx,
            terminated: false,
        },
        ChunkStream::new(session, event_rx, cancel_tx),
        cancel_rx,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sink_emits_a_single_terminal_event() {
        let (mut sink, mut stream, _cancel_rx) = make_event_stream(SessionId::new(7));

        assert!(sink.increment("Hi"));
        sink.complete();
        sink.fail(&SourceError::Scripted {
            stage: "test",
            description: "late".to_string(),
        });
        assert!(!sink.increment("ignored"));
        drop(sink);

        let mut payloads = Vec::new();
        while let Some(event) = stream.recv().await {
            assert_eq!(event.session, SessionId::new(7));
            payloads.push(event.payload);
        }

        assert_eq!(
            payloads,
            vec![
                ChunkPayload::Increment("Hi".to_string()),
                ChunkPayload::Complete
            ]
        );
    }

    #[tokio::test]
    async fn dropping_stream_signals_cancellation() {
        let (_sink, stream, cancel_rx) = make_event_stream(SessionId::new(1));
        drop(stream);
        assert!(cancel_rx.await.is_ok());
    }

    #[test]
    fn status_error_message_includes_detail_only_when_present() {
        let with_detail = SourceError::Status {
            stage: "test",
            status: 503,
            reason: "Service Unavailable".to_string(),
            detail: "model overloaded".to_string(),
        };
        assert_eq!(
            with_detail.user_message(),
            "Network response was not ok: Service Unavailable - model overloaded"
        );

        let without_detail = SourceError::Status {
            stage: "test",
            status: 502,
            reason: "Bad Gateway".to_string(),
            detail: "  ".to_string(),
        };
        assert_eq!(
            without_detail.user_message(),
            "Network response was not ok: Bad Gateway"
        );
    }

    #[test]
    fn latest_user_message_skips_assistant_turns() {
        let request = StreamRequest::new(
            SessionId::new(1),
            "model",
            vec![
                SourceMessage::new(Role::User, "first"),
                SourceMessage::new(Role::Assistant, "reply"),
                SourceMessage::new(Role::User, "second"),
            ],
        );
        assert_eq!(
            request.latest_user_message().map(|m| m.content.as_str()),
            Some("second")
        );
    }
}

use futures::StreamExt;
use rig::completion::{CompletionModel, Message as RigMessage};
use rig::prelude::CompletionClient;
use rig::providers::openai;
use rig::streaming::StreamedAssistantContent;
use snafu::{ResultExt, ensure};
use tokio::sync::oneshot;

use super::source::{
    ChunkSink, ChunkSource, CompletionsFailedSnafu, EmptyMessageSetSnafu, MissingApiKeySnafu,
    RigHttpClientSnafu, Role, SourceConfig, SourceError, SourceHandle, SourceMessage,
    SourceResult, SourceWorker, StreamRequest, make_event_stream,
};

pub const RIG_OPENAI_SOURCE_ID: &str = "openai";
pub const DEFAULT_OPENAI_MODEL: &str = "gpt-4o-mini";

type RigStreamingResponse = rig::streaming::StreamingCompletionResponse<
    rig::providers::openai::responses_api::streaming::StreamingCompletionResponse,
>;

/// Chunk source backed by an OpenAI-compatible streaming completion.
pub struct RigChunkSource {
    config: SourceConfig,
}

impl RigChunkSource {
    pub fn new(config: SourceConfig) -> SourceResult<Self> {
        ensure!(
            !config.api_key.is_empty(),
            MissingApiKeySnafu {
                stage: "rig-source-new",
                source_kind: config.source_kind.clone(),
            }
        );

        Ok(Self { config })
    }

    fn build_client(config: &SourceConfig) -> SourceResult<openai::Client> {
        let mut builder = openai::Client::builder().api_key(config.api_key.as_str());
        if !config.endpoint.is_empty() {
            builder = builder.base_url(config.endpoint.as_str());
        }
        builder.build().context(RigHttpClientSnafu {
            stage: "build-client",
        })
    }

    fn to_rig_message(message: &SourceMessage) -> Option<RigMessage> {
        match message.role {
            Role::System => None,
            Role::User => Some(RigMessage::user(message.content.clone())),
            Role::Assistant => Some(RigMessage::assistant(message.content.clone())),
        }
    }

    fn merged_preamble(request: &StreamRequest) -> Option<String> {
        let mut preamble_parts = Vec::new();

        if let Some(preamble) = &request.preamble
            && !preamble.trim().is_empty()
        {
            preamble_parts.push(preamble.clone());
        }

        // Rig has a single preamble slot, so system turns are folded into it.
        for message in &request.messages {
            if matches!(message.role, Role::System) && !message.content.trim().is_empty() {
                preamble_parts.push(message.content.clone());
            }
        }

        if preamble_parts.is_empty() {
            None
        } else {
            Some(preamble_parts.join("\n\n"))
        }
    }

    async fn open_stream(
        config: &SourceConfig,
        request: &StreamRequest,
    ) -> SourceResult<RigStreamingResponse> {
        let client = Self::build_client(config)?;
        let model = client.completion_model(request.model_id.clone());

        let mut messages = request
            .messages
            .iter()
            .filter_map(Self::to_rig_message)
            .collect::<Vec<_>>();

        let Some(prompt) = messages.pop() else {
            tracing::warn!(
                session = ?request.session,
                model_id = %request.model_id,
                total_message_count = request.messages.len(),
                "cannot open stream because no user/assistant messages remain after filtering"
            );
            return EmptyMessageSetSnafu {
                stage: "open-stream-pop-prompt",
                session: request.session,
            }
            .fail();
        };

        let mut builder = model.completion_request(prompt).messages(messages);
        if let Some(preamble) = Self::merged_preamble(request) {
            builder = builder.preamble(preamble);
        }

        builder.stream().await.context(CompletionsFailedSnafu {
            stage: "open-stream",
        })
    }

    fn text_delta<R>(item: StreamedAssistantContent<R>) -> Option<String>
    where
        R: Clone + Unpin,
    {
        match item {
            StreamedAssistantContent::Text(text) => Some(text.text),
            // Reasoning and tool traffic are not part of the visible reply.
            StreamedAssistantContent::Reasoning(_)
            | StreamedAssistantContent::ReasoningDelta { .. }
            | StreamedAssistantContent::ToolCall { .. }
            | StreamedAssistantContent::ToolCallDelta { .. }
            | StreamedAssistantContent::Final(_) => None,
        }
    }

    async fn run_stream_worker(
        config: SourceConfig,
        request: StreamRequest,
        mut sink: ChunkSink,
        mut cancel_rx: oneshot::Receiver<()>,
    ) {
        let session = request.session;
        let mut stream = match Self::open_stream(&config, &request).await {
            Ok(stream) => stream,
            Err(error) => {
                tracing::error!(
                    session = ?session,
                    source_kind = %config.source_kind,
                    model_id = %request.model_id,
                    error = %error,
                    "failed to open completion stream"
                );
                sink.fail(&error);
                return;
            }
        };

        loop {
            tokio::select! {
                _ = &mut cancel_rx => {
                    tracing::debug!(session = ?session, "completion stream cancelled");
                    stream.cancel();
                    return;
                }
                next_item = stream.next() => {
                    match next_item {
                        Some(Ok(item)) => {
                            if let Some(text) = Self::text_delta(item)
                                && !sink.increment(text)
                            {
                                return;
                            }
                        }
                        Some(Err(source)) => {
                            let error = SourceError::CompletionsFailed {
                                stage: "stream-chunk",
                                source,
                            };
                            tracing::warn!(
                                session = ?session,
                                error = %error,
                                "completion stream emitted an error chunk"
                            );
                            sink.fail(&error);
                            return;
                        }
                        None => break,
                    }
                }
            }
        }

        sink.complete();
    }
}

impl ChunkSource for RigChunkSource {
    fn id(&self) -> &str {
        RIG_OPENAI_SOURCE_ID
    }

    fn open(&self, request: StreamRequest) -> SourceResult<SourceHandle> {
        ensure!(
            !request.messages.is_empty(),
            EmptyMessageSetSnafu {
                stage: "rig-open",
                session: request.session,
            }
        );

        let (sink, stream, cancel_rx) = make_event_stream(request.session);
        let worker: SourceWorker = Box::pin(Self::run_stream_worker(
            self.config.clone(),
            request,
            sink,
            cancel_rx,
        ));

        Ok(SourceHandle { stream, worker })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::SessionId;

    #[test]
    fn missing_api_key_is_rejected() {
        let result = RigChunkSource::new(SourceConfig::new("openai", "  ", ""));
        assert!(matches!(result, Err(SourceError::MissingApiKey { .. })));
    }

    #[test]
    fn system_turns_fold_into_preamble() {
        let request = StreamRequest::new(
            SessionId::new(1),
            DEFAULT_OPENAI_MODEL,
            vec![
                SourceMessage::new(Role::System, "Be brief."),
                SourceMessage::new(Role::User, "Hello"),
            ],
        )
        .with_preamble("You are Quill.");

        assert_eq!(
            RigChunkSource::merged_preamble(&request).as_deref(),
            Some("You are Quill.\n\nBe brief.")
        );
    }
}

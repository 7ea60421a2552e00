use std::time::Duration;

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use snafu::{OptionExt, ResultExt, ensure};
use tokio::sync::oneshot;

use super::decode::Utf8StreamDecoder;
use super::source::{
    BuildHttpClientSnafu, ChunkSink, ChunkSource, EmptyMessageSetSnafu, RequestSnafu, Role,
    SourceConfig, SourceError, SourceHandle, SourceResult, SourceWorker, StatusSnafu,
    StreamRequest, make_event_stream,
};

pub const HTTP_BODY_SOURCE_ID: &str = "http";
pub const DEFAULT_HTTP_ENDPOINT: &str = "http://localhost:8000/api/chat/stream";

const UNPARSEABLE_ERROR_DETAIL: &str = "Failed to parse error response from backend";

#[derive(Debug, Serialize)]
struct ChatRequestBody<'a> {
    message: &'a str,
    history: Vec<HistoryEntry<'a>>,
}

#[derive(Debug, Serialize)]
struct HistoryEntry<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    detail: serde_json::Value,
}

impl ErrorBody {
    fn detail_text(&self) -> String {
        match &self.detail {
            serde_json::Value::Null => String::new(),
            serde_json::Value::String(detail) => detail.clone(),
            other => other.to_string(),
        }
    }
}

/// Streams a plain-text response body from a chat backend.
///
/// The backend receives the prompt plus prior turns as JSON and answers with a chunked
/// `text/plain` body; every decoded chunk becomes one increment.
pub struct HttpBodySource {
    config: SourceConfig,
    client: reqwest::Client,
}

impl HttpBodySource {
    pub fn new(mut config: SourceConfig) -> SourceResult<Self> {
        if config.endpoint.is_empty() {
            config.endpoint = DEFAULT_HTTP_ENDPOINT.to_string();
        }

        let mut builder = reqwest::Client::builder();
        if let Some(secs) = config.request_timeout_secs {
            builder = builder.timeout(Duration::from_secs(secs));
        }
        let client = builder.build().context(BuildHttpClientSnafu {
            stage: "http-source-new",
        })?;

        Ok(Self { config, client })
    }

    pub fn endpoint(&self) -> &str {
        &self.config.endpoint
    }

    fn request_body(request: &StreamRequest) -> SourceResult<ChatRequestBody<'_>> {
        let prompt_index = request
            .messages
            .iter()
            .rposition(|message| matches!(message.role, Role::User))
            .context(EmptyMessageSetSnafu {
                stage: "http-request-body",
                session: request.session,
            })?;

        let history = request.messages[..prompt_index]
            .iter()
            .map(|message| HistoryEntry {
                role: message.role.as_str(),
                content: message.content.as_str(),
            })
            .collect();

        Ok(ChatRequestBody {
            message: request.messages[prompt_index].content.as_str(),
            history,
        })
    }

    async fn open_body(
        client: &reqwest::Client,
        config: &SourceConfig,
        request: &StreamRequest,
    ) -> SourceResult<reqwest::Response> {
        let body = Self::request_body(request)?;

        let mut builder = client.post(config.endpoint.as_str()).json(&body);
        if !config.api_key.is_empty() {
            builder = builder.bearer_auth(config.api_key.as_str());
        }

        let response = builder.send().await.context(RequestSnafu {
            stage: "send-chat-request",
        })?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let reason = status
            .canonical_reason()
            .unwrap_or("Unknown status")
            .to_string();
        let detail = response
            .json::<ErrorBody>()
            .await
            .map(|body| body.detail_text())
            .unwrap_or_else(|_| UNPARSEABLE_ERROR_DETAIL.to_string());

        StatusSnafu {
            stage: "chat-http-status",
            status: status.as_u16(),
            reason,
            detail,
        }
        .fail()
    }

    async fn run_stream_worker(
        client: reqwest::Client,
        config: SourceConfig,
        request: StreamRequest,
        mut sink: ChunkSink,
        mut cancel_rx: oneshot::Receiver<()>,
    ) {
        let session = request.session;
        let response = tokio::select! {
            _ = &mut cancel_rx => {
                tracing::debug!(session = ?session, "http source cancelled before response");
                return;
            }
            response = Self::open_body(&client, &config, &request) => response,
        };

        let response = match response {
            Ok(response) => response,
            Err(error) => {
                tracing::warn!(
                    session = ?session,
                    endpoint = %config.endpoint,
                    error = %error,
                    "failed to open response body"
                );
                sink.fail(&error);
                return;
            }
        };

        let mut body = response.bytes_stream();
        let mut decoder = Utf8StreamDecoder::new();

        loop {
            tokio::select! {
                _ = &mut cancel_rx => {
                    tracing::debug!(session = ?session, "http source cancelled");
                    return;
                }
                next_chunk = body.next() => {
                    match next_chunk {
                        Some(Ok(bytes)) => match decoder.decode(&bytes) {
                            Ok(text) => {
                                if !sink.increment(text) {
                                    return;
                                }
                            }
                            Err(error) => {
                                tracing::warn!(session = ?session, error = %error, "undecodable response chunk");
                                sink.fail(&error);
                                return;
                            }
                        },
                        Some(Err(source)) => {
                            let error = SourceError::Request {
                                stage: "read-body-chunk",
                                source,
                            };
                            tracing::warn!(session = ?session, error = %error, "response body interrupted");
                            sink.fail(&error);
                            return;
                        }
                        None => break,
                    }
                }
            }
        }

        match decoder.finish() {
            Ok(()) => sink.complete(),
            Err(error) => {
                tracing::warn!(session = ?session, error = %error, "response body ended mid-character");
                sink.fail(&error);
            }
        }
    }
}

impl ChunkSource for HttpBodySource {
    fn id(&self) -> &str {
        HTTP_BODY_SOURCE_ID
    }

    fn open(&self, request: StreamRequest) -> SourceResult<SourceHandle> {
        ensure!(
            !request.messages.is_empty(),
            EmptyMessageSetSnafu {
                stage: "http-open",
                session: request.session,
            }
        );

        let (sink, stream, cancel_rx) = make_event_stream(request.session);
        let worker: SourceWorker = Box::pin(Self::run_stream_worker(
            self.client.clone(),
            self.config.clone(),
            request,
            sink,
            cancel_rx,
        ));

        Ok(SourceHandle { stream, worker })
    }
}

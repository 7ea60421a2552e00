use std::time::Duration;

use tokio::sync::oneshot;

use super::source::{
    ChunkSink, ChunkSource, ScriptedSnafu, SourceError, SourceHandle, SourceResult,
    SourceWorker, StreamRequest, make_event_stream,
};

pub const SCRIPTED_SOURCE_ID: &str = "scripted";

/// How a scripted stream ends after its fragments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptedOutcome {
    Complete,
    Fail(String),
    /// Closes the channel without a terminal event.
    Hangup,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Script {
    pub fragments: Vec<String>,
    pub outcome: ScriptedOutcome,
    /// Pause before each fragment and before the terminal event.
    pub fragment_delay: Duration,
}

impl Script {
    pub fn completing<I, S>(fragments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            fragments: fragments.into_iter().map(Into::into).collect(),
            outcome: ScriptedOutcome::Complete,
            fragment_delay: Duration::ZERO,
        }
    }

    pub fn failing<I, S>(fragments: I, description: impl Into<String>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            outcome: ScriptedOutcome::Fail(description.into()),
            ..Self::completing(fragments)
        }
    }

    pub fn with_fragment_delay(mut self, delay: Duration) -> Self {
        self.fragment_delay = delay;
        self
    }

    pub fn with_outcome(mut self, outcome: ScriptedOutcome) -> Self {
        self.outcome = outcome;
        self
    }
}

enum Replies {
    Fixed(Vec<Script>),
    Echo {
        fragment_delay: Duration,
        suffix: String,
    },
}

/// Deterministic in-memory source.
///
/// Serves queued scripts in order, then falls back to echoing the prompt word by word.
pub struct ScriptedSource {
    replies: std::sync::Mutex<Replies>,
}

impl ScriptedSource {
    pub fn new<I>(scripts: I) -> Self
    where
        I: IntoIterator<Item = Script>,
    {
        let mut scripts = scripts.into_iter().collect::<Vec<_>>();
        scripts.reverse();
        Self {
            replies: std::sync::Mutex::new(Replies::Fixed(scripts)),
        }
    }

    /// Offline stand-in for a real assistant.
    pub fn echo(fragment_delay: Duration) -> Self {
        Self {
            replies: std::sync::Mutex::new(Replies::Echo {
                fragment_delay,
                suffix: " (offline echo)".to_string(),
            }),
        }
    }

    fn next_script(&self, request: &StreamRequest) -> SourceResult<Script> {
        let mut replies = self.replies.lock().map_err(|_| SourceError::Scripted {
            stage: "lock-scripts",
            description: "script queue is unavailable".to_string(),
        })?;

        match &mut *replies {
            Replies::Fixed(scripts) => scripts.pop().ok_or_else(|| {
                ScriptedSnafu {
                    stage: "next-script",
                    description: "no scripted reply left".to_string(),
                }
                .build()
            }),
            Replies::Echo {
                fragment_delay,
                suffix,
            } => {
                let prompt = request
                    .latest_user_message()
                    .map(|message| message.content.clone())
                    .unwrap_or_default();
                let mut fragments = split_words(&format!("You said: {prompt}"));
                fragments.push(suffix.clone());
                Ok(Script::completing(fragments).with_fragment_delay(*fragment_delay))
            }
        }
    }

    async fn run_stream_worker(
        script: Script,
        mut sink: ChunkSink,
        mut cancel_rx: oneshot::Receiver<()>,
    ) {
        for fragment in script.fragments {
            if !script.fragment_delay.is_zero() {
                tokio::select! {
                    _ = &mut cancel_rx => return,
                    _ = tokio::time::sleep(script.fragment_delay) => {}
                }
            }
            if !sink.increment(fragment) {
                return;
            }
        }

        if !script.fragment_delay.is_zero() {
            tokio::select! {
                _ = &mut cancel_rx => return,
                _ = tokio::time::sleep(script.fragment_delay) => {}
            }
        }

        match script.outcome {
            ScriptedOutcome::Complete => sink.complete(),
            ScriptedOutcome::Fail(description) => sink.fail(&SourceError::Scripted {
                stage: "scripted-outcome",
                description,
            }),
            ScriptedOutcome::Hangup => {}
        }
    }
}

impl ChunkSource for ScriptedSource {
    fn id(&self) -> &str {
        SCRIPTED_SOURCE_ID
    }

    fn open(&self, request: StreamRequest) -> SourceResult<SourceHandle> {
        let script = self.next_script(&request)?;
        let (sink, stream, cancel_rx) = make_event_stream(request.session);
        let worker: SourceWorker = Box::pin(Self::run_stream_worker(script, sink, cancel_rx));
        Ok(SourceHandle { stream, worker })
    }
}

/// Splits text into word-sized fragments that keep their leading whitespace.
fn split_words(text: &str) -> Vec<String> {
    let mut fragments = Vec::new();
    let mut current = String::new();

    for ch in text.chars() {
        if ch.is_whitespace() && !current.trim().is_empty() {
            fragments.push(std::mem::take(&mut current));
        }
        current.push(ch);
    }
    if !current.is_empty() {
        fragments.push(current);
    }

    fragments
}

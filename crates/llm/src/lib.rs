//! Chunk sources: ordered producers of reply text that end in completion or failure.

use std::sync::Arc;
use std::time::Duration;

mod decode;
mod http_body;
mod rig_adapter;
mod scripted;
mod source;

pub use decode::Utf8StreamDecoder;
pub use http_body::{DEFAULT_HTTP_ENDPOINT, HTTP_BODY_SOURCE_ID, HttpBodySource};
pub use rig_adapter::{DEFAULT_OPENAI_MODEL, RIG_OPENAI_SOURCE_ID, RigChunkSource};
pub use scripted::{SCRIPTED_SOURCE_ID, Script, ScriptedOutcome, ScriptedSource};
pub use source::{
    ChunkEvent, ChunkPayload, ChunkSource, ChunkStream, Role, SessionId, SourceConfig,
    SourceError, SourceHandle, SourceMessage, SourceResult, SourceWorker, StreamRequest,
};

/// Pause between echoed words when running without a backend.
pub const OFFLINE_ECHO_DELAY: Duration = Duration::from_millis(120);

pub fn create_source(mut config: SourceConfig) -> SourceResult<Arc<dyn ChunkSource>> {
    if config.source_kind.trim().is_empty() {
        config.source_kind = HTTP_BODY_SOURCE_ID.to_string();
    }

    match config.source_kind.as_str() {
        "http" => Ok(Arc::new(HttpBodySource::new(config)?)),
        "openai" | "rig-openai" => {
            config.source_kind = RIG_OPENAI_SOURCE_ID.to_string();
            Ok(Arc::new(RigChunkSource::new(config)?))
        }
        "scripted" | "offline" => Ok(Arc::new(ScriptedSource::echo(OFFLINE_ECHO_DELAY))),
        _ => Err(SourceError::UnsupportedSource {
            stage: "create-source",
            source_kind: config.source_kind,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_kind_defaults_to_http() {
        let source = create_source(SourceConfig::new("", "", "")).unwrap();
        assert_eq!(source.id(), HTTP_BODY_SOURCE_ID);
    }

    #[test]
    fn openai_alias_maps_to_rig_source() {
        let source = create_source(SourceConfig::new("rig-openai", "sk-test", "")).unwrap();
        assert_eq!(source.id(), RIG_OPENAI_SOURCE_ID);
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let result = create_source(SourceConfig::new("carrier-pigeon", "", ""));
        assert!(matches!(result, Err(SourceError::UnsupportedSource { .. })));
    }
}

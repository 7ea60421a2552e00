use quill_llm::{ChunkEvent, SessionId};

use super::message::{Message, MessageId};
use super::typewriter::ScheduledTick;

/// Change notification for whoever renders the conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionUpdate {
    MessageAppended(Message),
    MessageUpdated(Message),
    RevealAdvanced {
        message_id: MessageId,
        displayed_chars: usize,
    },
    /// Sent once per reveal, when the whole final text is on screen.
    RevealCompleted(MessageId),
}

/// Something the controller was waiting for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Wakeup {
    Chunk(ChunkEvent),
    /// The chunk channel closed.
    StreamClosed(SessionId),
    Tick(ScheduledTick),
}

use std::time::SystemTime;

use super::accumulator::MessageAccumulator;

/// Stable identifier for one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageId(pub u64);

impl MessageId {
    /// Creates a typed message identifier.
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }
}

/// Chat speaker role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    User,
    Assistant,
}

/// Lifecycle status for one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageStatus {
    Finalized,
    InFlight,
    Failed,
}

impl MessageStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::InFlight)
    }
}

/// Immutable snapshot of one conversational turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: MessageId,
    pub role: Role,
    pub text: String,
    pub status: MessageStatus,
    pub suggestions: Option<Vec<String>>,
    pub created_at: SystemTime,
}

impl Message {
    /// Creates a message with explicit status.
    pub fn new(id: MessageId, role: Role, text: impl Into<String>, status: MessageStatus) -> Self {
        Self {
            id,
            role,
            text: text.into(),
            status,
            suggestions: None,
            created_at: SystemTime::now(),
        }
    }

    /// User turns are final the moment they are created.
    pub fn user(id: MessageId, text: impl Into<String>) -> Self {
        Self::new(id, Role::User, text, MessageStatus::Finalized)
    }

    /// Creates the empty assistant placeholder that receives increments.
    pub fn assistant_in_flight(id: MessageId) -> Self {
        Self::new(id, Role::Assistant, String::new(), MessageStatus::InFlight)
    }

    /// Creates an already-final assistant turn, e.g. a greeting.
    pub fn assistant_finalized(
        id: MessageId,
        text: impl Into<String>,
        suggestions: Vec<String>,
    ) -> Self {
        let mut message = Self::new(id, Role::Assistant, text, MessageStatus::Finalized);
        message.suggestions = normalize_suggestions(suggestions);
        message
    }

    /// Number of reveal units (Unicode scalar values) in the text.
    pub fn char_len(&self) -> usize {
        self.text.chars().count()
    }
}

/// Drops blank entries; an empty list becomes `None`.
pub fn normalize_suggestions(suggestions: Vec<String>) -> Option<Vec<String>> {
    let suggestions = suggestions
        .into_iter()
        .map(|suggestion| suggestion.trim().to_string())
        .filter(|suggestion| !suggestion.is_empty())
        .collect::<Vec<_>>();

    if suggestions.is_empty() {
        None
    } else {
        Some(suggestions)
    }
}

/// Why a message could not be added to the conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversationRejection {
    /// Another assistant message is still receiving increments.
    InFlightExists { active: MessageId },
    /// The message status does not fit the slot it was offered to.
    UnexpectedStatus(MessageStatus),
}

/// Ordered history plus at most one message that is still growing.
///
/// Frozen messages never change. The in-flight message, if any, is always last.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Conversation {
    frozen: Vec<Message>,
    in_flight: Option<MessageAccumulator>,
}

impl Conversation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a terminal message (user turn, greeting).
    pub fn push_frozen(&mut self, message: Message) -> Result<(), ConversationRejection> {
        if let Some(active) = self.in_flight() {
            return Err(ConversationRejection::InFlightExists { active: active.id });
        }
        if !message.status.is_terminal() {
            return Err(ConversationRejection::UnexpectedStatus(message.status));
        }
        self.frozen.push(message);
        Ok(())
    }

    /// Installs the single in-flight message.
    pub fn open_in_flight(&mut self, message: Message) -> Result<(), ConversationRejection> {
        if let Some(active) = self.in_flight() {
            return Err(ConversationRejection::InFlightExists { active: active.id });
        }
        if message.status != MessageStatus::InFlight {
            return Err(ConversationRejection::UnexpectedStatus(message.status));
        }
        self.in_flight = Some(MessageAccumulator::new(message));
        Ok(())
    }

    pub fn in_flight(&self) -> Option<&Message> {
        self.in_flight.as_ref().map(MessageAccumulator::message)
    }

    pub(crate) fn accumulator_mut(&mut self) -> Option<&mut MessageAccumulator> {
        self.in_flight.as_mut()
    }

    /// Moves the in-flight message into history once it reached a terminal status.
    pub(crate) fn freeze_in_flight(&mut self) -> Option<&Message> {
        let accumulator = self.in_flight.take_if(|accumulator| accumulator.is_terminal())?;
        self.frozen.push(accumulator.into_message());
        self.frozen.last()
    }

    pub fn has_in_flight(&self) -> bool {
        self.in_flight.is_some()
    }

    pub fn len(&self) -> usize {
        self.frozen.len() + usize::from(self.in_flight.is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Messages in creation order.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &Message> {
        self.frozen.iter().chain(self.in_flight())
    }

    pub fn get(&self, id: MessageId) -> Option<&Message> {
        self.iter().find(|message| message.id == id)
    }

    pub fn last(&self) -> Option<&Message> {
        self.in_flight().or_else(|| self.frozen.last())
    }

    /// Immutable copy of the whole conversation.
    pub fn snapshot(&self) -> Vec<Message> {
        self.iter().cloned().collect()
    }
}

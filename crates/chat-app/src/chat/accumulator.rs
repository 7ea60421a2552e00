use super::message::{Message, MessageStatus, normalize_suggestions};

/// Why an accumulator operation left the message untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccumulatorRejection {
    /// The message already completed or failed.
    Terminal(MessageStatus),
}

/// Result of applying one operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Applied {
    /// The message changed; carries the snapshot to notify with.
    Updated(Message),
    /// Nothing to apply (empty fragment or empty batch).
    Unchanged,
    Rejected(AccumulatorRejection),
}

impl Applied {
    pub fn update(self) -> Option<Message> {
        match self {
            Self::Updated(message) => Some(message),
            Self::Unchanged | Self::Rejected(_) => None,
        }
    }
}

/// Owns the text received so far for the in-flight assistant message.
///
/// Increments are appended in call order. Once `on_complete` or `on_error` has run the
/// message is terminal and every later call is a rejected no-op.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageAccumulator {
    message: Message,
}

impl MessageAccumulator {
    pub fn new(message: Message) -> Self {
        Self { message }
    }

    pub fn message(&self) -> &Message {
        &self.message
    }

    pub fn text(&self) -> &str {
        &self.message.text
    }

    pub fn status(&self) -> MessageStatus {
        self.message.status
    }

    pub fn is_terminal(&self) -> bool {
        self.message.status.is_terminal()
    }

    pub fn into_message(self) -> Message {
        self.message
    }

    pub fn on_increment(&mut self, fragment: &str) -> Applied {
        self.on_increments(std::iter::once(fragment))
    }

    /// Applies a burst of increments and reports a single update for all of them.
    pub fn on_increments<'a, I>(&mut self, fragments: I) -> Applied
    where
        I: IntoIterator<Item = &'a str>,
    {
        if let Some(rejection) = self.terminal_rejection() {
            return Applied::Rejected(rejection);
        }

        let before = self.message.text.len();
        for fragment in fragments {
            self.message.text.push_str(fragment);
        }

        if self.message.text.len() == before {
            Applied::Unchanged
        } else {
            Applied::Updated(self.message.clone())
        }
    }

    /// Marks the message finalized. The text is already complete.
    pub fn on_complete(&mut self, suggestions: Vec<String>) -> Applied {
        if let Some(rejection) = self.terminal_rejection() {
            return Applied::Rejected(rejection);
        }

        self.message.status = MessageStatus::Finalized;
        self.message.suggestions = normalize_suggestions(suggestions);
        Applied::Updated(self.message.clone())
    }

    /// Marks the message failed and replaces whatever arrived with `description`.
    pub fn on_error(&mut self, description: impl Into<String>) -> Applied {
        if let Some(rejection) = self.terminal_rejection() {
            return Applied::Rejected(rejection);
        }

        self.message.status = MessageStatus::Failed;
        self.message.text = description.into();
        self.message.suggestions = None;
        Applied::Updated(self.message.clone())
    }

    fn terminal_rejection(&self) -> Option<AccumulatorRejection> {
        self.is_terminal()
            .then_some(AccumulatorRejection::Terminal(self.message.status))
    }
}

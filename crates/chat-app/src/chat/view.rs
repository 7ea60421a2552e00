use super::disclosure::suggestions_visible;
use super::message::{Message, MessageId, MessageStatus, Role};
use super::typewriter::Typewriter;

/// Render-ready projection of one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageView {
    pub id: MessageId,
    pub role: Role,
    pub status: MessageStatus,
    pub text_to_display: String,
    pub is_animating: bool,
    pub suggestions_visible: bool,
    pub suggestions: Vec<String>,
}

impl MessageView {
    pub fn project(message: &Message, typewriter: &Typewriter) -> Self {
        let reveal = match (message.role, message.status) {
            (Role::User, _) | (_, MessageStatus::Failed) => None,
            (Role::Assistant, _) => typewriter.state(message.id),
        };

        let text_to_display = match reveal {
            Some(state) => message
                .text
                .get(..state.displayed_bytes())
                .unwrap_or_default()
                .to_string(),
            None => message.text.clone(),
        };

        let phase = typewriter.phase(message.id);
        let suggestions = message.suggestions.clone().unwrap_or_default();

        Self {
            id: message.id,
            role: message.role,
            status: message.status,
            text_to_display,
            is_animating: reveal.is_some(),
            suggestions_visible: suggestions_visible(
                message.status,
                phase,
                message.suggestions.as_deref(),
            ),
            suggestions,
        }
    }

    pub fn visible_suggestions(&self) -> &[String] {
        if self.suggestions_visible {
            &self.suggestions
        } else {
            &[]
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::time::Instant;

    use super::*;
    use crate::chat::typewriter::{RevealPacing, TickOutcome};

    #[test]
    fn user_messages_show_full_text() {
        let typewriter = Typewriter::default();
        let view = MessageView::project(&Message::user(MessageId::new(1), "Hello"), &typewriter);

        assert_eq!(view.text_to_display, "Hello");
        assert!(!view.is_animating);
        assert!(!view.suggestions_visible);
    }

    #[test]
    fn revealing_assistant_shows_prefix_and_hides_chips() {
        let id = MessageId::new(2);
        let mut typewriter = Typewriter::with_seed(RevealPacing::default(), 3);
        typewriter.begin(id);
        let mut message =
            Message::assistant_finalized(id, "Hi there", vec!["Tell me more".to_string()]);

        typewriter.on_growth(id, &message.text, Instant::now());
        let tick = typewriter.next_tick().unwrap();
        typewriter.fire(tick, &message.text, true, tick.due);

        let view = MessageView::project(&message, &typewriter);
        assert_eq!(view.text_to_display, "H");
        assert!(view.is_animating);
        assert!(!view.suggestions_visible);
        assert!(view.visible_suggestions().is_empty());

        let mut outcome = TickOutcome::Stale;
        while let Some(tick) = typewriter.next_tick() {
            outcome = typewriter.fire(tick, &message.text, true, tick.due);
        }
        assert_eq!(outcome, TickOutcome::Completed { displayed_chars: 8 });

        let view = MessageView::project(&message, &typewriter);
        assert_eq!(view.text_to_display, "Hi there");
        assert!(!view.is_animating);
        assert_eq!(view.visible_suggestions(), ["Tell me more".to_string()]);

        message.status = MessageStatus::Failed;
        assert!(!MessageView::project(&message, &typewriter).suggestions_visible);
    }

    #[test]
    fn failed_message_shows_error_text_at_once() {
        let id = MessageId::new(3);
        let mut typewriter = Typewriter::default();
        typewriter.begin(id);

        let message = Message::new(
            id,
            Role::Assistant,
            "Error: connection reset",
            MessageStatus::Failed,
        );
        let view = MessageView::project(&message, &typewriter);
        assert_eq!(view.text_to_display, "Error: connection reset");
        assert!(!view.is_animating);
    }
}

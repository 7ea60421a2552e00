use super::message::MessageStatus;
use super::typewriter::RevealPhase;

/// Whether suggestion chips may be shown under a message.
///
/// Only a finalized message with a non-empty list whose reveal has finished qualifies.
pub fn suggestions_visible(
    status: MessageStatus,
    phase: RevealPhase,
    suggestions: Option<&[String]>,
) -> bool {
    status == MessageStatus::Finalized
        && phase == RevealPhase::Done
        && suggestions.is_some_and(|suggestions| !suggestions.is_empty())
}

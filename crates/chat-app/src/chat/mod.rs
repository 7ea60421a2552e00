mod accumulator;
/// Change notifications and controller wakeups.
pub mod events;
/// Domain entities and the single-in-flight conversation.
pub mod message;
pub mod session;
pub mod typewriter;
pub mod view;

mod disclosure;

pub use accumulator::{AccumulatorRejection, Applied, MessageAccumulator};
pub use disclosure::suggestions_visible;
pub use events::{SessionUpdate, Wakeup};
pub use message::{
    Conversation, ConversationRejection, Message, MessageId, MessageStatus, Role,
    normalize_suggestions,
};
pub use session::{
    CANCELLED_TEXT, DEFAULT_SUGGESTIONS, GENERIC_FAILURE_TEXT, SessionController, SessionOptions,
    SubmitOutcome, SubmitRejection, describe_failure,
};
pub use typewriter::{
    RevealGeneration, RevealPacing, RevealPhase, RevealState, ScheduledTick, TickOutcome,
    Typewriter,
};
pub use view::MessageView;

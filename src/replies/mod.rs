//! Inbound reply handling: classification and the conversation state
//! machine.

mod classifier;
mod conversation;

pub use classifier::{classify_keywords, IntentDetection, ReplyClassifier};
pub use conversation::{ConversationEngine, InboundOutcome};

//! Outbound SMS pipeline: TCPA gate, dispatcher, gateway client,
//! message generation.

mod dispatcher;
pub mod message;
pub mod twilio;
mod validator;

pub use dispatcher::{DispatchOutcome, OutreachDispatcher};
pub use validator::{validate_can_send, BlockedCode, SendBlocked};

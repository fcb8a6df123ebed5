//! Command dispatch: payload classification and the record/replay state machine.

pub mod command;
pub mod dispatcher;

pub use command::{Action, CommandMessage};
pub use dispatcher::{CommandDispatcher, DispatchError, DispatchOutcome, LearnSettings};

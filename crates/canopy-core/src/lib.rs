//! Client-resident transport state for Canopy.
//!
//! Everything here is driven by discrete, serialized events so the state
//! machines can be replayed deterministically in tests.

pub mod connection;
pub mod modal;
pub mod runtime;
pub mod store;
pub mod stream;

pub use connection::{ConnectionSnapshot, ConnectionStatus, ConnectionTracker};
pub use modal::{
    AnswerValue, Answers, ModalError, ModalEvent, ModalState, Question, QuestionBatch,
    QuestionKind, TimedResponseMachine,
};
pub use runtime::{spawn_ticker, ClientRuntime, EventSender, QueueClosed};
pub use store::{ClientEvent, ClientStore, StoreEvent};
pub use stream::{StreamFrame, StreamMonitor, StreamOutcome, DONE_MARKER};

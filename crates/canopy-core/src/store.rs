//! Client state container.
//!
//! [`ClientStore`] owns the connection tracker and the timed-response machine.
//! It is mutated only through [`ClientStore::dispatch`], one [`ClientEvent`]
//! at a time, and broadcasts a [`StoreEvent`] for every observable change.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::connection::{ConnectionSnapshot, ConnectionStatus, ConnectionTracker};
use crate::modal::{AnswerValue, Answers, ModalEvent, Question, TimedResponseMachine};

/// The declared action set. Everything that can change client state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ClientEvent {
    /// Transport status change reported by the transport layer.
    Status { status: ConnectionStatus },
    /// One-second clock tick.
    Tick,
    OpenModal {
        batch_id: String,
        questions: Vec<Question>,
        timeout_seconds: u32,
    },
    CloseModal,
    SetAnswer { question: String, value: AnswerValue },
    Submit,
    SubmitAnswers { batch_id: String, answers: Answers },
    ResetModal,
}

impl ClientEvent {
    pub fn status(status: ConnectionStatus) -> Self {
        Self::Status { status }
    }
}

/// Change notifications published to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StoreEvent {
    Connection(ConnectionSnapshot),
    Modal(ModalEvent),
    /// An action was refused by the machine it targeted.
    Rejected { reason: String },
}

#[derive(Debug)]
pub struct ClientStore {
    connection: ConnectionTracker,
    modal: TimedResponseMachine,
    sender: broadcast::Sender<StoreEvent>,
}

impl Default for ClientStore {
    fn default() -> Self {
        Self::new(256)
    }
}

impl ClientStore {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            connection: ConnectionTracker::new(),
            modal: TimedResponseMachine::new(),
            sender,
        }
    }

    /// Apply one event and publish the resulting notification, if any.
    pub fn dispatch(&mut self, event: ClientEvent) -> Option<StoreEvent> {
        let outcome = match event {
            ClientEvent::Status { status } => {
                self.connection.apply(status).map(StoreEvent::Connection)
            }
            ClientEvent::Tick => self.modal.tick().map(StoreEvent::Modal),
            ClientEvent::OpenModal {
                batch_id,
                questions,
                timeout_seconds,
            } => Some(StoreEvent::Modal(
                self.modal.open_modal(batch_id, questions, timeout_seconds),
            )),
            ClientEvent::CloseModal => self.modal.close_modal().map(StoreEvent::Modal),
            ClientEvent::SetAnswer { question, value } => {
                Some(Self::settle(self.modal.set_answer(&question, value)))
            }
            ClientEvent::Submit => Some(Self::settle(self.modal.submit())),
            ClientEvent::SubmitAnswers { batch_id, answers } => {
                Some(StoreEvent::Modal(self.modal.submit_answers(batch_id, answers)))
            }
            ClientEvent::ResetModal => Some(StoreEvent::Modal(self.modal.reset())),
        };

        if let Some(ref notification) = outcome {
            // No subscribers is fine.
            let _ = self.sender.send(notification.clone());
        }
        outcome
    }

    /// Apply a recorded sequence of events in order. Returns every
    /// notification produced, in order.
    pub fn replay<I>(&mut self, events: I) -> Vec<StoreEvent>
    where
        I: IntoIterator<Item = ClientEvent>,
    {
        events
            .into_iter()
            .filter_map(|event| self.dispatch(event))
            .collect()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn connection(&self) -> &ConnectionTracker {
        &self.connection
    }

    pub fn modal(&self) -> &TimedResponseMachine {
        &self.modal
    }

    fn settle(result: Result<ModalEvent, crate::modal::ModalError>) -> StoreEvent {
        match result {
            Ok(event) => StoreEvent::Modal(event),
            Err(e) => {
                tracing::debug!("Modal action rejected: {}", e);
                StoreEvent::Rejected {
                    reason: e.to_string(),
                }
            }
        }
    }
}

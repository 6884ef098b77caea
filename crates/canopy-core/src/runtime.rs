//! Single ordered event queue feeding the [`ClientStore`].
//!
//! Producers (transport callbacks, the tick clock, user input) hold an
//! [`EventSender`]. One task drains the queue and applies events to the
//! store in arrival order.

use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use crate::store::{ClientEvent, ClientStore, StoreEvent};

#[derive(Debug, thiserror::Error)]
#[error("Client event queue closed")]
pub struct QueueClosed;

/// Cloneable handle for submitting events.
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: mpsc::UnboundedSender<ClientEvent>,
}

impl EventSender {
    pub fn send(&self, event: ClientEvent) -> Result<(), QueueClosed> {
        self.tx.send(event).map_err(|_| QueueClosed)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

pub struct ClientRuntime {
    store: ClientStore,
    rx: mpsc::UnboundedReceiver<ClientEvent>,
}

impl ClientRuntime {
    pub fn new(store: ClientStore) -> (Self, EventSender) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { store, rx }, EventSender { tx })
    }

    /// Subscribe before starting the runtime to see every notification.
    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.store.subscribe()
    }

    /// Drain the queue until every sender is dropped, then hand the store
    /// back.
    pub async fn run(mut self) -> ClientStore {
        while let Some(event) = self.rx.recv().await {
            self.store.dispatch(event);
        }
        tracing::debug!("Client event queue drained");
        self.store
    }

    pub fn spawn(self) -> JoinHandle<ClientStore> {
        tokio::spawn(self.run())
    }
}

/// Emit [`ClientEvent::Tick`] every `period` until the queue closes.
pub fn spawn_ticker(sender: EventSender, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        // The first tick of an interval completes immediately.
        interval.tick().await;
        loop {
            interval.tick().await;
            if sender.send(ClientEvent::Tick).is_err() {
                break;
            }
        }
    })
}

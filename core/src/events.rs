use std::fmt;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Mutex;

use serde_json::{json, Value};

use crate::error::{CoreError, CoreResult};

const EVENT_PREFIX: &str = "model_manager";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    CreateDownloadTask,
    UpdateDownloadTask,
    CompleteDownloadTask,
    ErrorDownloadTask,
    DeleteDownloadTask,
    ModelFound,
    ScanComplete,
    ScanError,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::CreateDownloadTask => "create_download_task",
            EventKind::UpdateDownloadTask => "update_download_task",
            EventKind::CompleteDownloadTask => "complete_download_task",
            EventKind::ErrorDownloadTask => "error_download_task",
            EventKind::DeleteDownloadTask => "delete_download_task",
            EventKind::ModelFound => "model_found",
            EventKind::ScanComplete => "scan_complete",
            EventKind::ScanError => "scan_error",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub kind: EventKind,
    pub data: Value,
}

impl Event {
    /// `{"type": "model_manager/<name>", "data": ...}`
    pub fn to_wire(&self) -> Value {
        json!({
            "type": format!("{}/{}", EVENT_PREFIX, self.kind.as_str()),
            "data": self.data,
        })
    }
}

/// A live observer. Returning an error evicts the subscriber.
pub trait Subscriber: Send {
    fn deliver(&self, event: &Event) -> CoreResult<()>;
}

impl Subscriber for Sender<Event> {
    fn deliver(&self, event: &Event) -> CoreResult<()> {
        self.send(event.clone())
            .map_err(|_| CoreError::Io("subscriber disconnected".to_string()))
    }
}

/// Fan-out of named events to every current subscriber. Events are not
/// buffered for late subscribers.
#[derive(Default)]
pub struct Broadcaster {
    subscribers: Mutex<Vec<(u64, Box<dyn Subscriber>)>>,
    next_id: Mutex<u64>,
}

impl Broadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> Receiver<Event> {
        let (tx, rx) = mpsc::channel();
        self.add_subscriber(Box::new(tx));
        rx
    }

    pub fn add_subscriber(&self, subscriber: Box<dyn Subscriber>) -> u64 {
        let id = match self.next_id.lock() {
            Ok(mut next) => {
                *next += 1;
                *next
            }
            Err(_) => 0,
        };
        if let Ok(mut subscribers) = self.subscribers.lock() {
            subscribers.push((id, subscriber));
        }
        id
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().map(|subs| subs.len()).unwrap_or(0)
    }

    pub fn broadcast(&self, kind: EventKind, data: Value) {
        let event = Event { kind, data };
        let Ok(mut subscribers) = self.subscribers.lock() else {
            tracing::error!(event = %kind, "subscriber list poisoned; event dropped");
            return;
        };
        subscribers.retain(|(id, subscriber)| match subscriber.deliver(&event) {
            Ok(()) => true,
            Err(err) => {
                tracing::warn!(subscriber = id, event = %kind, "evicting subscriber: {}", err);
                false
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Broken;

    impl Subscriber for Broken {
        fn deliver(&self, _event: &Event) -> CoreResult<()> {
            Err(CoreError::Io("socket closed".to_string()))
        }
    }

    #[test]
    fn failing_subscriber_is_evicted_others_still_receive() {
        let broadcaster = Broadcaster::new();
        let rx = broadcaster.subscribe();
        broadcaster.add_subscriber(Box::new(Broken));
        assert_eq!(broadcaster.subscriber_count(), 2);

        broadcaster.broadcast(EventKind::ScanComplete, json!({"folder": "loras"}));
        assert_eq!(broadcaster.subscriber_count(), 1);
        let event = rx.try_recv().unwrap();
        assert_eq!(event.kind, EventKind::ScanComplete);

        broadcaster.broadcast(EventKind::ScanError, json!({}));
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn dropped_receiver_is_evicted() {
        let broadcaster = Broadcaster::new();
        drop(broadcaster.subscribe());
        broadcaster.broadcast(EventKind::ModelFound, json!({}));
        assert_eq!(broadcaster.subscriber_count(), 0);
    }

    #[test]
    fn wire_form_is_namespaced() {
        let event = Event {
            kind: EventKind::UpdateDownloadTask,
            data: json!({"progress": 10}),
        };
        let wire = event.to_wire();
        assert_eq!(wire["type"], "model_manager/update_download_task");
        assert_eq!(wire["data"]["progress"], 10);
    }
}

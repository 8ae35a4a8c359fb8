//! Typed event bus.
//!
//! Every observable step of a run is published as an [`AgentEvent`] on the
//! owning agent's [`EventBus`].  Delivery is synchronous and in publish order:
//! [`EventBus::publish`] returns only after every handler that was subscribed
//! at the moment of publishing has seen the event.
//!
//! The handler list is snapshotted under a read lock and the lock is released
//! before delivery, so a handler may subscribe or unsubscribe (itself or
//! others) without deadlocking; such changes apply from the next publish.
//! A panicking handler is isolated: the panic is caught and logged and the
//! remaining handlers still receive the event.
//!
//! # Usage
//!
//! ```rust
//! # use miniagent_kernel::events::{AgentEvent, EventBus};
//! # use uuid::Uuid;
//! let bus = EventBus::new();
//! let sub = bus.subscribe(|event| println!("{}", event.kind()));
//!
//! bus.publish(AgentEvent::AgentEnd { run_id: Uuid::now_v7() });
//! sub.unsubscribe();
//! ```

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Event types
// ---------------------------------------------------------------------------

/// An event emitted during a run.
///
/// Every variant carries the `run_id` of the run that produced it so that
/// subscribers observing several concurrent runs can tell them apart.  For a
/// single run the events form a total order:
///
/// ```text
/// agent_start
///   ( message_delta* message_end
///     ( tool_execution_start (tool_execution_end | tool_skipped) )* )*
///   compaction?
/// agent_end | agent_error
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    /// A run began.
    AgentStart {
        run_id: Uuid,
        session_key: String,
        model: String,
    },

    /// The run completed successfully.  Always the last event of the run.
    AgentEnd { run_id: Uuid },

    /// The run failed or was cancelled.  Always the last event of the run.
    AgentError { run_id: Uuid, error: String },

    /// An incremental text fragment from the model.
    MessageDelta { run_id: Uuid, delta: String },

    /// The model finished one response; `text` is the full text of the turn.
    MessageEnd { run_id: Uuid, text: String },

    /// A tool call is about to be dispatched.
    ToolExecutionStart {
        run_id: Uuid,
        call_id: String,
        tool_name: String,
        args: Value,
    },

    /// A tool call finished (successfully or with an error result).
    ToolExecutionEnd {
        run_id: Uuid,
        call_id: String,
        tool_name: String,
        result: String,
        is_error: bool,
    },

    /// A tool call was not executed.
    ToolSkipped {
        run_id: Uuid,
        call_id: String,
        tool_name: String,
        reason: String,
    },

    /// History was compacted.
    Compaction {
        run_id: Uuid,
        summary_chars: usize,
        dropped_messages: usize,
    },

    /// A delegated subagent finished; emitted on the parent's bus.
    SubagentSummary {
        run_id: Uuid,
        label: Option<String>,
        summary: String,
    },

    /// A delegated subagent failed; emitted on the parent's bus.
    SubagentError {
        run_id: Uuid,
        label: Option<String>,
        error: String,
    },
}

impl AgentEvent {
    /// The snake_case wire name of this event.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::AgentStart { .. } => "agent_start",
            Self::AgentEnd { .. } => "agent_end",
            Self::AgentError { .. } => "agent_error",
            Self::MessageDelta { .. } => "message_delta",
            Self::MessageEnd { .. } => "message_end",
            Self::ToolExecutionStart { .. } => "tool_execution_start",
            Self::ToolExecutionEnd { .. } => "tool_execution_end",
            Self::ToolSkipped { .. } => "tool_skipped",
            Self::Compaction { .. } => "compaction",
            Self::SubagentSummary { .. } => "subagent_summary",
            Self::SubagentError { .. } => "subagent_error",
        }
    }

    /// The run that emitted this event.
    pub fn run_id(&self) -> Uuid {
        match self {
            Self::AgentStart { run_id, .. }
            | Self::AgentEnd { run_id }
            | Self::AgentError { run_id, .. }
            | Self::MessageDelta { run_id, .. }
            | Self::MessageEnd { run_id, .. }
            | Self::ToolExecutionStart { run_id, .. }
            | Self::ToolExecutionEnd { run_id, .. }
            | Self::ToolSkipped { run_id, .. }
            | Self::Compaction { run_id, .. }
            | Self::SubagentSummary { run_id, .. }
            | Self::SubagentError { run_id, .. } => *run_id,
        }
    }

    /// Whether this event terminates its run's stream.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::AgentEnd { .. } | Self::AgentError { .. })
    }
}

// ---------------------------------------------------------------------------
// Event bus
// ---------------------------------------------------------------------------

/// A subscriber callback.
pub type EventHandler = Arc<dyn Fn(&AgentEvent) + Send + Sync>;

/// Synchronous publish/subscribe bus for [`AgentEvent`]s.
///
/// Cheaply cloneable (`Arc`-backed); clones share the same subscriber list.
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

#[derive(Default)]
struct BusInner {
    next_id: AtomicU64,
    handlers: RwLock<Vec<(u64, EventHandler)>>,
}

impl BusInner {
    fn remove(&self, id: u64) -> bool {
        let mut handlers = match self.handlers.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let before = handlers.len();
        handlers.retain(|(hid, _)| *hid != id);
        handlers.len() != before
    }
}

impl EventBus {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for all subsequent events.
    pub fn subscribe<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&AgentEvent) + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.register(id, Arc::new(handler))
    }

    /// Subscribe through an unbounded channel, for async consumers.
    ///
    /// The handler detaches itself on the first event published after the
    /// receiver is dropped, so a forgotten [`Subscription`] does not linger.
    pub fn subscribe_channel(&self) -> (Subscription, mpsc::UnboundedReceiver<AgentEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let bus = Arc::downgrade(&self.inner);
        let sub = self.register(
            id,
            Arc::new(move |event: &AgentEvent| {
                if tx.send(event.clone()).is_err()
                    && bus.upgrade().is_some_and(|inner| inner.remove(id))
                {
                    tracing::trace!(
                        subscription_id = id,
                        "channel receiver dropped; handler removed"
                    );
                }
            }),
        );
        (sub, rx)
    }

    fn register(&self, id: u64, handler: EventHandler) -> Subscription {
        {
            let mut handlers = match self.inner.handlers.write() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            handlers.push((id, handler));
        }
        tracing::trace!(subscription_id = id, "event handler subscribed");
        Subscription {
            id,
            bus: Arc::downgrade(&self.inner),
            active: AtomicBool::new(true),
        }
    }

    /// Deliver `event` to every current subscriber, in subscription order.
    ///
    /// Returns the number of handlers that completed without panicking.
    pub fn publish(&self, event: AgentEvent) -> usize {
        let snapshot: Vec<EventHandler> = {
            let handlers = match self.inner.handlers.read() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            handlers.iter().map(|(_, h)| Arc::clone(h)).collect()
        };

        let mut delivered = 0;
        for handler in &snapshot {
            match catch_unwind(AssertUnwindSafe(|| handler(&event))) {
                Ok(()) => delivered += 1,
                Err(_) => {
                    tracing::warn!(
                        event = event.kind(),
                        run_id = %event.run_id(),
                        "event handler panicked; continuing delivery"
                    );
                }
            }
        }
        tracing::trace!(event = event.kind(), delivered, "event published");
        delivered
    }

    /// Number of currently registered handlers.
    pub fn subscriber_count(&self) -> usize {
        match self.inner.handlers.read() {
            Ok(guard) => guard.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

/// Handle returned by [`EventBus::subscribe`].
///
/// Dropping the handle does **not** unsubscribe.
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    bus: Weak<BusInner>,
    active: AtomicBool,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Remove the handler.  Idempotent; returns `true` only on the call that
    /// actually removed it.
    pub fn unsubscribe(&self) -> bool {
        if !self.active.swap(false, Ordering::AcqRel) {
            return false;
        }
        match self.bus.upgrade() {
            Some(inner) => inner.remove(self.id),
            None => false,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn end(run_id: Uuid) -> AgentEvent {
        AgentEvent::AgentEnd { run_id }
    }

    #[test]
    fn handlers_receive_events_in_order() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let _sub = bus.subscribe(move |e| sink.lock().unwrap().push(e.kind()));

        let run_id = Uuid::now_v7();
        bus.publish(AgentEvent::AgentStart {
            run_id,
            session_key: "s".into(),
            model: "m".into(),
        });
        bus.publish(AgentEvent::MessageDelta {
            run_id,
            delta: "hi".into(),
        });
        bus.publish(end(run_id));

        assert_eq!(
            *seen.lock().unwrap(),
            vec!["agent_start", "message_delta", "agent_end"]
        );
    }

    #[test]
    fn publish_without_subscribers_is_fine() {
        let bus = EventBus::new();
        assert_eq!(bus.publish(end(Uuid::now_v7())), 0);
    }

    #[test]
    fn panicking_handler_does_not_block_others() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicU64::new(0));
        let _bad = bus.subscribe(|_| panic!("boom"));
        let c = Arc::clone(&count);
        let _good = bus.subscribe(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        let delivered = bus.publish(end(Uuid::now_v7()));
        assert_eq!(delivered, 1);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unsubscribe_is_idempotent() {
        let bus = EventBus::new();
        let sub = bus.subscribe(|_| {});
        assert_eq!(bus.subscriber_count(), 1);
        assert!(sub.unsubscribe());
        assert!(!sub.unsubscribe());
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn handler_may_unsubscribe_itself_during_delivery() {
        let bus = EventBus::new();
        let slot: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));
        let hits = Arc::new(AtomicU64::new(0));

        let slot_in = Arc::clone(&slot);
        let hits_in = Arc::clone(&hits);
        let sub = bus.subscribe(move |_| {
            hits_in.fetch_add(1, Ordering::SeqCst);
            if let Some(sub) = slot_in.lock().unwrap().as_ref() {
                sub.unsubscribe();
            }
        });
        *slot.lock().unwrap() = Some(sub);

        bus.publish(end(Uuid::now_v7()));
        bus.publish(end(Uuid::now_v7()));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn subscriber_added_mid_publish_sees_next_event_only() {
        let bus = EventBus::new();
        let late_hits = Arc::new(AtomicU64::new(0));
        let added = Arc::new(AtomicBool::new(false));

        let bus_in = bus.clone();
        let late_in = Arc::clone(&late_hits);
        let added_in = Arc::clone(&added);
        let _sub = bus.subscribe(move |_| {
            if !added_in.swap(true, Ordering::SeqCst) {
                let late = Arc::clone(&late_in);
                let _ = bus_in.subscribe(move |_| {
                    late.fetch_add(1, Ordering::SeqCst);
                });
            }
        });

        bus.publish(end(Uuid::now_v7()));
        assert_eq!(late_hits.load(Ordering::SeqCst), 0);
        bus.publish(end(Uuid::now_v7()));
        assert_eq!(late_hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn channel_subscription_forwards_events() {
        let bus = EventBus::new();
        let (sub, mut rx) = bus.subscribe_channel();
        let run_id = Uuid::now_v7();
        bus.publish(AgentEvent::MessageEnd {
            run_id,
            text: "done".into(),
        });
        let event = rx.recv().await.unwrap();
        assert_eq!(event.kind(), "message_end");
        assert_eq!(event.run_id(), run_id);
        sub.unsubscribe();
    }

    #[test]
    fn dropped_channel_receiver_detaches_on_next_publish() {
        let bus = EventBus::new();
        let (sub, rx) = bus.subscribe_channel();
        let (_kept, mut live) = bus.subscribe_channel();
        assert_eq!(bus.subscriber_count(), 2);

        drop(rx);
        let run_id = Uuid::now_v7();
        bus.publish(end(run_id));
        assert_eq!(bus.subscriber_count(), 1);
        assert_eq!(live.try_recv().unwrap().run_id(), run_id);

        // Already removed by the bus.
        assert!(!sub.unsubscribe());
        bus.publish(end(run_id));
        assert_eq!(bus.subscriber_count(), 1);
    }

    #[test]
    fn events_serialize_with_snake_case_tag() {
        let event = AgentEvent::Compaction {
            run_id: Uuid::nil(),
            summary_chars: 42,
            dropped_messages: 7,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "compaction");
        assert_eq!(json["summary_chars"], 42);
        assert!(event.run_id().is_nil());
        assert!(!event.is_terminal());
    }
}

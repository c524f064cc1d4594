//! Event fan-out bus
//!
//! Every stage of every exchange is observable through a [`Hook`]:
//! - wire level: raw frame received, about to be sent, sent
//! - typed level, per action: request received, response ready (inbound
//!   calls), request sending, reply received (outbound calls)
//!
//! Firing is synchronous multicast in registration order. A subscriber that
//! fails or panics is logged and skipped; it never reaches the protocol path.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::action::Action;
use crate::endpoint::Reply;
use crate::error::HandlerError;
use crate::ids::{ChargeBoxId, RequestId};

/// Handle returned by every subscription, used to unsubscribe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl SubscriptionId {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

pub type SubscriberResult = Result<(), HandlerError>;

type Subscriber<E> = Arc<dyn Fn(&E) -> SubscriberResult + Send + Sync>;

/// One hook point with any number of independent subscribers
pub struct Hook<E> {
    name: &'static str,
    subscribers: RwLock<Vec<(SubscriptionId, Subscriber<E>)>>,
}

impl<E: 'static> Hook<E> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            subscribers: RwLock::new(Vec::new()),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Add a fallible subscriber. Errors are logged and otherwise ignored.
    pub fn subscribe<F>(&self, subscriber: F) -> SubscriptionId
    where
        F: Fn(&E) -> SubscriberResult + Send + Sync + 'static,
    {
        let id = SubscriptionId::next();
        self.subscribers.write().push((id, Arc::new(subscriber)));
        id
    }

    /// Add an observer that cannot fail
    pub fn inspect<F>(&self, observer: F) -> SubscriptionId
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        self.subscribe(move |event| {
            observer(event);
            Ok(())
        })
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self.subscribers.write();
        let before = subscribers.len();
        subscribers.retain(|(existing, _)| *existing != id);
        subscribers.len() != before
    }

    pub fn len(&self) -> usize {
        self.subscribers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.read().is_empty()
    }

    /// Invoke every subscriber in registration order.
    ///
    /// Works on a snapshot, so subscribers may (un)subscribe while firing.
    /// Returns how many subscribers completed without error.
    pub fn fire(&self, event: &E) -> usize {
        let snapshot: Vec<(SubscriptionId, Subscriber<E>)> = self
            .subscribers
            .read()
            .iter()
            .map(|(id, subscriber)| (*id, subscriber.clone()))
            .collect();

        let mut succeeded = 0;
        for (id, subscriber) in snapshot {
            match catch_unwind(AssertUnwindSafe(|| subscriber(event))) {
                Ok(Ok(())) => succeeded += 1,
                Ok(Err(e)) => {
                    warn!(hook = self.name, subscription = %id, error = %e, "Event subscriber failed");
                }
                Err(panic) => {
                    warn!(
                        hook = self.name,
                        subscription = %id,
                        panic = %panic_message(panic.as_ref()),
                        "Event subscriber panicked"
                    );
                }
            }
        }
        succeeded
    }
}

impl<E> fmt::Debug for Hook<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hook")
            .field("name", &self.name)
            .field("subscribers", &self.subscribers.read().len())
            .finish()
    }
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

/// Raw frame text as it crosses the transport
#[derive(Debug, Clone)]
pub struct WireFrame {
    pub charge_box_id: ChargeBoxId,
    pub direction: Direction,
    pub text: String,
    pub at: DateTime<Utc>,
}

impl WireFrame {
    pub(crate) fn new(charge_box_id: ChargeBoxId, direction: Direction, text: impl Into<String>) -> Self {
        Self {
            charge_box_id,
            direction,
            text: text.into(),
            at: Utc::now(),
        }
    }
}

/// Hooks that see every frame regardless of action
#[derive(Debug)]
pub struct WireEvents {
    /// Before decoding; fires for undecodable frames too
    pub frame_received: Hook<WireFrame>,
    pub frame_sending: Hook<WireFrame>,
    pub frame_sent: Hook<WireFrame>,
}

impl Default for WireEvents {
    fn default() -> Self {
        Self {
            frame_received: Hook::new("frame_received"),
            frame_sending: Hook::new("frame_sending"),
            frame_sent: Hook::new("frame_sent"),
        }
    }
}

/// A parsed peer-initiated request.
///
/// Passed to business handlers and to `request_received` subscribers. The
/// `cancel` token fires when the connection is torn down.
#[derive(Debug, Clone)]
pub struct InboundRequest<Req> {
    pub request_id: RequestId,
    pub charge_box_id: ChargeBoxId,
    pub action: &'static str,
    pub request: Req,
    pub received_at: DateTime<Utc>,
    pub cancel: CancellationToken,
}

/// The response chosen for an inbound request, just before it is encoded
#[derive(Debug, Clone)]
pub struct Responded<Req, Resp> {
    pub request_id: RequestId,
    pub charge_box_id: ChargeBoxId,
    pub request: Req,
    pub response: Resp,
    /// No handler answered; this is the action's Failed response
    pub defaulted: bool,
    pub runtime: Duration,
}

/// A locally-initiated request, before it is serialized
#[derive(Debug, Clone)]
pub struct OutboundRequest<Req> {
    pub request_id: RequestId,
    pub charge_box_id: ChargeBoxId,
    pub request: Req,
    pub sent_at: DateTime<Utc>,
}

/// Typed hooks of one action
pub struct ActionEvents<A: Action> {
    pub request_received: Hook<InboundRequest<A::Request>>,
    pub response_ready: Hook<Responded<A::Request, A::Response>>,
    pub request_sending: Hook<OutboundRequest<A::Request>>,
    pub reply_received: Hook<Reply<A::Response>>,
}

impl<A: Action> ActionEvents<A> {
    fn new() -> Self {
        Self {
            request_received: Hook::new("request_received"),
            response_ready: Hook::new("response_ready"),
            request_sending: Hook::new("request_sending"),
            reply_received: Hook::new("reply_received"),
        }
    }
}

impl<A: Action> fmt::Debug for ActionEvents<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionEvents")
            .field("action", &A::NAME)
            .field("request_received", &self.request_received)
            .field("response_ready", &self.response_ready)
            .field("request_sending", &self.request_sending)
            .field("reply_received", &self.reply_received)
            .finish()
    }
}

/// Per-action hook sets, created on first use and keyed by action type
#[derive(Default)]
pub struct TypedEvents {
    map: RwLock<HashMap<TypeId, Arc<dyn Any + Send + Sync>>>,
}

impl TypedEvents {
    pub fn get<A: Action>(&self) -> Arc<ActionEvents<A>> {
        let key = TypeId::of::<A>();
        if let Some(existing) = self.map.read().get(&key) {
            if let Ok(events) = existing.clone().downcast::<ActionEvents<A>>() {
                return events;
            }
        }

        let mut map = self.map.write();
        let entry = map
            .entry(key)
            .or_insert_with(|| Arc::new(ActionEvents::<A>::new()) as Arc<dyn Any + Send + Sync>);
        match entry.clone().downcast::<ActionEvents<A>>() {
            Ok(events) => events,
            Err(_) => {
                let events = Arc::new(ActionEvents::<A>::new());
                *entry = events.clone() as Arc<dyn Any + Send + Sync>;
                events
            }
        }
    }
}

impl fmt::Debug for TypedEvents {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypedEvents")
            .field("actions", &self.map.read().len())
            .finish()
    }
}

/// All hooks of one endpoint
#[derive(Debug, Default)]
pub struct EventBus {
    pub wire: WireEvents,
    pub typed: TypedEvents,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::v16;
    use std::sync::Mutex;

    #[test]
    fn test_fire_in_registration_order() {
        let hook: Hook<u32> = Hook::new("test");
        let seen = Arc::new(Mutex::new(Vec::new()));

        for tag in ["first", "second", "third"] {
            let seen = seen.clone();
            hook.inspect(move |value| seen.lock().unwrap().push(format!("{}:{}", tag, value)));
        }

        assert_eq!(hook.fire(&7), 3);
        assert_eq!(
            *seen.lock().unwrap(),
            vec!["first:7", "second:7", "third:7"]
        );
    }

    #[test]
    fn test_failing_subscribers_do_not_stop_fan_out() {
        let hook: Hook<&'static str> = Hook::new("test");
        let reached = Arc::new(Mutex::new(0));

        hook.subscribe(|_| Err("observer is broken".into()));
        hook.inspect(|_| panic!("observer exploded"));
        {
            let reached = reached.clone();
            hook.inspect(move |_| *reached.lock().unwrap() += 1);
        }

        assert_eq!(hook.fire(&"frame"), 1);
        assert_eq!(*reached.lock().unwrap(), 1);
    }

    #[test]
    fn test_unsubscribe() {
        let hook: Hook<()> = Hook::new("test");
        let a = hook.inspect(|_| {});
        let b = hook.inspect(|_| {});
        assert_ne!(a, b);

        assert!(hook.unsubscribe(a));
        assert!(!hook.unsubscribe(a));
        assert_eq!(hook.len(), 1);
        assert_eq!(hook.fire(&()), 1);
    }

    #[test]
    fn test_subscribe_while_firing() {
        let hook: Arc<Hook<()>> = Arc::new(Hook::new("test"));
        {
            let inner = hook.clone();
            hook.inspect(move |_| {
                inner.inspect(|_| {});
            });
        }

        // The subscriber added during firing only runs next time.
        assert_eq!(hook.fire(&()), 1);
        assert_eq!(hook.len(), 2);
    }

    #[test]
    fn test_typed_events_are_shared_per_action() {
        let events = TypedEvents::default();
        let a = events.get::<v16::Reset>();
        let b = events.get::<v16::Reset>();
        assert!(Arc::ptr_eq(&a, &b));

        a.request_received.inspect(|_| {});
        assert_eq!(b.request_received.len(), 1);
        assert!(events.get::<v16::Heartbeat>().request_received.is_empty());
    }

    #[test]
    fn test_panic_message() {
        let panic = std::panic::catch_unwind(|| panic!("boom {}", 1)).unwrap_err();
        assert_eq!(panic_message(panic.as_ref()), "boom 1");
    }
}

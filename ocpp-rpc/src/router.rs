//! Dispatch router
//!
//! Turns a decoded frame into one of:
//! - an outbound CALLRESULT / CALLERROR answering a peer CALL
//! - a settled entry in the pending-request table (peer answered our CALL)
//!
//! Per action the router keeps one descriptor: the registered handlers plus
//! the action's typed hooks. All actions share one generic dispatch path.

use std::any::{type_name, Any};
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use chrono::Utc;
use futures_util::future::{join_all, BoxFuture};
use futures_util::FutureExt;
use parking_lot::RwLock;
use serde_json::Value;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::action::{Action, ParseContext};
use crate::envelope::{decode, Call, CallError, CallResult, Envelope, ErrorCode, Frame};
use crate::error::{json_kind, HandlerError, RegistryError};
use crate::events::{
    panic_message, ActionEvents, Direction, EventBus, InboundRequest, Responded, SubscriptionId,
    WireFrame,
};
use crate::ids::{ChargeBoxId, ProtocolVersion};
use crate::pending::PendingRequests;

type HandlerFuture<R> = BoxFuture<'static, Result<Option<R>, HandlerError>>;

type Handler<A> = Arc<
    dyn Fn(InboundRequest<<A as Action>::Request>) -> HandlerFuture<<A as Action>::Response>
        + Send
        + Sync,
>;

struct DispatchContext {
    charge_box_id: ChargeBoxId,
    protocol: ProtocolVersion,
    cancel: CancellationToken,
}

/// Type-erased view of one action's descriptor
trait Dispatch: Send + Sync {
    fn dispatch(&self, call: Call, ctx: DispatchContext) -> BoxFuture<'static, Option<Envelope>>;

    fn unsubscribe(&self, id: SubscriptionId) -> bool;

    fn handler_count(&self) -> usize;

    fn request_type(&self) -> &'static str;

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

struct Descriptor<A: Action> {
    handlers: RwLock<Vec<(SubscriptionId, Handler<A>)>>,
    events: Arc<ActionEvents<A>>,
}

impl<A: Action> Dispatch for Descriptor<A> {
    fn dispatch(&self, call: Call, ctx: DispatchContext) -> BoxFuture<'static, Option<Envelope>> {
        let handlers: Vec<Handler<A>> = self
            .handlers
            .read()
            .iter()
            .map(|(_, handler)| handler.clone())
            .collect();
        dispatch_call::<A>(call, ctx, handlers, self.events.clone()).boxed()
    }

    fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut handlers = self.handlers.write();
        let before = handlers.len();
        handlers.retain(|(existing, _)| *existing != id);
        handlers.len() != before
    }

    fn handler_count(&self) -> usize {
        self.handlers.read().len()
    }

    fn request_type(&self) -> &'static str {
        type_name::<A::Request>()
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

async fn dispatch_call<A: Action>(
    call: Call,
    ctx: DispatchContext,
    handlers: Vec<Handler<A>>,
    events: Arc<ActionEvents<A>>,
) -> Option<Envelope> {
    let Call {
        request_id,
        payload,
        ..
    } = call;

    let parse_ctx = ParseContext {
        request_id: &request_id,
        charge_box_id: &ctx.charge_box_id,
    };
    let request = match A::parse_request(payload, &parse_ctx) {
        Ok(request) => request,
        Err(reason) => {
            warn!(request_id = %request_id, action = A::NAME, error = %reason, "Rejecting malformed request");
            let code = ErrorCode::format_violation(ctx.protocol);
            return Some(Envelope::CallError(CallError::new(request_id, code, reason)));
        }
    };

    let inbound = InboundRequest {
        request_id,
        charge_box_id: ctx.charge_box_id,
        action: A::NAME,
        request,
        received_at: Utc::now(),
        cancel: ctx.cancel.clone(),
    };
    events.request_received.fire(&inbound);

    let started = Instant::now();
    let answer = tokio::select! {
        biased;
        _ = ctx.cancel.cancelled() => {
            info!(request_id = %inbound.request_id, action = A::NAME, "Handler work cancelled, no response sent");
            return None;
        }
        answer = run_handlers::<A>(&handlers, &inbound) => answer,
    };

    let InboundRequest {
        request_id,
        charge_box_id,
        request,
        ..
    } = inbound;

    let (response, defaulted) = match answer {
        Some(response) => (response, false),
        None => {
            debug!(request_id = %request_id, action = A::NAME, "No handler answered, sending Failed response");
            (A::failed_response(&request), true)
        }
    };

    let payload = match serde_json::to_value(&response) {
        Ok(Value::Object(map)) => map,
        Ok(other) => {
            error!(request_id = %request_id, action = A::NAME, "Response serialized to {}, expected object", json_kind(&other));
            let description = format!("{} response is not a JSON object", A::NAME);
            return Some(Envelope::CallError(CallError::new(request_id, ErrorCode::InternalError, description)));
        }
        Err(e) => {
            error!(request_id = %request_id, action = A::NAME, error = %e, "Failed to serialize response");
            return Some(Envelope::CallError(CallError::new(request_id, ErrorCode::InternalError, e.to_string())));
        }
    };

    events.response_ready.fire(&Responded {
        request_id: request_id.clone(),
        charge_box_id,
        request,
        response,
        defaulted,
        runtime: started.elapsed(),
    });

    Some(Envelope::CallResult(CallResult {
        request_id,
        payload,
    }))
}

/// Run every handler concurrently; the first `Some` in registration order wins.
async fn run_handlers<A: Action>(
    handlers: &[Handler<A>],
    inbound: &InboundRequest<A::Request>,
) -> Option<A::Response> {
    let runs = handlers.iter().map(|handler| {
        let handler = handler.clone();
        let request = inbound.clone();
        // Invoke inside the future so a panic in the call itself is caught too.
        AssertUnwindSafe(async move { handler(request).await }).catch_unwind()
    });

    let mut winner = None;
    for (index, outcome) in join_all(runs).await.into_iter().enumerate() {
        match outcome {
            Ok(Ok(Some(response))) => {
                if winner.is_none() {
                    winner = Some(response);
                }
            }
            Ok(Ok(None)) => {}
            Ok(Err(e)) => {
                warn!(request_id = %inbound.request_id, action = A::NAME, handler = index, error = %e, "Handler failed");
            }
            Err(panic) => {
                warn!(
                    request_id = %inbound.request_id,
                    action = A::NAME,
                    handler = index,
                    panic = %panic_message(panic.as_ref()),
                    "Handler panicked"
                );
            }
        }
    }
    winner
}

/// Routes decoded frames of one connection
pub struct Router {
    charge_box_id: ChargeBoxId,
    protocol: ProtocolVersion,
    actions: RwLock<HashMap<&'static str, Arc<dyn Dispatch>>>,
    pending: Arc<PendingRequests>,
    events: Arc<EventBus>,
}

impl Router {
    pub fn new(
        charge_box_id: ChargeBoxId,
        protocol: ProtocolVersion,
        pending: Arc<PendingRequests>,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            charge_box_id,
            protocol,
            actions: RwLock::new(HashMap::new()),
            pending,
            events,
        }
    }

    fn descriptor<A: Action>(&self) -> Result<Arc<Descriptor<A>>, RegistryError> {
        let mut actions = self.actions.write();
        let entry = actions.entry(A::NAME).or_insert_with(|| {
            Arc::new(Descriptor::<A> {
                handlers: RwLock::new(Vec::new()),
                events: self.events.typed.get::<A>(),
            }) as Arc<dyn Dispatch>
        });

        let existing = entry.clone();
        existing
            .clone()
            .into_any()
            .downcast::<Descriptor<A>>()
            .map_err(|_| RegistryError::Conflict {
                action: A::NAME,
                existing: existing.request_type(),
            })
    }

    /// Whether `A` could be registered without a conflict. Registers nothing.
    pub fn check<A: Action>(&self) -> Result<(), RegistryError> {
        match self.actions.read().get(A::NAME) {
            Some(existing) if existing.clone().into_any().downcast::<Descriptor<A>>().is_err() => {
                Err(RegistryError::Conflict {
                    action: A::NAME,
                    existing: existing.request_type(),
                })
            }
            _ => Ok(()),
        }
    }

    /// Register a business handler for inbound `A` calls.
    ///
    /// Returning `Ok(None)` means "no answer"; the next handler's answer or the
    /// action's Failed response is used instead.
    pub fn register<A, F, Fut>(&self, handler: F) -> Result<SubscriptionId, RegistryError>
    where
        A: Action,
        F: Fn(InboundRequest<A::Request>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<A::Response>, HandlerError>> + Send + 'static,
    {
        let descriptor = self.descriptor::<A>()?;
        let id = SubscriptionId::next();
        let handler: Handler<A> = Arc::new(move |request| handler(request).boxed());
        descriptor.handlers.write().push((id, handler));
        debug!(charge_box_id = %self.charge_box_id, action = A::NAME, subscription = %id, "Handler registered");
        Ok(id)
    }

    /// Accept inbound `A` calls without a handler; they get the Failed response.
    pub fn support<A: Action>(&self) -> Result<(), RegistryError> {
        self.descriptor::<A>().map(|_| ())
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.actions
            .read()
            .values()
            .any(|descriptor| descriptor.unsubscribe(id))
    }

    pub fn is_supported(&self, action: &str) -> bool {
        self.actions.read().contains_key(action)
    }

    pub fn handler_count(&self, action: &str) -> usize {
        self.actions
            .read()
            .get(action)
            .map_or(0, |descriptor| descriptor.handler_count())
    }

    pub fn supported_actions(&self) -> Vec<&'static str> {
        let mut actions: Vec<&'static str> = self.actions.read().keys().copied().collect();
        actions.sort_unstable();
        actions
    }

    /// Route one received text frame.
    ///
    /// Returns the envelope to send back, if any. Undecodable frames and
    /// orphaned responses are logged and dropped.
    pub async fn route(&self, text: &str, cancel: &CancellationToken) -> Option<Envelope> {
        debug!(charge_box_id = %self.charge_box_id, "Received: {}", text);
        self.events
            .wire
            .frame_received
            .fire(&WireFrame::new(self.charge_box_id.clone(), Direction::Inbound, text));

        match decode(text.as_bytes()) {
            Err(e) => {
                warn!(charge_box_id = %self.charge_box_id, error = %e, "Dropping undecodable frame");
                None
            }
            Ok(Frame::Empty) => {
                debug!(charge_box_id = %self.charge_box_id, "Empty frame, ignoring");
                None
            }
            Ok(Frame::Envelope(Envelope::Call(call))) => self.dispatch(call, cancel).await,
            Ok(Frame::Envelope(Envelope::CallResult(result))) => {
                let request_id = result.request_id;
                if !self.pending.resolve(&request_id, result.payload) {
                    warn!(charge_box_id = %self.charge_box_id, request_id = %request_id, "Dropping CALLRESULT for unknown request");
                }
                None
            }
            Ok(Frame::Envelope(Envelope::CallError(error))) => {
                let request_id = error.request_id;
                if !error.error_code.is_known() {
                    debug!(request_id = %request_id, code = %error.error_code, "Unrecognised error code, treating as GenericError");
                }
                if !self.pending.resolve_error(
                    &request_id,
                    error.error_code,
                    error.error_description,
                    error.error_details,
                ) {
                    warn!(charge_box_id = %self.charge_box_id, request_id = %request_id, "Dropping CALLERROR for unknown request");
                }
                None
            }
        }
    }

    async fn dispatch(&self, call: Call, cancel: &CancellationToken) -> Option<Envelope> {
        let descriptor = self.actions.read().get(call.action.as_str()).cloned();
        let Some(descriptor) = descriptor else {
            warn!(charge_box_id = %self.charge_box_id, request_id = %call.request_id, action = %call.action, "No handler for action");
            let description = format!("Action {} is not implemented", call.action);
            return Some(Envelope::CallError(CallError::new(
                call.request_id,
                ErrorCode::NotImplemented,
                description,
            )));
        };

        let ctx = DispatchContext {
            charge_box_id: self.charge_box_id.clone(),
            protocol: self.protocol,
            cancel: cancel.clone(),
        };
        descriptor.dispatch(call, ctx).await
    }
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("charge_box_id", &self.charge_box_id)
            .field("protocol", &self.protocol)
            .field("actions", &self.supported_actions())
            .finish()
    }
}

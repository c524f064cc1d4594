//! OCPP-J endpoint
//!
//! One [`Endpoint`] per connection. It owns the pending-request table, the
//! dispatch router, the event bus and the transport, and works the same way
//! on the charge point and on the CSMS side:
//!
//! ```text
//!  call::<A>(req) ──► request_sending ──► register ──► Transport::send_frame
//!                                                            │
//!  receive(text) ──► Router::route ──► resolve ─────────► await_result
//!                        │                                   │
//!                        └─► handlers ──► send_frame     reply_received ──► Reply<A::Response>
//! ```

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::action::Action;
use crate::config::EndpointConfig;
use crate::envelope::{Call, Envelope, Payload};
use crate::error::{json_kind, HandlerError, PendingError, RegistryError, ResultCode, RpcError, TransportError};
use crate::events::{ActionEvents, Direction, EventBus, InboundRequest, OutboundRequest, SubscriptionId, WireEvents, WireFrame};
use crate::facade::{V16, V201};
use crate::ids::{ChargeBoxId, ProtocolVersion, RequestId};
use crate::pending::PendingRequests;
use crate::router::Router;
use crate::transport::Transport;

/// Result of a locally-initiated request.
///
/// Always returned, never thrown: failure is carried in `outcome`.
#[derive(Debug, Clone)]
pub struct Reply<R> {
    pub request_id: RequestId,
    pub action: &'static str,
    pub outcome: Result<R, RpcError>,
    pub runtime: Duration,
}

impl<R> Reply<R> {
    pub fn is_ok(&self) -> bool {
        self.outcome.is_ok()
    }

    pub fn code(&self) -> ResultCode {
        match &self.outcome {
            Ok(_) => ResultCode::Ok,
            Err(e) => e.code(),
        }
    }

    /// Human-readable failure description
    pub fn description(&self) -> Option<String> {
        self.outcome.as_ref().err().map(|e| e.to_string())
    }

    pub fn response(&self) -> Option<&R> {
        self.outcome.as_ref().ok()
    }

    pub fn into_result(self) -> Result<R, RpcError> {
        self.outcome
    }
}

struct Inner {
    config: EndpointConfig,
    pending: Arc<PendingRequests>,
    router: Router,
    events: Arc<EventBus>,
    transport: Arc<dyn Transport>,
    shutdown: CancellationToken,
}

/// Bidirectional OCPP-J RPC endpoint
#[derive(Clone)]
pub struct Endpoint {
    inner: Arc<Inner>,
}

impl Endpoint {
    pub fn new(config: EndpointConfig, transport: impl Transport + 'static) -> Self {
        let pending = Arc::new(PendingRequests::new());
        let events = Arc::new(EventBus::default());
        let router = Router::new(
            config.charge_box_id.clone(),
            config.protocol,
            pending.clone(),
            events.clone(),
        );

        info!(
            "OCPP endpoint {} ready ({}, timeout {:?})",
            config.charge_box_id, config.protocol, config.request_timeout
        );

        Self {
            inner: Arc::new(Inner {
                config,
                pending,
                router,
                events,
                transport: Arc::new(transport),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn charge_box_id(&self) -> &ChargeBoxId {
        &self.inner.config.charge_box_id
    }

    pub fn protocol(&self) -> ProtocolVersion {
        self.inner.config.protocol
    }

    pub fn config(&self) -> &EndpointConfig {
        &self.inner.config
    }

    pub fn pending(&self) -> &PendingRequests {
        &self.inner.pending
    }

    pub fn router(&self) -> &Router {
        &self.inner.router
    }

    pub fn wire_events(&self) -> &WireEvents {
        &self.inner.events.wire
    }

    /// Typed hooks of action `A`
    pub fn events<A: Action>(&self) -> Arc<ActionEvents<A>> {
        self.inner.events.typed.get::<A>()
    }

    /// Register a business handler for inbound `A` calls
    pub fn on<A, F, Fut>(&self, handler: F) -> Result<SubscriptionId, RegistryError>
    where
        A: Action,
        F: Fn(InboundRequest<A::Request>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Option<A::Response>, HandlerError>> + Send + 'static,
    {
        self.inner.router.register::<A, F, Fut>(handler)
    }

    /// Accept inbound `A` calls, answering with the Failed response
    pub fn support<A: Action>(&self) -> Result<(), RegistryError> {
        self.inner.router.support::<A>()
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.router.unsubscribe(id)
    }

    /// OCPP 1.6 operations
    pub fn v16(&self) -> V16<'_> {
        V16::new(self)
    }

    /// OCPP 2.0.1 / 2.1 operations
    pub fn v201(&self) -> V201<'_> {
        V201::new(self)
    }

    /// Handle one received text frame, sending the answer if there is one
    pub async fn receive(&self, text: &str) {
        let Some(response) = self.inner.router.route(text, &self.inner.shutdown).await else {
            return;
        };
        if let Err(e) = self.send_envelope(&response) {
            warn!(
                charge_box_id = %self.charge_box_id(),
                request_id = %response.request_id(),
                error = %e,
                "Failed to send response"
            );
        }
    }

    /// Handle a received frame on its own task
    pub fn spawn_receive(&self, text: String) -> JoinHandle<()> {
        let endpoint = self.clone();
        tokio::spawn(async move { endpoint.receive(&text).await })
    }

    /// Send `A` with the configured request timeout
    pub async fn call<A: Action>(&self, request: A::Request) -> Reply<A::Response> {
        self.call_with_timeout::<A>(request, self.inner.config.request_timeout)
            .await
    }

    pub async fn call_with_timeout<A: Action>(
        &self,
        request: A::Request,
        timeout: Duration,
    ) -> Reply<A::Response> {
        let events = self.events::<A>();
        let request_id = RequestId::generate();
        let sent_at = Utc::now();
        let started = Instant::now();

        events.request_sending.fire(&OutboundRequest {
            request_id: request_id.clone(),
            charge_box_id: self.charge_box_id().clone(),
            request: request.clone(),
            sent_at,
        });

        let outcome = self
            .exchange::<A>(&request_id, &request, sent_at, timeout)
            .await;
        if let Err(e) = &outcome {
            warn!(request_id = %request_id, action = A::NAME, error = %e, "Request failed");
        }

        let reply = Reply {
            request_id,
            action: A::NAME,
            outcome,
            runtime: started.elapsed(),
        };
        events.reply_received.fire(&reply);
        reply
    }

    async fn exchange<A: Action>(
        &self,
        request_id: &RequestId,
        request: &A::Request,
        sent_at: DateTime<Utc>,
        timeout: Duration,
    ) -> Result<A::Response, RpcError> {
        if self.is_closed() {
            return Err(RpcError::Disconnected);
        }

        let payload: Payload = match serde_json::to_value(request) {
            Ok(Value::Object(map)) => map,
            Ok(other) => {
                return Err(RpcError::InvalidRequest(format!(
                    "{} request serialized to {}, expected object",
                    A::NAME,
                    json_kind(&other)
                )))
            }
            Err(e) => return Err(RpcError::FormationViolation(e.to_string())),
        };

        self.inner
            .pending
            .register(request_id.clone(), A::NAME, sent_at, timeout)
            .map_err(|e| match e {
                PendingError::DuplicateRequestId(id) => RpcError::DuplicateRequestId(id),
                PendingError::Closed => RpcError::Disconnected,
            })?;

        let call = Envelope::Call(Call {
            request_id: request_id.clone(),
            action: A::NAME.to_string(),
            payload,
        });
        if let Err(e) = self.send_envelope(&call) {
            warn!(request_id = %request_id, action = A::NAME, error = %e, "Transport unavailable, request will time out");
        }

        let payload = self
            .inner
            .pending
            .await_result(request_id)
            .await
            .map_err(|e| RpcError::from_await(e, timeout))?;

        A::parse_response(payload).map_err(RpcError::FormationViolation)
    }

    fn send_envelope(&self, envelope: &Envelope) -> Result<(), TransportError> {
        let frame = WireFrame::new(self.charge_box_id().clone(), Direction::Outbound, envelope.to_text());
        debug!(charge_box_id = %frame.charge_box_id, "Sending: {}", frame.text);

        self.inner.events.wire.frame_sending.fire(&frame);
        self.inner.transport.send_frame(frame.text.clone())?;
        self.inner.events.wire.frame_sent.fire(&frame);
        Ok(())
    }

    /// Tear the endpoint down.
    ///
    /// Every in-flight request fails with `Disconnected`, handler work on
    /// inbound calls is cancelled and later calls fail immediately.
    pub fn close(&self) {
        if self.inner.shutdown.is_cancelled() {
            return;
        }
        self.inner.shutdown.cancel();
        let failed = self.inner.pending.close();
        if failed > 0 {
            warn!("Endpoint {} closed with {} requests in flight", self.charge_box_id(), failed);
        } else {
            info!("Endpoint {} closed", self.charge_box_id());
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Token cancelled when the endpoint closes
    pub fn shutdown_token(&self) -> CancellationToken {
        self.inner.shutdown.clone()
    }
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("charge_box_id", self.charge_box_id())
            .field("protocol", &self.protocol())
            .field("pending", &self.inner.pending)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::v16;
    use crate::transport::ChannelTransport;

    fn endpoint() -> (Endpoint, tokio::sync::mpsc::UnboundedReceiver<String>) {
        let (transport, rx) = ChannelTransport::new();
        let config = EndpointConfig::new(ChargeBoxId::new("CS001").unwrap())
            .with_request_timeout(Duration::from_secs(5));
        (Endpoint::new(config, transport), rx)
    }

    #[tokio::test]
    async fn test_call_sends_frame_and_parses_reply() {
        let (endpoint, mut rx) = endpoint();

        let caller = endpoint.clone();
        let call = tokio::spawn(async move { caller.v16().heartbeat(v16::HeartbeatRequest {}).await });

        let sent = rx.recv().await.unwrap();
        let frame: Value = serde_json::from_str(&sent).unwrap();
        assert_eq!(frame[0], 2);
        assert_eq!(frame[2], "Heartbeat");
        assert_eq!(frame[3], serde_json::json!({}));

        let id = frame[1].as_str().unwrap();
        endpoint
            .receive(&format!(r#"[3,"{}",{{"currentTime":"2026-01-20T12:00:00Z"}}]"#, id))
            .await;

        let reply = call.await.unwrap();
        assert_eq!(reply.code(), ResultCode::Ok);
        assert_eq!(reply.request_id.as_str(), id);
        assert_eq!(
            reply.response().unwrap().current_time.to_rfc3339(),
            "2026-01-20T12:00:00+00:00"
        );
        assert!(endpoint.pending().is_empty());
    }

    #[tokio::test]
    async fn test_unparseable_reply_is_format_error() {
        let (endpoint, mut rx) = endpoint();

        let caller = endpoint.clone();
        let call = tokio::spawn(async move { caller.v16().heartbeat(v16::HeartbeatRequest {}).await });

        let sent: Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        let id = sent[1].as_str().unwrap();
        endpoint
            .receive(&format!(r#"[3,"{}",{{"currentTime":"yesterday"}}]"#, id))
            .await;

        let reply = call.await.unwrap();
        assert_eq!(reply.code(), ResultCode::FormatError);
        assert!(matches!(reply.outcome, Err(RpcError::FormationViolation(_))));
    }

    #[tokio::test]
    async fn test_call_after_close_fails_fast() {
        let (endpoint, mut rx) = endpoint();
        endpoint.close();
        assert!(endpoint.is_closed());

        let reply = endpoint.v16().heartbeat(v16::HeartbeatRequest {}).await;
        assert_eq!(reply.code(), ResultCode::Disconnected);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_down_times_out() {
        let (transport, rx) = ChannelTransport::new();
        drop(rx);
        let config = EndpointConfig::new(ChargeBoxId::new("CS001").unwrap())
            .with_request_timeout(Duration::from_millis(200));
        let endpoint = Endpoint::new(config, transport);

        let reply = endpoint.v16().heartbeat(v16::HeartbeatRequest {}).await;
        assert_eq!(reply.code(), ResultCode::Timeout);
        assert!(endpoint.pending().is_empty());
    }

    #[tokio::test]
    async fn test_wire_hooks_see_outbound_frames() {
        let (endpoint, mut rx) = endpoint();
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        {
            let seen = seen.clone();
            endpoint
                .wire_events()
                .frame_sent
                .inspect(move |frame| seen.lock().push((frame.direction, frame.text.clone())));
        }
        endpoint.support::<v16::ClearCache>().unwrap();

        endpoint.receive(r#"[2,"c1","ClearCache",{}]"#).await;

        let sent = rx.recv().await.unwrap();
        assert_eq!(sent, r#"[3,"c1",{"status":"Rejected"}]"#);
        assert_eq!(*seen.lock(), vec![(Direction::Outbound, sent)]);
    }
}

//! # OCPP RPC
//!
//! Bidirectional OCPP-J RPC engine for OCPP 1.6, 2.0.1 and 2.1.
//!
//! The same [`Endpoint`] serves a charge point or a CSMS: it frames CALL /
//! CALLRESULT / CALLERROR envelopes, correlates responses with requests by
//! id, enforces per-request deadlines, routes peer calls to typed handlers
//! and lets any number of observers watch every stage.
//!
//! ## Architecture
//!
//! ```text
//!            text frames
//!  Transport ───────────► Router ──► decode ──┬─► CALL ──► handlers ──► CALLRESULT / CALLERROR
//!      ▲                    │                 │
//!      │                    ▼                 └─► CALLRESULT / CALLERROR ──► PendingRequests
//!      │                EventBus                                               │
//!      │                                                                       ▼
//!      └────────────── Endpoint::call::<A>() ◄──────── await_result ◄──────── Reply<R>
//! ```
//!
//! ## Usage
//!
//! ```no_run
//! use ocpp_rpc::messages::v16;
//! use ocpp_rpc::{ws, ChargeBoxId, ChannelTransport, Endpoint, EndpointConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let id = ChargeBoxId::new("CS001")?;
//!     let (stream, _) = ws::connect("ws://localhost:8180/ocpp", &id, Default::default()).await?;
//!
//!     let (transport, outbound) = ChannelTransport::new();
//!     let endpoint = Endpoint::new(EndpointConfig::new(id), transport);
//!     endpoint.on::<v16::Reset, _, _>(|_| async {
//!         Ok(Some(v16::ResetResponse { status: v16::GenericStatus::Accepted }))
//!     })?;
//!     tokio::spawn(ws::run(endpoint.clone(), stream, outbound));
//!
//!     let reply = endpoint
//!         .v16()
//!         .boot_notification(v16::BootNotificationRequest::new("Elektrokombinacija", "EK3"))
//!         .await;
//!     println!("{:?}", reply.code());
//!     Ok(())
//! }
//! ```

pub mod action;
pub mod config;
pub mod endpoint;
pub mod envelope;
pub mod error;
pub mod events;
pub mod facade;
pub mod ids;
pub mod messages;
pub mod pending;
pub mod router;
pub mod transport;
pub mod ws;

pub use action::{Action, ParseContext};
pub use config::{EndpointConfig, DEFAULT_REQUEST_TIMEOUT};
pub use endpoint::{Endpoint, Reply};
pub use envelope::{decode, Call, CallError, CallResult, Envelope, ErrorCode, Frame, MessageType, Payload};
pub use error::{
    AwaitError, DecodeError, HandlerError, IdentityError, PendingError, RegistryError, ResultCode,
    RpcError, TransportError, WsError,
};
pub use events::{
    ActionEvents, Direction, EventBus, Hook, InboundRequest, OutboundRequest, Responded,
    SubscriptionId, WireEvents, WireFrame,
};
pub use facade::{V16, V201};
pub use ids::{ChargeBoxId, ProtocolVersion, RequestId};
pub use pending::{PendingInfo, PendingRequests};
pub use router::Router;
pub use transport::{ChannelTransport, Transport};

//! Per-action descriptor
//!
//! An [`Action`] ties an OCPP action name to its request and response types,
//! the parser used on inbound payloads, and the Failed response sent when no
//! business handler answers. The dispatch router and the request facade are
//! generic over it, so adding an operation means adding one impl.

use std::fmt::Debug;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::envelope::Payload;
use crate::ids::{ChargeBoxId, RequestId};

/// Identity of the frame being parsed
#[derive(Debug, Clone, Copy)]
pub struct ParseContext<'a> {
    pub request_id: &'a RequestId,
    pub charge_box_id: &'a ChargeBoxId,
}

pub trait Action: Send + Sync + 'static {
    /// Action string on the wire, e.g. `"BootNotification"`
    const NAME: &'static str;

    type Request: Serialize + DeserializeOwned + Clone + Debug + Send + Sync + 'static;
    type Response: Serialize + DeserializeOwned + Clone + Debug + Send + Sync + 'static;

    /// Conservative negative answer used when no handler produced one
    fn failed_response(request: &Self::Request) -> Self::Response;

    /// Parse an inbound CALL payload. The error text is sent to the peer.
    fn parse_request(payload: Payload, _ctx: &ParseContext<'_>) -> Result<Self::Request, String> {
        serde_json::from_value(Value::Object(payload)).map_err(|e| e.to_string())
    }

    /// Parse a CALLRESULT payload received for one of our requests
    fn parse_response(payload: Payload) -> Result<Self::Response, String> {
        serde_json::from_value(Value::Object(payload)).map_err(|e| e.to_string())
    }
}

/// Declare a marker type implementing [`Action`].
///
/// ```ignore
/// ocpp_action!(Reset: ResetRequest => ResetResponse, |_| ResetResponse {
///     status: ResetStatus::Rejected,
/// });
/// ```
macro_rules! ocpp_action {
    ($(#[$meta:meta])* $name:ident: $req:ty => $resp:ty, |$request:pat_param| $failed:expr) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, Default)]
        pub struct $name;

        impl $crate::action::Action for $name {
            const NAME: &'static str = stringify!($name);
            type Request = $req;
            type Response = $resp;

            fn failed_response($request: &Self::Request) -> Self::Response {
                $failed
            }
        }
    };
}

pub(crate) use ocpp_action;

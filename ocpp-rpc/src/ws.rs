//! WebSocket transport adapter
//!
//! Binds a tokio-tungstenite stream to an [`Endpoint`]:
//! - connects with the OCPP subprotocol of the endpoint's dialect
//! - writes every frame queued on the endpoint's [`ChannelTransport`]
//! - dispatches every received text frame on its own task
//!
//! When either direction of the stream ends the endpoint is closed, failing
//! pending requests.
//!
//! [`ChannelTransport`]: crate::transport::ChannelTransport

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::{
    connect_async_with_config,
    tungstenite::{
        client::IntoClientRequest,
        http::{header, HeaderValue},
        protocol::WebSocketConfig,
        Message,
    },
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, error, info, warn};

use crate::endpoint::Endpoint;
use crate::error::WsError;
use crate::ids::{ChargeBoxId, ProtocolVersion};

/// Client stream returned by [`connect`]
pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Largest accepted message; reports and tariffs can be big
const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

const MAX_FRAME_SIZE: usize = 256 * 1024;

/// Build the full OCPP WebSocket URL
pub fn build_ocpp_url(base_url: &str, charge_box_id: &ChargeBoxId) -> String {
    format!("{}/{}", base_url.trim_end_matches('/'), charge_box_id)
}

/// Connect to a CSMS as `charge_box_id`.
///
/// Returns the stream and the subprotocol the server accepted, if any.
pub async fn connect(
    base_url: &str,
    charge_box_id: &ChargeBoxId,
    protocol: ProtocolVersion,
) -> Result<(WsStream, Option<String>), WsError> {
    let url = build_ocpp_url(base_url, charge_box_id);

    let mut request = url.as_str().into_client_request()?;
    request.headers_mut().insert(
        header::SEC_WEBSOCKET_PROTOCOL,
        HeaderValue::from_static(protocol.subprotocol()),
    );

    let ws_config = WebSocketConfig {
        max_message_size: Some(MAX_MESSAGE_SIZE),
        max_frame_size: Some(MAX_FRAME_SIZE),
        ..Default::default()
    };

    let (stream, response) = connect_async_with_config(request, Some(ws_config), false).await?;

    let accepted = response
        .headers()
        .get(header::SEC_WEBSOCKET_PROTOCOL)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    if accepted.as_deref() != Some(protocol.subprotocol()) {
        warn!(
            "CSMS did not accept {} subprotocol, got: {:?}",
            protocol, accepted
        );
    }

    info!("WebSocket connected to {}", url);
    Ok((stream, accepted))
}

/// Pump frames between `stream` and `endpoint` until either side closes.
///
/// `outbound` is the receiver paired with the endpoint's transport.
pub async fn run<S>(
    endpoint: Endpoint,
    stream: WebSocketStream<S>,
    mut outbound: mpsc::UnboundedReceiver<String>,
) -> Result<(), WsError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut ws_tx, mut ws_rx) = stream.split();
    let shutdown = endpoint.shutdown_token();

    let mut writer = tokio::spawn(async move {
        while let Some(text) = outbound.recv().await {
            ws_tx.send(Message::Text(text)).await?;
        }
        Ok::<(), WsError>(())
    });

    let result = loop {
        tokio::select! {
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        endpoint.spawn_receive(text.to_string());
                    }
                    Some(Ok(Message::Binary(data))) => {
                        warn!("Ignoring binary frame of {} bytes", data.len());
                    }
                    Some(Ok(Message::Ping(_))) => {
                        // Pong is sent by tungstenite
                        debug!("Received ping");
                    }
                    Some(Ok(Message::Close(frame))) => {
                        info!("WebSocket closed by peer: {:?}", frame);
                        break Ok(());
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        error!("WebSocket error: {}", e);
                        break Err(WsError::from(e));
                    }
                    None => {
                        info!("WebSocket stream ended");
                        break Ok(());
                    }
                }
            }
            joined = &mut writer => {
                match joined {
                    Ok(Ok(())) => {
                        info!("Outbound queue closed");
                        break Ok(());
                    }
                    Ok(Err(e)) => {
                        error!("Failed to send WebSocket message: {}", e);
                        break Err(e);
                    }
                    Err(e) => {
                        error!("WebSocket writer task failed: {}", e);
                        break Err(WsError::from(e));
                    }
                }
            }
            _ = shutdown.cancelled() => {
                info!("Endpoint {} closed locally", endpoint.charge_box_id());
                break Ok(());
            }
        }
    };

    endpoint.close();
    writer.abort();
    result
}

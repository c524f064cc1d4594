//! End-to-end exchanges between endpoints wired through channel transports

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use ocpp_rpc::messages::{v16, v201};
use ocpp_rpc::{
    ChannelTransport, ChargeBoxId, Endpoint, EndpointConfig, ErrorCode, ProtocolVersion,
    ResultCode, RpcError,
};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::mpsc::UnboundedReceiver;

fn config(protocol: ProtocolVersion) -> EndpointConfig {
    EndpointConfig::new(ChargeBoxId::new("CS001").unwrap()).with_protocol(protocol)
}

/// Endpoint whose outbound frames the test reads directly
fn endpoint(protocol: ProtocolVersion) -> (Endpoint, UnboundedReceiver<String>) {
    let (transport, rx) = ChannelTransport::new();
    (Endpoint::new(config(protocol), transport), rx)
}

fn pump(mut rx: UnboundedReceiver<String>, to: Endpoint) {
    tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            to.spawn_receive(text);
        }
    });
}

/// Charge point and CSMS endpoints wired back to back
fn pair(protocol: ProtocolVersion) -> (Endpoint, Endpoint) {
    let (cp, cp_rx) = endpoint(protocol);
    let (csms, csms_rx) = endpoint(protocol);
    pump(cp_rx, csms.clone());
    pump(csms_rx, cp.clone());
    (cp, csms)
}

fn frame(text: &str) -> Value {
    serde_json::from_str(text).unwrap()
}

fn boot_accepted(interval: i32) -> v16::BootNotificationResponse {
    v16::BootNotificationResponse {
        status: v16::RegistrationStatus::Accepted,
        current_time: Utc::now(),
        interval,
    }
}

#[tokio::test]
async fn test_reset_round_trip() {
    let (cp, mut rx) = endpoint(ProtocolVersion::Ocpp16);
    cp.on::<v16::Reset, _, _>(|request| async move {
        assert_eq!(request.request.reset_type, v16::ResetType::Hard);
        Ok(Some(v16::ResetResponse {
            status: v16::GenericStatus::Accepted,
        }))
    })
    .unwrap();

    cp.receive(r#"[2,"r1","Reset",{"type":"Hard"}]"#).await;

    assert_eq!(rx.recv().await.unwrap(), r#"[3,"r1",{"status":"Accepted"}]"#);
}

#[tokio::test(start_paused = true)]
async fn test_facade_timeout() {
    let (transport, _rx) = ChannelTransport::new();
    let endpoint = Endpoint::new(
        config(ProtocolVersion::Ocpp16).with_request_timeout(Duration::from_millis(100)),
        transport,
    );

    let reply = endpoint.v16().heartbeat(v16::HeartbeatRequest {}).await;

    assert_eq!(reply.code(), ResultCode::Timeout);
    assert!(reply.description().unwrap().contains("100ms"));
    assert!(reply.runtime >= Duration::from_millis(100));
    assert!(reply.runtime < Duration::from_millis(150));
    assert!(endpoint.pending().is_empty());
}

#[tokio::test]
async fn test_unknown_action_gets_not_implemented() {
    let (cp, mut rx) = endpoint(ProtocolVersion::Ocpp16);

    cp.receive(r#"[2,"u1","TeleportVehicle",{}]"#).await;

    let answer = frame(&rx.recv().await.unwrap());
    assert_eq!(answer[0], 4);
    assert_eq!(answer[1], "u1");
    assert_eq!(answer[2], "NotImplemented");
    assert_eq!(answer[4], json!({}));
}

#[tokio::test]
async fn test_malformed_payload_gets_format_violation() {
    for (protocol, code) in [
        (ProtocolVersion::Ocpp16, "FormationViolation"),
        (ProtocolVersion::Ocpp201, "FormatViolation"),
        (ProtocolVersion::Ocpp21, "FormatViolation"),
    ] {
        let (cp, mut rx) = endpoint(protocol);
        if protocol.is_v2() {
            cp.v201().support_all().unwrap();
        } else {
            cp.v16().support_all().unwrap();
        }

        cp.receive(r#"[2,"m1","Reset",{"type":"Medium"}]"#).await;

        let answer = frame(&rx.recv().await.unwrap());
        assert_eq!(answer[0], 4);
        assert_eq!(answer[1], "m1");
        assert_eq!(answer[2], code);
        assert!(answer[3].as_str().unwrap().contains("Medium"));
    }
}

#[tokio::test]
async fn test_no_subscriber_gets_failed_response() {
    let (cp, mut rx) = endpoint(ProtocolVersion::Ocpp16);
    cp.support::<v16::Reset>().unwrap();
    cp.support::<v16::GetConfiguration>().unwrap();

    cp.receive(r#"[2,"r2","Reset",{"type":"Soft"}]"#).await;
    assert_eq!(rx.recv().await.unwrap(), r#"[3,"r2",{"status":"Rejected"}]"#);

    cp.receive(r#"[2,"g1","GetConfiguration",{"key":["HeartbeatInterval"]}]"#)
        .await;
    assert_eq!(
        frame(&rx.recv().await.unwrap()),
        json!([3, "g1", {"unknownKey": ["HeartbeatInterval"]}])
    );
}

#[tokio::test]
async fn test_empty_frame_is_noop() {
    let (cp, mut rx) = endpoint(ProtocolVersion::Ocpp16);
    let received = Arc::new(Mutex::new(0));
    {
        let received = received.clone();
        cp.wire_events()
            .frame_received
            .inspect(move |_| *received.lock() += 1);
    }

    cp.receive("[]").await;

    assert_eq!(*received.lock(), 1);
    assert!(rx.try_recv().is_err());
    assert!(cp.pending().is_empty());
}

#[tokio::test]
async fn test_orphan_response_dropped_connection_usable() {
    let (cp, csms) = pair(ProtocolVersion::Ocpp16);
    csms.on::<v16::BootNotification, _, _>(|_| async { Ok(Some(boot_accepted(300))) })
        .unwrap();

    cp.receive(r#"[3,"nobody-asked",{"currentTime":"2026-01-20T12:00:00Z"}]"#)
        .await;
    cp.receive(r#"[4,"nobody-asked","GenericError","late",{}]"#)
        .await;
    assert!(cp.pending().is_empty());

    let reply = cp
        .v16()
        .boot_notification(v16::BootNotificationRequest::new("Elektrokombinacija", "EK3"))
        .await;
    assert_eq!(reply.code(), ResultCode::Ok);
}

#[tokio::test]
async fn test_boot_notification_between_endpoints() {
    let (cp, csms) = pair(ProtocolVersion::Ocpp16);
    csms.on::<v16::BootNotification, _, _>(|request| async move {
        assert_eq!(request.request.charge_point_vendor, "Elektrokombinacija");
        assert_eq!(request.charge_box_id.as_str(), "CS001");
        Ok(Some(boot_accepted(300)))
    })
    .unwrap();

    let reply = cp
        .v16()
        .boot_notification(v16::BootNotificationRequest::new("Elektrokombinacija", "EK3"))
        .await;

    let response = reply.into_result().unwrap();
    assert_eq!(response.status, v16::RegistrationStatus::Accepted);
    assert_eq!(response.interval, 300);
    assert!(cp.pending().is_empty());
}

#[tokio::test]
async fn test_v201_boot_notification_between_endpoints() {
    let (cs, csms) = pair(ProtocolVersion::Ocpp201);
    csms.on::<v201::BootNotification, _, _>(|request| async move {
        assert_eq!(request.request.reason, v201::BootReason::PowerUp);
        Ok(Some(v201::BootNotificationResponse {
            current_time: Utc::now(),
            interval: 120,
            status: v201::RegistrationStatus::Pending,
            status_info: None,
        }))
    })
    .unwrap();

    let reply = cs
        .v201()
        .boot_notification(v201::BootNotificationRequest {
            charging_station: v201::ChargingStation {
                model: "EK3".into(),
                vendor_name: "Elektrokombinacija".into(),
                serial_number: None,
                firmware_version: None,
            },
            reason: v201::BootReason::PowerUp,
        })
        .await;

    let response = reply.response().unwrap();
    assert_eq!(response.status, v201::RegistrationStatus::Pending);
    assert_eq!(response.interval, 120);
}

#[tokio::test]
async fn test_call_error_surfaces_without_waiting_for_timeout() {
    let (cp, _csms) = pair(ProtocolVersion::Ocpp16);

    let reply = cp
        .v16()
        .authorize(v16::AuthorizeRequest {
            id_tag: "TAG-1".into(),
        })
        .await;

    assert_eq!(reply.code(), ResultCode::Remote(ErrorCode::NotImplemented));
    match reply.outcome {
        Err(RpcError::CallError { description, .. }) => {
            assert!(description.contains("Authorize"));
        }
        other => panic!("Expected CallError, got {:?}", other),
    }
    assert!(reply.runtime < Duration::from_secs(1));
}

#[tokio::test]
async fn test_unknown_remote_error_code_reads_as_generic_error() {
    let (cp, mut rx) = endpoint(ProtocolVersion::Ocpp16);

    let call = {
        let cp = cp.clone();
        tokio::spawn(async move { cp.v16().heartbeat(v16::HeartbeatRequest {}).await })
    };
    let sent = frame(&rx.recv().await.unwrap());
    let id = sent[1].as_str().unwrap().to_string();

    cp.receive(&format!(r#"[4,"{}","VendorFault","x",{{}}]"#, id)).await;

    let reply = call.await.unwrap();
    assert_eq!(reply.code(), ResultCode::Remote(ErrorCode::GenericError));
    match reply.outcome {
        Err(RpcError::CallError { code, .. }) => {
            assert_eq!(code, ErrorCode::Other("VendorFault".into()));
        }
        other => panic!("Expected CallError, got {:?}", other),
    }
}

#[tokio::test]
async fn test_unbounded_request_timeout_does_not_panic() {
    let (transport, mut rx) = ChannelTransport::new();
    let cp = Endpoint::new(
        config(ProtocolVersion::Ocpp16).with_request_timeout(Duration::from_secs(u64::MAX)),
        transport,
    );

    let call = {
        let cp = cp.clone();
        tokio::spawn(async move { cp.v16().heartbeat(v16::HeartbeatRequest {}).await })
    };
    let sent = frame(&rx.recv().await.unwrap());
    let id = sent[1].as_str().unwrap().to_string();

    cp.receive(&format!(
        r#"[3,"{}",{{"currentTime":"2026-01-20T12:00:00Z"}}]"#,
        id
    ))
    .await;

    let reply = call.await.unwrap();
    assert!(reply.code().is_ok());
}

#[tokio::test(start_paused = true)]
async fn test_first_answer_in_registration_order_wins() {
    let (cp, mut rx) = endpoint(ProtocolVersion::Ocpp16);

    cp.on::<v16::ChangeAvailability, _, _>(|_| async { Ok(None) })
        .unwrap();
    cp.on::<v16::ChangeAvailability, _, _>(|_| async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        Ok(Some(v16::ChangeAvailabilityResponse {
            status: v16::AvailabilityStatus::Scheduled,
        }))
    })
    .unwrap();
    cp.on::<v16::ChangeAvailability, _, _>(|_| async {
        Ok(Some(v16::ChangeAvailabilityResponse {
            status: v16::AvailabilityStatus::Accepted,
        }))
    })
    .unwrap();

    cp.receive(r#"[2,"a1","ChangeAvailability",{"connectorId":1,"type":"Inoperative"}]"#)
        .await;

    assert_eq!(rx.recv().await.unwrap(), r#"[3,"a1",{"status":"Scheduled"}]"#);
}

#[tokio::test]
async fn test_failing_handlers_fall_back_to_failed_response() {
    let (cp, mut rx) = endpoint(ProtocolVersion::Ocpp16);

    cp.on::<v16::UnlockConnector, _, _>(|_| async { Err("lock controller offline".into()) })
        .unwrap();
    cp.on::<v16::UnlockConnector, _, _>(|_| async {
        if true {
            panic!("handler exploded");
        }
        Ok(None)
    })
    .unwrap();

    cp.receive(r#"[2,"x1","UnlockConnector",{"connectorId":2}]"#)
        .await;

    assert_eq!(
        rx.recv().await.unwrap(),
        r#"[3,"x1",{"status":"NotSupported"}]"#
    );
}

#[tokio::test]
async fn test_event_stages_fire_in_order() {
    let (cp, csms) = pair(ProtocolVersion::Ocpp16);
    csms.on::<v16::BootNotification, _, _>(|_| async { Ok(Some(boot_accepted(60))) })
        .unwrap();

    let cp_log = Arc::new(Mutex::new(Vec::new()));
    let csms_log = Arc::new(Mutex::new(Vec::new()));

    for (endpoint, log) in [(&cp, &cp_log), (&csms, &csms_log)] {
        let wire = endpoint.wire_events();
        for (hook, name) in [
            (&wire.frame_received, "frame_received"),
            (&wire.frame_sending, "frame_sending"),
            (&wire.frame_sent, "frame_sent"),
        ] {
            let log = log.clone();
            hook.inspect(move |_| log.lock().push(name));
        }

        let events = endpoint.events::<v16::BootNotification>();
        {
            let log = log.clone();
            events.request_sending.inspect(move |_| log.lock().push("request_sending"));
        }
        {
            let log = log.clone();
            events.reply_received.inspect(move |_| log.lock().push("reply_received"));
        }
        {
            let log = log.clone();
            events.request_received.inspect(move |_| log.lock().push("request_received"));
        }
        {
            let log = log.clone();
            events.response_ready.inspect(move |responded| {
                assert!(!responded.defaulted);
                log.lock().push("response_ready");
            });
        }
    }

    let reply = cp
        .v16()
        .boot_notification(v16::BootNotificationRequest::new("Elektrokombinacija", "EK3"))
        .await;
    assert!(reply.is_ok());

    assert_eq!(
        *cp_log.lock(),
        vec![
            "request_sending",
            "frame_sending",
            "frame_sent",
            "frame_received",
            "reply_received",
        ]
    );
    assert_eq!(
        *csms_log.lock(),
        vec![
            "frame_received",
            "request_received",
            "response_ready",
            "frame_sending",
            "frame_sent",
        ]
    );
}

#[tokio::test]
async fn test_responses_resolve_out_of_order() {
    let (cp, mut rx) = endpoint(ProtocolVersion::Ocpp16);

    let first = {
        let cp = cp.clone();
        tokio::spawn(async move {
            cp.v16()
                .data_transfer(v16::DataTransferRequest {
                    vendor_id: "ek".into(),
                    message_id: Some("first".into()),
                    data: None,
                })
                .await
        })
    };
    let first_id = frame(&rx.recv().await.unwrap())[1].as_str().unwrap().to_string();

    let second = {
        let cp = cp.clone();
        tokio::spawn(async move {
            cp.v16()
                .data_transfer(v16::DataTransferRequest {
                    vendor_id: "ek".into(),
                    message_id: Some("second".into()),
                    data: None,
                })
                .await
        })
    };
    let second_id = frame(&rx.recv().await.unwrap())[1].as_str().unwrap().to_string();

    cp.receive(&format!(r#"[3,"{}",{{"status":"Accepted","data":"2"}}]"#, second_id))
        .await;
    cp.receive(&format!(r#"[3,"{}",{{"status":"Rejected","data":"1"}}]"#, first_id))
        .await;
    // Duplicate answer for an already settled id is an orphan.
    cp.receive(&format!(r#"[3,"{}",{{"status":"Accepted"}}]"#, first_id))
        .await;

    let second = second.await.unwrap().into_result().unwrap();
    let first = first.await.unwrap().into_result().unwrap();
    assert_eq!(second.data.as_deref(), Some("2"));
    assert_eq!(first.status, v16::DataTransferStatus::Rejected);
    assert_eq!(first.data.as_deref(), Some("1"));
}

#[tokio::test]
async fn test_close_fails_in_flight_calls() {
    let (cp, _rx) = endpoint(ProtocolVersion::Ocpp16);

    let call = {
        let cp = cp.clone();
        tokio::spawn(async move { cp.v16().heartbeat(v16::HeartbeatRequest {}).await })
    };
    while cp.pending().is_empty() {
        tokio::task::yield_now().await;
    }

    cp.close();

    let reply = call.await.unwrap();
    assert_eq!(reply.code(), ResultCode::Disconnected);
    assert!(cp.pending().is_empty());
    assert!(cp.pending().is_closed());
}

#[tokio::test]
async fn test_close_cancels_handler_work() {
    let (cp, mut rx) = endpoint(ProtocolVersion::Ocpp16);
    let (started_tx, started_rx) = tokio::sync::oneshot::channel::<()>();
    let started_tx = Arc::new(Mutex::new(Some(started_tx)));
    let finished = Arc::new(AtomicBool::new(false));

    {
        let finished = finished.clone();
        cp.on::<v16::RemoteStartTransaction, _, _>(move |request| {
            let started_tx = started_tx.clone();
            let finished = finished.clone();
            async move {
                if let Some(tx) = started_tx.lock().take() {
                    let _ = tx.send(());
                }
                request.cancel.cancelled().await;
                tokio::time::sleep(Duration::from_secs(3600)).await;
                finished.store(true, Ordering::SeqCst);
                Ok(None)
            }
        })
        .unwrap();
    }

    let receive = cp.spawn_receive(r#"[2,"s1","RemoteStartTransaction",{"idTag":"TAG-1"}]"#.to_string());
    started_rx.await.unwrap();

    cp.close();
    receive.await.unwrap();

    assert!(!finished.load(Ordering::SeqCst));
    assert!(rx.try_recv().is_err());
}

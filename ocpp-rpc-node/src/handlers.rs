//! Charge point side operation handlers
//!
//! Handlers answer from a small in-memory station model. Every other
//! operation of the dialect is still accepted and answered with its Failed
//! response.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ocpp_rpc::messages::{v16, v201};
use ocpp_rpc::{Endpoint, RegistryError};
use tokio::sync::Notify;
use tracing::info;

const HEARTBEAT_INTERVAL_KEY: &str = "HeartbeatInterval";
const PHASE_ROTATION_KEY: &str = "ConnectorPhaseRotation";

/// Station state shared between handlers and the heartbeat loop
#[derive(Debug)]
pub struct StationState {
    heartbeat_secs: AtomicU64,
    connector_count: u32,
    /// Signalled by TriggerMessage(Heartbeat)
    pub heartbeat_requested: Notify,
}

impl StationState {
    pub fn new(heartbeat: Duration, connector_count: u32) -> Self {
        Self {
            heartbeat_secs: AtomicU64::new(heartbeat.as_secs().max(1)),
            connector_count,
            heartbeat_requested: Notify::new(),
        }
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs.load(Ordering::Relaxed))
    }

    pub fn set_heartbeat_interval(&self, secs: u64) {
        self.heartbeat_secs.store(secs.max(1), Ordering::Relaxed);
    }

    fn configuration(&self, keys: &[String]) -> v16::GetConfigurationResponse {
        let known = [
            v16::KeyValue {
                key: HEARTBEAT_INTERVAL_KEY.to_string(),
                readonly: false,
                value: Some(self.heartbeat_interval().as_secs().to_string()),
            },
            v16::KeyValue {
                key: "NumberOfConnectors".to_string(),
                readonly: true,
                value: Some(self.connector_count.to_string()),
            },
            v16::KeyValue {
                key: PHASE_ROTATION_KEY.to_string(),
                readonly: true,
                value: Some("NotApplicable".to_string()),
            },
        ];

        if keys.is_empty() {
            return v16::GetConfigurationResponse {
                configuration_key: known.to_vec(),
                unknown_key: Vec::new(),
            };
        }

        let mut response = v16::GetConfigurationResponse {
            configuration_key: Vec::new(),
            unknown_key: Vec::new(),
        };
        for key in keys {
            match known.iter().find(|kv| &kv.key == key) {
                Some(kv) => response.configuration_key.push(kv.clone()),
                None => response.unknown_key.push(key.clone()),
            }
        }
        response
    }

    fn change_configuration(&self, key: &str, value: &str) -> v16::ConfigurationStatus {
        match key {
            HEARTBEAT_INTERVAL_KEY => match value.parse::<u64>() {
                Ok(secs) if secs > 0 => {
                    self.set_heartbeat_interval(secs);
                    v16::ConfigurationStatus::Accepted
                }
                _ => v16::ConfigurationStatus::Rejected,
            },
            "NumberOfConnectors" | PHASE_ROTATION_KEY => v16::ConfigurationStatus::Rejected,
            _ => v16::ConfigurationStatus::NotSupported,
        }
    }
}

/// Register the OCPP 1.6 charge point handlers
pub fn register_v16(endpoint: &Endpoint, state: Arc<StationState>) -> Result<(), RegistryError> {
    endpoint.v16().support_all()?;

    endpoint.on::<v16::Reset, _, _>(|request| async move {
        info!("Reset requested: {:?}", request.request.reset_type);
        Ok(Some(v16::ResetResponse {
            status: v16::GenericStatus::Accepted,
        }))
    })?;

    let connectors = state.connector_count;
    endpoint.on::<v16::ChangeAvailability, _, _>(move |request| async move {
        let status = if request.request.connector_id < 0
            || request.request.connector_id as u32 > connectors
        {
            v16::AvailabilityStatus::Rejected
        } else {
            info!(
                "Connector {} now {:?}",
                request.request.connector_id, request.request.availability_type
            );
            v16::AvailabilityStatus::Accepted
        };
        Ok(Some(v16::ChangeAvailabilityResponse { status }))
    })?;

    {
        let state = state.clone();
        endpoint.on::<v16::GetConfiguration, _, _>(move |request| {
            let response = state.configuration(&request.request.key);
            async move { Ok(Some(response)) }
        })?;
    }

    {
        let state = state.clone();
        endpoint.on::<v16::ChangeConfiguration, _, _>(move |request| {
            let status = state.change_configuration(&request.request.key, &request.request.value);
            info!(
                "ChangeConfiguration {}={} -> {:?}",
                request.request.key, request.request.value, status
            );
            async move { Ok(Some(v16::ChangeConfigurationResponse { status })) }
        })?;
    }

    endpoint.on::<v16::TriggerMessage, _, _>(move |request| {
        let status = match request.request.requested_message {
            v16::MessageTrigger::Heartbeat => {
                state.heartbeat_requested.notify_one();
                v16::TriggerMessageStatus::Accepted
            }
            _ => v16::TriggerMessageStatus::NotImplemented,
        };
        async move { Ok(Some(v16::TriggerMessageResponse { status })) }
    })?;

    Ok(())
}

/// Register the OCPP 2.0.1 / 2.1 charging station handlers
pub fn register_v201(endpoint: &Endpoint, state: Arc<StationState>) -> Result<(), RegistryError> {
    endpoint.v201().support_all()?;

    endpoint.on::<v201::Reset, _, _>(|request| async move {
        info!("Reset requested: {:?}", request.request.reset_type);
        Ok(Some(v201::ResetResponse {
            status: v201::ResetStatus::Accepted,
            status_info: None,
        }))
    })?;

    endpoint.on::<v201::SetChargingProfile, _, _>(move |request| {
        let profile = &request.request.charging_profile;
        let status = if request.request.evse_id < 0
            || request.request.evse_id as u32 > state.connector_count
        {
            v201::ChargingProfileStatus::Rejected
        } else {
            info!(
                "Charging profile {} installed on EVSE {}",
                profile.id, request.request.evse_id
            );
            v201::ChargingProfileStatus::Accepted
        };
        async move {
            Ok(Some(v201::SetChargingProfileResponse {
                status,
                status_info: None,
            }))
        }
    })?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> StationState {
        StationState::new(Duration::from_secs(300), 2)
    }

    #[test]
    fn test_get_configuration_reports_unknown_keys() {
        let state = state();

        let all = state.configuration(&[]);
        assert_eq!(all.configuration_key.len(), 3);
        assert!(all.unknown_key.is_empty());

        let some = state.configuration(&["HeartbeatInterval".to_string(), "Foo".to_string()]);
        assert_eq!(some.configuration_key.len(), 1);
        assert_eq!(some.configuration_key[0].value.as_deref(), Some("300"));
        assert_eq!(some.unknown_key, vec!["Foo".to_string()]);
    }

    #[test]
    fn test_change_heartbeat_interval() {
        let state = state();

        assert_eq!(
            state.change_configuration("HeartbeatInterval", "60"),
            v16::ConfigurationStatus::Accepted
        );
        assert_eq!(state.heartbeat_interval(), Duration::from_secs(60));

        assert_eq!(
            state.change_configuration("HeartbeatInterval", "soon"),
            v16::ConfigurationStatus::Rejected
        );
        assert_eq!(
            state.change_configuration("NumberOfConnectors", "4"),
            v16::ConfigurationStatus::Rejected
        );
        assert_eq!(
            state.change_configuration("Unheard", "1"),
            v16::ConfigurationStatus::NotSupported
        );
        assert_eq!(state.heartbeat_interval(), Duration::from_secs(60));
    }
}

//! Request/response facade
//!
//! One typed async method per OCPP operation. Every method runs the same
//! algorithm, [`Endpoint::call`], and returns a [`Reply`] rather than an
//! error, so callers always get a machine-readable result code.

use crate::action::Action;
use crate::endpoint::{Endpoint, Reply};
use crate::error::RegistryError;

macro_rules! facade {
    ($(#[$meta:meta])* $facade:ident => $dialect:ident { $($method:ident: $action:ident,)* }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy)]
        pub struct $facade<'a> {
            endpoint: &'a Endpoint,
        }

        impl<'a> $facade<'a> {
            pub fn new(endpoint: &'a Endpoint) -> Self {
                Self { endpoint }
            }

            $(
                #[doc = concat!("Send `", stringify!($action), "` and await the typed reply")]
                pub async fn $method(
                    &self,
                    request: <crate::messages::$dialect::$action as Action>::Request,
                ) -> Reply<<crate::messages::$dialect::$action as Action>::Response> {
                    self.endpoint
                        .call::<crate::messages::$dialect::$action>(request)
                        .await
                }
            )*

            /// Accept every action of this dialect on the inbound side.
            ///
            /// Actions without a handler get their Failed response instead of
            /// `NotImplemented`. On a conflict nothing is registered.
            pub fn support_all(&self) -> Result<(), RegistryError> {
                let router = self.endpoint.router();
                $(router.check::<crate::messages::$dialect::$action>()?;)*
                $(self.endpoint.support::<crate::messages::$dialect::$action>()?;)*
                Ok(())
            }

            pub fn actions() -> &'static [&'static str] {
                const ACTIONS: &[&str] = &[$(<crate::messages::$dialect::$action as Action>::NAME,)*];
                ACTIONS
            }
        }
    };
}

facade!(
    /// OCPP 1.6 operations of an [`Endpoint`]
    V16 => v16 {
        boot_notification: BootNotification,
        heartbeat: Heartbeat,
        authorize: Authorize,
        start_transaction: StartTransaction,
        stop_transaction: StopTransaction,
        status_notification: StatusNotification,
        meter_values: MeterValues,
        data_transfer: DataTransfer,
        diagnostics_status_notification: DiagnosticsStatusNotification,
        firmware_status_notification: FirmwareStatusNotification,
        reset: Reset,
        change_availability: ChangeAvailability,
        get_configuration: GetConfiguration,
        change_configuration: ChangeConfiguration,
        reserve_now: ReserveNow,
        cancel_reservation: CancelReservation,
        remote_start_transaction: RemoteStartTransaction,
        remote_stop_transaction: RemoteStopTransaction,
        set_charging_profile: SetChargingProfile,
        clear_charging_profile: ClearChargingProfile,
        get_composite_schedule: GetCompositeSchedule,
        unlock_connector: UnlockConnector,
        get_local_list_version: GetLocalListVersion,
        send_local_list: SendLocalList,
        clear_cache: ClearCache,
        trigger_message: TriggerMessage,
    }
);

facade!(
    /// OCPP 2.0.1 / 2.1 operations of an [`Endpoint`]
    V201 => v201 {
        boot_notification: BootNotification,
        heartbeat: Heartbeat,
        authorize: Authorize,
        status_notification: StatusNotification,
        meter_values: MeterValues,
        transaction_event: TransactionEvent,
        data_transfer: DataTransfer,
        notify_event: NotifyEvent,
        security_event_notification: SecurityEventNotification,
        notify_report: NotifyReport,
        notify_monitoring_report: NotifyMonitoringReport,
        log_status_notification: LogStatusNotification,
        firmware_status_notification: FirmwareStatusNotification,
        sign_certificate: SignCertificate,
        get_15118_ev_certificate: Get15118EVCertificate,
        get_certificate_status: GetCertificateStatus,
        reservation_status_update: ReservationStatusUpdate,
        notify_ev_charging_needs: NotifyEVChargingNeeds,
        notify_charging_limit: NotifyChargingLimit,
        cleared_charging_limit: ClearedChargingLimit,
        report_charging_profiles: ReportChargingProfiles,
        notify_display_messages: NotifyDisplayMessages,
        notify_customer_information: NotifyCustomerInformation,
        reset: Reset,
        request_start_transaction: RequestStartTransaction,
        request_stop_transaction: RequestStopTransaction,
        set_charging_profile: SetChargingProfile,
        reserve_now: ReserveNow,
        cancel_reservation: CancelReservation,
        set_default_charging_tariff: SetDefaultChargingTariff,
        get_default_charging_tariff: GetDefaultChargingTariff,
        remove_default_charging_tariff: RemoveDefaultChargingTariff,
    }
);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EndpointConfig;
    use crate::ids::{ChargeBoxId, ProtocolVersion};
    use crate::transport::ChannelTransport;

    #[test]
    fn test_action_lists_are_unique() {
        for actions in [V16::actions(), V201::actions()] {
            let mut sorted = actions.to_vec();
            sorted.sort_unstable();
            sorted.dedup();
            assert_eq!(sorted.len(), actions.len());
        }
        assert_eq!(V16::actions().len(), 26);
        assert!(V201::actions().contains(&"TransactionEvent"));
    }

    #[test]
    fn test_support_all_registers_every_action() {
        let (transport, _rx) = ChannelTransport::new();
        let config = EndpointConfig::new(ChargeBoxId::new("CS001").unwrap())
            .with_protocol(ProtocolVersion::Ocpp201);
        let endpoint = Endpoint::new(config, transport);

        endpoint.v201().support_all().unwrap();
        let mut expected = V201::actions().to_vec();
        expected.sort_unstable();
        assert_eq!(endpoint.router().supported_actions(), expected);

        // The 1.6 types share names with the 2.0.1 ones and conflict.
        assert!(endpoint.v16().support_all().is_err());
    }

    #[test]
    fn test_support_all_conflict_registers_nothing() {
        let (transport, _rx) = ChannelTransport::new();
        let endpoint = Endpoint::new(EndpointConfig::new(ChargeBoxId::new("CS001").unwrap()), transport);
        endpoint.support::<crate::messages::v16::Reset>().unwrap();

        assert!(endpoint.v201().support_all().is_err());
        assert_eq!(endpoint.router().supported_actions(), vec!["Reset"]);
    }
}

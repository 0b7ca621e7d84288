//! OCPP action catalogue (1.6 and 2.0.1)

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

use super::OcppVersion;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown OCPP action '{0}'")]
pub struct UnknownMessageType(pub String);

macro_rules! message_types {
    ($($variant:ident),* $(,)?) => {
        /// Every action name known to the station, across both protocol versions.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub enum MessageType {
            $($variant),*
        }

        impl MessageType {
            pub const ALL: &'static [MessageType] = &[$(MessageType::$variant),*];

            /// Action name as it appears in a Call frame.
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => stringify!($variant)),*
                }
            }
        }

        impl FromStr for MessageType {
            type Err = UnknownMessageType;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $(stringify!($variant) => Ok(Self::$variant),)*
                    other => Err(UnknownMessageType(other.to_string())),
                }
            }
        }
    };
}

message_types! {
    Authorize,
    BootNotification,
    CancelReservation,
    CertificateSigned,
    ChangeAvailability,
    ChangeConfiguration,
    ClearCache,
    ClearChargingProfile,
    ClearDisplayMessage,
    ClearVariableMonitoring,
    ClearedChargingLimit,
    CostUpdated,
    CustomerInformation,
    DataTransfer,
    DeleteCertificate,
    DiagnosticsStatusNotification,
    FirmwareStatusNotification,
    Get15118EVCertificate,
    GetBaseReport,
    GetCertificateStatus,
    GetChargingProfiles,
    GetCompositeSchedule,
    GetConfiguration,
    GetDiagnostics,
    GetDisplayMessages,
    GetInstalledCertificateIds,
    GetLocalListVersion,
    GetLog,
    GetMonitoringReport,
    GetReport,
    GetTransactionStatus,
    GetVariables,
    Heartbeat,
    InstallCertificate,
    LogStatusNotification,
    MeterValues,
    NotifyChargingLimit,
    NotifyCustomerInformation,
    NotifyDisplayMessages,
    NotifyEVChargingNeeds,
    NotifyEVChargingSchedule,
    NotifyEvent,
    NotifyMonitoringReport,
    NotifyReport,
    PublishFirmware,
    PublishFirmwareStatusNotification,
    RemoteStartTransaction,
    RemoteStopTransaction,
    ReportChargingProfiles,
    RequestStartTransaction,
    RequestStopTransaction,
    ReservationStatusUpdate,
    ReserveNow,
    Reset,
    SecurityEventNotification,
    SendLocalList,
    SetChargingProfile,
    SetDisplayMessage,
    SetMonitoringBase,
    SetMonitoringLevel,
    SetNetworkProfile,
    SetVariableMonitoring,
    SetVariables,
    SignCertificate,
    StartTransaction,
    StatusNotification,
    StopTransaction,
    TransactionEvent,
    TriggerMessage,
    UnlockConnector,
    UnpublishFirmware,
    UpdateFirmware,
}

impl MessageType {
    /// Messages that must survive a restart and are retried on timeout.
    pub fn is_transaction_message(&self, version: OcppVersion) -> bool {
        match version {
            OcppVersion::V16 => matches!(
                self,
                Self::StartTransaction
                    | Self::StopTransaction
                    | Self::MeterValues
                    | Self::SecurityEventNotification
            ),
            OcppVersion::V201 => {
                matches!(self, Self::TransactionEvent | Self::SecurityEventNotification)
            }
        }
    }

    pub fn is_boot_notification(&self) -> bool {
        matches!(self, Self::BootNotification)
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_parse_back() {
        for mt in MessageType::ALL {
            assert_eq!(mt.as_str().parse::<MessageType>().unwrap(), *mt);
        }
        assert_eq!(
            "FooBar".parse::<MessageType>(),
            Err(UnknownMessageType("FooBar".into()))
        );
    }

    #[test]
    fn transaction_classification_depends_on_version() {
        use MessageType::*;

        assert!(MeterValues.is_transaction_message(OcppVersion::V16));
        assert!(StopTransaction.is_transaction_message(OcppVersion::V16));
        assert!(!TransactionEvent.is_transaction_message(OcppVersion::V16));

        assert!(TransactionEvent.is_transaction_message(OcppVersion::V201));
        assert!(SecurityEventNotification.is_transaction_message(OcppVersion::V201));
        assert!(!MeterValues.is_transaction_message(OcppVersion::V201));
        assert!(!Heartbeat.is_transaction_message(OcppVersion::V201));
    }
}

//! UDS negative response codes (ISO 14229-1 Annex A)

use std::fmt;

macro_rules! negative_response_codes {
    ($($variant:ident = $code:literal => $name:literal,)+) => {
        /// Standard negative response codes
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum NegativeResponseCode {
            $($variant,)+
            /// Reserved or manufacturer-specific code
            Other(u8),
        }

        impl From<u8> for NegativeResponseCode {
            fn from(value: u8) -> Self {
                match value {
                    $($code => Self::$variant,)+
                    other => Self::Other(other),
                }
            }
        }

        impl From<NegativeResponseCode> for u8 {
            fn from(nrc: NegativeResponseCode) -> Self {
                match nrc {
                    $(NegativeResponseCode::$variant => $code,)+
                    NegativeResponseCode::Other(v) => v,
                }
            }
        }

        impl NegativeResponseCode {
            /// ISO short name, e.g. `requestOutOfRange`
            pub fn name(&self) -> Option<&'static str> {
                match self {
                    $(Self::$variant => Some($name),)+
                    Self::Other(_) => None,
                }
            }
        }
    };
}

negative_response_codes! {
    GeneralReject = 0x10 => "generalReject",
    ServiceNotSupported = 0x11 => "serviceNotSupported",
    SubFunctionNotSupported = 0x12 => "subFunctionNotSupported",
    IncorrectMessageLengthOrFormat = 0x13 => "incorrectMessageLengthOrInvalidFormat",
    ResponseTooLong = 0x14 => "responseTooLong",
    BusyRepeatRequest = 0x21 => "busyRepeatRequest",
    ConditionsNotCorrect = 0x22 => "conditionsNotCorrect",
    RequestSequenceError = 0x24 => "requestSequenceError",
    NoResponseFromSubnet = 0x25 => "noResponseFromSubnetComponent",
    FailurePreventsExecution = 0x26 => "failurePreventsExecutionOfRequestedAction",
    RequestOutOfRange = 0x31 => "requestOutOfRange",
    SecurityAccessDenied = 0x33 => "securityAccessDenied",
    InvalidKey = 0x35 => "invalidKey",
    ExceededNumberOfAttempts = 0x36 => "exceedNumberOfAttempts",
    RequiredTimeDelayNotExpired = 0x37 => "requiredTimeDelayNotExpired",
    UploadDownloadNotAccepted = 0x70 => "uploadDownloadNotAccepted",
    TransferDataSuspended = 0x71 => "transferDataSuspended",
    GeneralProgrammingFailure = 0x72 => "generalProgrammingFailure",
    WrongBlockSequenceCounter = 0x73 => "wrongBlockSequenceCounter",
    ResponsePending = 0x78 => "requestCorrectlyReceivedResponsePending",
    SubFunctionNotSupportedInActiveSession = 0x7E => "subFunctionNotSupportedInActiveSession",
    ServiceNotSupportedInActiveSession = 0x7F => "serviceNotSupportedInActiveSession",
    RpmTooHigh = 0x81 => "rpmTooHigh",
    RpmTooLow = 0x82 => "rpmTooLow",
    EngineIsRunning = 0x83 => "engineIsRunning",
    EngineIsNotRunning = 0x84 => "engineIsNotRunning",
    EngineRunTimeTooLow = 0x85 => "engineRunTimeTooLow",
    TemperatureTooHigh = 0x86 => "temperatureTooHigh",
    TemperatureTooLow = 0x87 => "temperatureTooLow",
    VehicleSpeedTooHigh = 0x88 => "vehicleSpeedTooHigh",
    VehicleSpeedTooLow = 0x89 => "vehicleSpeedTooLow",
    ThrottlePedalTooHigh = 0x8A => "throttlePedalTooHigh",
    ThrottlePedalTooLow = 0x8B => "throttlePedalTooLow",
    TransmissionRangeNotInNeutral = 0x8C => "transmissionRangeNotInNeutral",
    TransmissionRangeNotInGear = 0x8D => "transmissionRangeNotInGear",
    BrakeSwitchNotClosed = 0x8F => "brakeSwitchOrSwitchesNotClosed",
    ShifterLeverNotInPark = 0x90 => "shifterLeverNotInPark",
    TorqueConverterClutchLocked = 0x91 => "torqueConverterClutchLocked",
    VoltageTooHigh = 0x92 => "voltageTooHigh",
    VoltageTooLow = 0x93 => "voltageTooLow",
}

impl NegativeResponseCode {
    pub fn code(&self) -> u8 {
        (*self).into()
    }

    /// The ECU accepted the request and will answer later
    pub fn is_response_pending(&self) -> bool {
        matches!(self, Self::ResponsePending)
    }
}

impl fmt::UpperHex for NegativeResponseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::UpperHex::fmt(&self.code(), f)
    }
}

impl fmt::Display for NegativeResponseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => f.write_str(name),
            None => write!(f, "Unknown NRC (0x{:02X})", self.code()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nrc_round_trip_codes() {
        for code in 0u8..=0xFF {
            let nrc = NegativeResponseCode::from(code);
            assert_eq!(u8::from(nrc), code);
        }
    }

    #[test]
    fn test_nrc_names() {
        assert_eq!(
            NegativeResponseCode::from(0x31).to_string(),
            "requestOutOfRange"
        );
        assert_eq!(
            NegativeResponseCode::from(0x22).name(),
            Some("conditionsNotCorrect")
        );
        assert_eq!(
            NegativeResponseCode::from(0xF0).to_string(),
            "Unknown NRC (0xF0)"
        );
        assert!(NegativeResponseCode::from(0x78).is_response_pending());
        assert_eq!(format!("{:02X}", NegativeResponseCode::SecurityAccessDenied), "33");
    }
}

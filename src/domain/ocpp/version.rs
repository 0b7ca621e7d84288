//! OCPP protocol version spoken with the CSMS

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OcppVersion {
    /// OCPP 1.6 (JSON / OCPP-J)
    #[serde(rename = "1.6")]
    V16,
    /// OCPP 2.0.1
    #[serde(rename = "2.0.1")]
    V201,
}

impl OcppVersion {
    /// Value offered in the `Sec-WebSocket-Protocol` header.
    pub fn subprotocol(&self) -> &'static str {
        match self {
            Self::V16 => "ocpp1.6",
            Self::V201 => "ocpp2.0.1",
        }
    }

    pub fn from_subprotocol(s: &str) -> Option<Self> {
        match s.trim() {
            "ocpp1.6" => Some(Self::V16),
            "ocpp2.0.1" => Some(Self::V201),
            _ => None,
        }
    }

    pub fn version_string(&self) -> &'static str {
        match self {
            Self::V16 => "1.6",
            Self::V201 => "2.0.1",
        }
    }
}

impl Default for OcppVersion {
    fn default() -> Self {
        Self::V201
    }
}

impl FromStr for OcppVersion {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "1.6" | "ocpp1.6" => Ok(Self::V16),
            "2.0.1" | "ocpp2.0.1" => Ok(Self::V201),
            other => Err(format!("unsupported OCPP version '{}'", other)),
        }
    }
}

impl fmt::Display for OcppVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OCPP {}", self.version_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subprotocol_round_trips() {
        for v in [OcppVersion::V16, OcppVersion::V201] {
            assert_eq!(OcppVersion::from_subprotocol(v.subprotocol()), Some(v));
        }
        assert_eq!(OcppVersion::from_subprotocol("ocpp2.1"), None);
    }

    #[test]
    fn parses_config_values() {
        assert_eq!("1.6".parse::<OcppVersion>(), Ok(OcppVersion::V16));
        assert_eq!("ocpp2.0.1".parse::<OcppVersion>(), Ok(OcppVersion::V201));
        assert!("3.0".parse::<OcppVersion>().is_err());
    }
}

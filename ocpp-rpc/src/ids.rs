//! Identifiers carried on every OCPP-J exchange

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::IdentityError;

/// Correlation token linking a CALL to its CALLRESULT or CALLERROR.
///
/// Generated by the initiator and echoed verbatim by the responder.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(String);

impl RequestId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Fresh random (UUID v4) request id
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RequestId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for RequestId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Stable identity of a charging station.
///
/// Never empty; construction trims surrounding whitespace and rejects blanks.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct ChargeBoxId(String);

impl ChargeBoxId {
    pub fn new(id: impl AsRef<str>) -> Result<Self, IdentityError> {
        let id = id.as_ref().trim();
        if id.is_empty() {
            return Err(IdentityError::Empty);
        }
        Ok(Self(id.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChargeBoxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(&self.0)
    }
}

impl FromStr for ChargeBoxId {
    type Err = IdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl<'de> Deserialize<'de> for ChargeBoxId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::new(raw).map_err(serde::de::Error::custom)
    }
}

/// OCPP protocol dialect spoken on a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ProtocolVersion {
    #[default]
    Ocpp16,
    Ocpp201,
    Ocpp21,
}

impl ProtocolVersion {
    /// WebSocket subprotocol token negotiated during the upgrade
    pub fn subprotocol(self) -> &'static str {
        match self {
            ProtocolVersion::Ocpp16 => "ocpp1.6",
            ProtocolVersion::Ocpp201 => "ocpp2.0.1",
            ProtocolVersion::Ocpp21 => "ocpp2.1",
        }
    }

    pub fn is_v2(self) -> bool {
        !matches!(self, ProtocolVersion::Ocpp16)
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.subprotocol())
    }
}

impl FromStr for ProtocolVersion {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let version = s.trim().to_ascii_lowercase();
        match version.trim_start_matches("ocpp") {
            "1.6" | "16" => Ok(ProtocolVersion::Ocpp16),
            "2.0.1" | "201" => Ok(ProtocolVersion::Ocpp201),
            "2.1" | "21" => Ok(ProtocolVersion::Ocpp21),
            _ => Err(format!("unsupported OCPP version: {}", s)),
        }
    }
}

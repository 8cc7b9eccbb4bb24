//! Connection policy types
//!
//! A [`Connection`] is the unit of policy handed to a backend. It is only ever
//! built from a [`RawConnection`] through validation, so every value of the
//! typed model already satisfies the model's invariants.

use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

pub const DEFAULT_LIFETIME_MINUTES: u32 = 60;
pub const ANY: &str = "any";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IpsecMode {
    Tunnel,
    Transport,
}

impl IpsecMode {
    /// Capitalized form used by native tooling (`Tunnel`, `Transport`).
    pub fn native_name(&self) -> &'static str {
        match self {
            IpsecMode::Tunnel => "Tunnel",
            IpsecMode::Transport => "Transport",
        }
    }
}

impl FromStr for IpsecMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "tunnel" => Ok(IpsecMode::Tunnel),
            "transport" => Ok(IpsecMode::Transport),
            _ => Err(format!(
                "invalid mode '{s}', must be 'tunnel' or 'transport'"
            )),
        }
    }
}

impl fmt::Display for IpsecMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IpsecMode::Tunnel => f.write_str("tunnel"),
            IpsecMode::Transport => f.write_str("transport"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IkeVersion {
    #[serde(rename = "ikev2")]
    IkeV2,
}

impl FromStr for IkeVersion {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ikev2" => Ok(IkeVersion::IkeV2),
            _ => Err(format!(
                "invalid IKE version '{s}', only 'ikev2' is supported"
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AuthKind {
    #[serde(rename = "psk")]
    PresharedKey,
}

impl FromStr for AuthKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "psk" => Ok(AuthKind::PresharedKey),
            _ => Err(format!(
                "unsupported auth type '{s}', only 'psk' is supported"
            )),
        }
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct AuthCredential {
    pub kind: AuthKind,
    pub secret: String,
}

// Keeps the preshared key out of logs.
impl fmt::Debug for AuthCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthCredential")
            .field("kind", &self.kind)
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// Opaque algorithm-suite tokens, passed through to the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CryptoProposal {
    pub ike: String,
    pub esp: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrafficSelector {
    pub protocol: String,
    pub local_port: String,
    pub remote_port: String,
}

impl Default for TrafficSelector {
    fn default() -> Self {
        Self {
            protocol: ANY.to_string(),
            local_port: ANY.to_string(),
            remote_port: ANY.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connection {
    pub name: String,
    pub mode: IpsecMode,
    pub ike_version: IkeVersion,
    pub auth: AuthCredential,
    pub crypto: CryptoProposal,
    pub local_subnets: Vec<IpNet>,
    pub remote_subnets: Vec<IpNet>,
    pub selector: TrafficSelector,
    pub lifetime_minutes: u32,
}

impl Connection {
    /// Stable identifiers of the policy objects this connection maps to,
    /// one per local/remote subnet pair.
    pub fn policy_ids(&self) -> Vec<String> {
        self.local_subnets
            .iter()
            .flat_map(|local| {
                self.remote_subnets
                    .iter()
                    .map(move |remote| format!("{}:{}->{}", self.name, local, remote))
            })
            .collect()
    }
}

/// Parses a CIDR the permissive way: host bits are allowed (`10.0.0.5/24`)
/// and a bare address is a single-host network.
pub fn parse_subnet(value: &str) -> Result<IpNet, String> {
    let value = value.trim();
    let parsed = if value.contains('/') {
        value.parse::<IpNet>().ok()
    } else {
        value.parse::<IpAddr>().ok().map(IpNet::from)
    };
    parsed.ok_or_else(|| format!("invalid CIDR '{value}'"))
}

/// Selector fields accept either a string (`"any"`, `"tcp"`) or a number (`443`, `6`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SelectorValue {
    Number(u64),
    Text(String),
}

impl Default for SelectorValue {
    fn default() -> Self {
        SelectorValue::Text(ANY.to_string())
    }
}

impl fmt::Display for SelectorValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SelectorValue::Number(n) => write!(f, "{n}"),
            SelectorValue::Text(s) => f.write_str(s.trim()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawAuth {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub value: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawEncryption {
    #[serde(default)]
    pub ike: String,
    #[serde(default)]
    pub esp: String,
}

/// A connection declaration as written in the configuration file.
///
/// Defaults are applied here, during deserialization, and nowhere else.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawConnection {
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_mode")]
    pub mode: String,
    #[serde(default = "default_ike_version")]
    pub ike_version: String,
    #[serde(default)]
    pub auth: RawAuth,
    #[serde(default)]
    pub encryption: RawEncryption,
    #[serde(default)]
    pub local_subnets: Vec<String>,
    #[serde(default)]
    pub remote_subnets: Vec<String>,
    #[serde(default)]
    pub protocol: SelectorValue,
    #[serde(default)]
    pub local_port: SelectorValue,
    #[serde(default)]
    pub remote_port: SelectorValue,
    #[serde(default = "default_lifetime")]
    pub lifetime_minutes: i64,
}

fn default_mode() -> String {
    "tunnel".to_string()
}

fn default_ike_version() -> String {
    "ikev2".to_string()
}

fn default_lifetime() -> i64 {
    i64::from(DEFAULT_LIFETIME_MINUTES)
}

impl RawConnection {
    /// Label used to prefix defects; falls back to the list position for unnamed entries.
    pub fn label(&self, index: usize) -> String {
        if self.name.trim().is_empty() {
            format!("connections[{index}]")
        } else {
            format!("connection '{}'", self.name.trim())
        }
    }

    /// Converts into a typed [`Connection`], collecting every defect found.
    pub fn validate(&self) -> Result<Connection, Vec<String>> {
        let mut defects = Vec::new();

        let name = self.name.trim().to_string();
        if name.is_empty() {
            defects.push("name cannot be empty".to_string());
        }

        let mode = self.mode.parse::<IpsecMode>().map_err(|e| defects.push(e)).ok();
        let ike_version = self
            .ike_version
            .parse::<IkeVersion>()
            .map_err(|e| defects.push(e))
            .ok();

        let auth_kind = self
            .auth
            .kind
            .parse::<AuthKind>()
            .map_err(|e| defects.push(e))
            .ok();
        if self.auth.value.is_empty() {
            defects.push("auth value (PSK) cannot be empty".to_string());
        }

        if self.encryption.ike.trim().is_empty() {
            defects.push("encryption.ike proposal cannot be empty".to_string());
        }
        if self.encryption.esp.trim().is_empty() {
            defects.push("encryption.esp proposal cannot be empty".to_string());
        }

        let local_subnets = subnets("local_subnets", &self.local_subnets, &mut defects);
        let remote_subnets = subnets("remote_subnets", &self.remote_subnets, &mut defects);

        let lifetime_minutes = match u32::try_from(self.lifetime_minutes) {
            Ok(minutes) if minutes > 0 => Some(minutes),
            _ => {
                defects.push(format!(
                    "lifetime_minutes must be a positive integer, got {}",
                    self.lifetime_minutes
                ));
                None
            }
        };

        match (mode, ike_version, auth_kind, lifetime_minutes) {
            (Some(mode), Some(ike_version), Some(kind), Some(lifetime_minutes))
                if defects.is_empty() =>
            {
                Ok(Connection {
                    name,
                    mode,
                    ike_version,
                    auth: AuthCredential {
                        kind,
                        secret: self.auth.value.clone(),
                    },
                    crypto: CryptoProposal {
                        ike: self.encryption.ike.trim().to_string(),
                        esp: self.encryption.esp.trim().to_string(),
                    },
                    local_subnets,
                    remote_subnets,
                    selector: TrafficSelector {
                        protocol: self.protocol.to_string(),
                        local_port: self.local_port.to_string(),
                        remote_port: self.remote_port.to_string(),
                    },
                    lifetime_minutes,
                })
            }
            _ => Err(defects),
        }
    }
}

fn subnets(field: &str, values: &[String], defects: &mut Vec<String>) -> Vec<IpNet> {
    if values.is_empty() {
        defects.push(format!("{field} must list at least one CIDR"));
        return Vec::new();
    }

    values
        .iter()
        .filter_map(|value| {
            parse_subnet(value)
                .map_err(|e| defects.push(format!("{field}: {e}")))
                .ok()
        })
        .collect()
}

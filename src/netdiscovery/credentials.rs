//! Credential validation for network discovery.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::event::value_i64;

/// Authentication parameters used to query a discovered host.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Credential {
    #[serde(default, alias = "ID", deserialize_with = "loose_string")]
    pub id: Option<String>,
    #[serde(default, rename = "type", alias = "TYPE", deserialize_with = "loose_string")]
    pub cred_type: Option<String>,
    #[serde(default, alias = "VERSION", deserialize_with = "loose_string")]
    pub version: Option<String>,
    #[serde(default, alias = "COMMUNITY", deserialize_with = "loose_string")]
    pub community: Option<String>,
    #[serde(default, alias = "USERNAME", deserialize_with = "loose_string")]
    pub username: Option<String>,
    #[serde(default, alias = "PASSWORD", deserialize_with = "loose_string")]
    pub password: Option<String>,
    #[serde(default, alias = "AUTHPROTOCOL", deserialize_with = "loose_string")]
    pub authprotocol: Option<String>,
    #[serde(default, alias = "AUTHPASSWORD", deserialize_with = "loose_string")]
    pub authpassword: Option<String>,
    #[serde(default, alias = "PRIVPROTOCOL", deserialize_with = "loose_string")]
    pub privprotocol: Option<String>,
    #[serde(default, alias = "PRIVPASSWORD", deserialize_with = "loose_string")]
    pub privpassword: Option<String>,
    /// Kept raw: servers send numbers, strings or garbage here.
    #[serde(default, alias = "PORT")]
    pub port: Option<Value>,
}

/// Accept strings and numbers for string fields.
pub(crate) fn loose_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(crate::event::value_string(value.as_ref()))
}

/// Supported credential families.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialType {
    Snmp,
    Esx,
    Ssh,
    Winrm,
}

impl CredentialType {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "snmp" => Some(CredentialType::Snmp),
            "esx" => Some(CredentialType::Esx),
            "ssh" => Some(CredentialType::Ssh),
            "winrm" => Some(CredentialType::Winrm),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CredentialType::Snmp => "snmp",
            CredentialType::Esx => "esx",
            CredentialType::Ssh => "ssh",
            CredentialType::Winrm => "winrm",
        }
    }

    /// Port probed when the credential does not set one.
    pub fn default_port(&self) -> u16 {
        match self {
            CredentialType::Snmp => 161,
            CredentialType::Esx => 443,
            CredentialType::Ssh => 22,
            CredentialType::Winrm => 5985,
        }
    }
}

impl Credential {
    /// Credential type, `snmp` when unset, `None` when unsupported.
    pub fn kind(&self) -> Option<CredentialType> {
        match self.cred_type.as_deref() {
            None | Some("") => Some(CredentialType::Snmp),
            Some(other) => CredentialType::parse(other),
        }
    }

    /// Validated port for remote credentials.
    pub fn remote_port(&self) -> Option<u16> {
        let kind = self.kind()?;
        match &self.port {
            None | Some(Value::Null) => Some(kind.default_port()),
            Some(v) => value_i64(Some(v)).and_then(|p| u16::try_from(p).ok()),
        }
    }

    fn filled(field: &Option<String>) -> bool {
        field.as_deref().is_some_and(|s| !s.is_empty())
    }
}

/// Credentials that passed validation, split by family.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ValidCredentials {
    pub snmp: Vec<Credential>,
    pub remote: Vec<Credential>,
}

/// Partition credentials into valid SNMP and valid remote ones.
///
/// Invalid entries are dropped. Only the first invalid entry of each family
/// logs its reason, and a summary warning is logged when a family had
/// entries but none survived.
pub fn validate(credentials: &[Credential]) -> ValidCredentials {
    let mut valid = ValidCredentials::default();
    let (mut snmp_count, mut invalid_snmp) = (0usize, 0usize);
    let (mut remote_count, mut invalid_remote) = (0usize, 0usize);

    for credential in credentials {
        let Some(kind) = credential.kind() else {
            continue;
        };

        if kind == CredentialType::Snmp {
            snmp_count += 1;
            let reason = if credential.version.as_deref() == Some("3") {
                (!Credential::filled(&credential.username))
                    .then_some("No username defined for a SNMPv3 credential")
            } else {
                (!Credential::filled(&credential.community))
                    .then_some("No community defined for a credential")
            };
            if let Some(reason) = reason {
                if invalid_snmp == 0 {
                    tracing::warn!("{}", reason);
                }
                invalid_snmp += 1;
                continue;
            }
            valid.snmp.push(credential.clone());
            continue;
        }

        remote_count += 1;
        let reason = if !Credential::filled(&credential.username) {
            Some("No username defined for a")
        } else if matches!(kind, CredentialType::Esx | CredentialType::Winrm)
            && !Credential::filled(&credential.password)
        {
            Some("No password defined for a")
        } else if matches!(kind, CredentialType::Ssh | CredentialType::Winrm)
            && !port_is_valid(credential.port.as_ref())
        {
            Some("Not valid port defined for a")
        } else {
            None
        };

        if let Some(reason) = reason {
            if invalid_remote == 0 {
                tracing::warn!("{} {} credential", reason, kind.as_str());
            }
            invalid_remote += 1;
            continue;
        }
        valid.remote.push(credential.clone());
    }

    if snmp_count > 0 && valid.snmp.is_empty() {
        tracing::warn!("No valid SNMP credential defined for this scan");
    }
    if remote_count > 0 && valid.remote.is_empty() {
        tracing::warn!("No valid remote credential defined for this scan");
    }

    valid
}

fn port_is_valid(port: Option<&Value>) -> bool {
    match port {
        None | Some(Value::Null) => true,
        Some(Value::Number(n)) => n.as_u64().is_some_and(|p| p <= 65535),
        Some(Value::String(s)) => s.trim().parse::<u32>().is_ok_and(|p| p <= 65535),
        _ => false,
    }
}

//! Replay of `snmpwalk` output files.
//!
//! Lets a discovery run against recorded devices instead of live agents.

use std::collections::HashMap;
use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;

use super::ProbeError;

/// Symbolic names found in walks made without `-On`.
const KNOWN_NAMES: &[(&str, &str)] = &[
    ("SNMPv2-MIB::sysDescr", "1.3.6.1.2.1.1.1"),
    ("SNMPv2-MIB::sysObjectID", "1.3.6.1.2.1.1.2"),
    ("DISMAN-EVENT-MIB::sysUpTimeInstance", "1.3.6.1.2.1.1.3.0"),
    ("SNMPv2-MIB::sysContact", "1.3.6.1.2.1.1.4"),
    ("SNMPv2-MIB::sysName", "1.3.6.1.2.1.1.5"),
    ("SNMPv2-MIB::sysLocation", "1.3.6.1.2.1.1.6"),
];

/// OID to value map loaded from a walk file.
#[derive(Debug, Clone, Default)]
pub struct WalkFile {
    values: HashMap<String, String>,
}

impl WalkFile {
    pub fn load(path: &Path) -> Result<Self, ProbeError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ProbeError::Config(format!("can't read walk file {}: {}", path.display(), e)))?;
        Ok(Self::parse(&content))
    }

    pub fn parse(content: &str) -> Self {
        static LINE: OnceLock<Regex> = OnceLock::new();
        let line = LINE.get_or_init(|| {
            Regex::new(r"^(?P<oid>\S+)\s*=\s*(?:(?P<type>[A-Za-z0-9\- ]+):\s*)?(?P<value>.*)$").unwrap()
        });

        let values = content
            .lines()
            .filter_map(|l| line.captures(l.trim_end()))
            .filter_map(|caps| {
                let oid = normalize_oid(caps.name("oid")?.as_str())?;
                let value = caps.name("value")?.as_str().trim().trim_matches('"').to_string();
                Some((oid, value))
            })
            .collect();

        Self { values }
    }

    pub fn get(&self, oid: &str) -> Option<&str> {
        self.values.get(oid.trim_start_matches('.')).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

fn normalize_oid(raw: &str) -> Option<String> {
    if let Some(rest) = raw.strip_prefix("iso.") {
        return Some(format!("1.{}", rest));
    }
    if raw.starts_with('.') || raw.starts_with(|c: char| c.is_ascii_digit()) {
        return Some(raw.trim_start_matches('.').to_string());
    }
    KNOWN_NAMES.iter().find_map(|(name, numeric)| {
        let suffix = raw.strip_prefix(name)?;
        if suffix.is_empty() {
            Some(numeric.to_string())
        } else {
            suffix.starts_with('.').then(|| format!("{}{}", numeric, suffix))
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::SYS_DESCR_OID;
    use std::io::Write;

    const WALK: &str = r#".1.3.6.1.2.1.1.1.0 = STRING: "Cisco IOS Software, C2960"
.1.3.6.1.2.1.1.2.0 = OID: .1.3.6.1.4.1.9.1.716
iso.3.6.1.2.1.1.5.0 = STRING: "sw-core"
SNMPv2-MIB::sysLocation.0 = STRING: lab
garbage line
"#;

    #[test]
    fn test_parse_walk() {
        let walk = WalkFile::parse(WALK);
        assert_eq!(walk.len(), 4);
        assert_eq!(walk.get(SYS_DESCR_OID), Some("Cisco IOS Software, C2960"));
        assert_eq!(walk.get(".1.3.6.1.2.1.1.2.0"), Some(".1.3.6.1.4.1.9.1.716"));
        assert_eq!(walk.get("1.3.6.1.2.1.1.5.0"), Some("sw-core"));
        assert_eq!(walk.get("1.3.6.1.2.1.1.6.0"), Some("lab"));
    }

    #[test]
    fn test_load_walk_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(WALK.as_bytes()).unwrap();
        let walk = WalkFile::load(file.path()).unwrap();
        assert!(!walk.is_empty());

        assert!(WalkFile::load(Path::new("/nonexistent/walk.txt")).is_err());
    }
}

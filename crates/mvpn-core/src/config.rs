//! Tunnel Config Parsing
//!
//! Parses the sectioned text format the assignment backend hands out:
//! bracketed section headers (`[Interface]`, `[Peer]`) followed by
//! `key = value` lines. Section and key names are case-insensitive and
//! normalized to lowercase.
//!
//! The parser is deliberately permissive: the config text is produced by
//! the backend, may carry comments and blank lines, and a strict reject
//! on a stray line would only turn formatting noise into connect
//! failures. Lines outside a section or without a `=` are skipped, and
//! the only gate that matters is [`TunnelConfig::validate`], which
//! requires both the `interface` and `peer` sections to be present and
//! non-empty.

use std::collections::HashMap;
use std::fmt;

/// Section holding the local endpoint (private key, address, DNS)
pub const INTERFACE_SECTION: &str = "interface";
/// Section holding the remote endpoint (public key, endpoint, allowed IPs)
pub const PEER_SECTION: &str = "peer";

/// Config validity errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("missing or empty [{0}] section")]
    MissingSection(&'static str),
}

/// A parsed tunnel configuration: section name -> key -> value,
/// all names lowercase.
#[derive(Clone, Default, PartialEq)]
pub struct TunnelConfig {
    sections: HashMap<String, HashMap<String, String>>,
}

impl TunnelConfig {
    /// Parse raw config text.
    ///
    /// Scans line by line: a `[name]` line opens a section (created if
    /// absent, so a re-opened section accumulates); a `key = value` line
    /// inside a section is split on the first `=` only, since values such
    /// as base64 keys contain `=` themselves. Later duplicate keys
    /// overwrite earlier ones. Everything else is ignored.
    pub fn parse(raw: &str) -> Self {
        let mut sections: HashMap<String, HashMap<String, String>> = HashMap::new();
        let mut current: Option<String> = None;

        for line in raw.lines() {
            let line = line.trim();
            if line.len() >= 3 && line.starts_with('[') && line.ends_with(']') {
                let name = line[1..line.len() - 1].to_lowercase();
                sections.entry(name.clone()).or_default();
                current = Some(name);
            } else if let Some(section) = &current {
                if let Some((key, value)) = line.split_once('=') {
                    if let Some(map) = sections.get_mut(section) {
                        map.insert(key.trim().to_lowercase(), value.trim().to_string());
                    }
                }
            }
        }

        Self { sections }
    }

    /// Check that both required sections parsed non-empty. The parser
    /// itself never fails; this is the caller's usability gate.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for name in [INTERFACE_SECTION, PEER_SECTION] {
            match self.sections.get(name) {
                Some(section) if !section.is_empty() => {}
                _ => return Err(ConfigError::MissingSection(name)),
            }
        }
        Ok(())
    }

    /// All sections (names lowercase)
    pub fn sections(&self) -> &HashMap<String, HashMap<String, String>> {
        &self.sections
    }

    /// Look up a section by (case-insensitive) name
    pub fn section(&self, name: &str) -> Option<&HashMap<String, String>> {
        self.sections.get(&name.to_lowercase())
    }

    /// Look up a single value
    pub fn get(&self, section: &str, key: &str) -> Option<&str> {
        self.section(section)
            .and_then(|s| s.get(&key.to_lowercase()))
            .map(String::as_str)
    }

    /// The `[interface]` section, if present
    pub fn interface(&self) -> Option<&HashMap<String, String>> {
        self.sections.get(INTERFACE_SECTION)
    }

    /// The `[peer]` section, if present
    pub fn peer(&self) -> Option<&HashMap<String, String>> {
        self.sections.get(PEER_SECTION)
    }
}

fn is_sensitive_key(key: &str) -> bool {
    key == "privatekey" || key == "presharedkey"
}

// Key material must not leak through logs
impl fmt::Debug for TunnelConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut outer = f.debug_map();
        for (name, section) in &self.sections {
            let redacted: HashMap<&str, &str> = section
                .iter()
                .map(|(k, v)| {
                    if is_sensitive_key(k) {
                        (k.as_str(), "[redacted]")
                    } else {
                        (k.as_str(), v.as_str())
                    }
                })
                .collect();
            outer.entry(name, &redacted);
        }
        outer.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[Interface]
PrivateKey = zrA2aBgnWCgvsUYYKNxaNZrsgX5/E2s4xPsY/S42IQo=
Address = 10.8.0.2/24
DNS = 1.1.1.1

[Peer]
PublicKey = Jqve1PXqIo4e+NjUvV9IT9Cz4mM9pUhALR7qLhf2taI=
Endpoint = 5.6.7.8:51820
AllowedIPs = 0.0.0.0/0
"#;

    #[test]
    fn test_parse_two_section_config() {
        let config = TunnelConfig::parse(SAMPLE);
        config.validate().unwrap();

        assert_eq!(config.get("interface", "address"), Some("10.8.0.2/24"));
        assert_eq!(config.get("peer", "endpoint"), Some("5.6.7.8:51820"));
        assert_eq!(config.interface().unwrap().len(), 3);
        assert_eq!(config.peer().unwrap().len(), 3);
    }

    #[test]
    fn test_names_lowercased_lookup_case_insensitive() {
        let config = TunnelConfig::parse("[INTERFACE]\nPRIVATEKEY = x\n");
        assert!(config.sections().contains_key("interface"));
        assert_eq!(config.get("Interface", "PrivateKey"), Some("x"));
    }

    #[test]
    fn test_value_split_on_first_equals_only() {
        // base64 padding would be truncated by a split-on-every-equals
        let config = TunnelConfig::parse("[peer]\npublickey = AbC=dEf==\n");
        assert_eq!(config.get("peer", "publickey"), Some("AbC=dEf=="));
    }

    #[test]
    fn test_duplicate_key_overwrites() {
        let config = TunnelConfig::parse("[interface]\ndns = 1.1.1.1\ndns = 9.9.9.9\n");
        assert_eq!(config.get("interface", "dns"), Some("9.9.9.9"));
        assert_eq!(config.interface().unwrap().len(), 1);
    }

    #[test]
    fn test_reopened_section_accumulates() {
        let config = TunnelConfig::parse("[peer]\na = 1\n[interface]\nx = 2\n[peer]\nb = 3\n");
        let peer = config.peer().unwrap();
        assert_eq!(peer.get("a").map(String::as_str), Some("1"));
        assert_eq!(peer.get("b").map(String::as_str), Some("3"));
    }

    #[test]
    fn test_garbage_lines_ignored() {
        let raw = "junk before any section = ignored\n\
                   [interface]\n\
                   # comment without equals\n\
                   no equals sign here\n\
                   address = 10.0.0.2\n";
        let config = TunnelConfig::parse(raw);
        let interface = config.interface().unwrap();
        assert_eq!(interface.len(), 1);
        assert_eq!(interface.get("address").map(String::as_str), Some("10.0.0.2"));
    }

    #[test]
    fn test_key_values_outside_sections_dropped() {
        let config = TunnelConfig::parse("privatekey = secret\n[interface]\n");
        assert!(config.interface().unwrap().is_empty());
        assert_eq!(config.sections().len(), 1);
    }

    #[test]
    fn test_empty_brackets_do_not_open_section() {
        let config = TunnelConfig::parse("[]\nkey = value\n");
        assert!(config.sections().is_empty());
    }

    #[test]
    fn test_validate_requires_both_sections() {
        let interface_only = TunnelConfig::parse("[interface]\nprivatekey = x\n");
        assert_eq!(
            interface_only.validate(),
            Err(ConfigError::MissingSection(PEER_SECTION))
        );

        let peer_only = TunnelConfig::parse("[peer]\npublickey = y\n");
        assert_eq!(
            peer_only.validate(),
            Err(ConfigError::MissingSection(INTERFACE_SECTION))
        );

        // present but empty is still unusable
        let empty_peer = TunnelConfig::parse("[interface]\nprivatekey = x\n[peer]\n");
        assert_eq!(
            empty_peer.validate(),
            Err(ConfigError::MissingSection(PEER_SECTION))
        );
    }

    #[test]
    fn test_debug_redacts_key_material() {
        let config = TunnelConfig::parse(SAMPLE);
        let debug = format!("{:?}", config);
        assert!(!debug.contains("zrA2aBgnWCgvsUYYKNxaNZrsgX5/E2s4xPsY/S42IQo="));
        assert!(debug.contains("[redacted]"));
        // public values stay visible
        assert!(debug.contains("5.6.7.8:51820"));
    }
}

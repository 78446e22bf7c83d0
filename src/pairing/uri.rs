//! Pairing URI codec.
//!
//! Format: `wc:<topic>@<version>?relay-protocol=<p>&symKey=<hex>&
//! expiryTimestamp=<unix-seconds>[&methods=a,b]`. The symkey is the
//! bootstrap secret; anyone holding the URI can decrypt the pairing
//! topic, which is why pairings only ever carry proposals, never session
//! traffic.

use std::collections::BTreeMap;
use std::fmt;

use crate::error::{Error, Result};

/// Protocol version this client speaks
pub const URI_VERSION: u32 = 2;

const URI_PREFIX: &str = "wc:";

/// A parsed pairing URI
#[derive(Debug, Clone, PartialEq)]
pub struct PairingUri {
    /// Pairing topic
    pub topic: String,
    /// Protocol version (must be 2)
    pub version: u32,
    /// Relay protocol name
    pub relay_protocol: String,
    /// Bootstrap symmetric key, hex
    pub sym_key: String,
    /// Unix seconds after which the URI must be refused
    pub expiry_timestamp: u64,
    /// Optional advertised method list
    pub methods: Vec<String>,
}

impl PairingUri {
    /// Parse a `wc:` URI
    pub fn parse(uri: &str) -> Result<Self> {
        let rest = uri
            .strip_prefix(URI_PREFIX)
            .ok_or_else(|| Error::MalformedUri("Missing wc: prefix".to_string()))?;
        // Deep-link wrappers produce wc://<topic>...
        let rest = rest.strip_prefix("//").unwrap_or(rest);

        let (address, query) = rest
            .split_once('?')
            .ok_or_else(|| Error::MalformedUri("Missing query string".to_string()))?;
        let (topic, version) = address
            .split_once('@')
            .ok_or_else(|| Error::MalformedUri("Missing version separator".to_string()))?;
        if topic.is_empty() {
            return Err(Error::MalformedUri("Empty topic".to_string()));
        }
        let version: u32 = version
            .parse()
            .map_err(|_| Error::MalformedUri(format!("Invalid version: {version}")))?;

        let params: BTreeMap<&str, &str> = query
            .split('&')
            .filter_map(|pair| pair.split_once('='))
            .collect();

        let required = |name: &str| -> Result<&str> {
            params
                .get(name)
                .copied()
                .ok_or_else(|| Error::MalformedUri(format!("Missing param: {name}")))
        };

        let sym_key = required("symKey")?.to_string();
        if sym_key.len() != 64 || !sym_key.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(Error::MalformedUri("symKey must be 32 bytes of hex".to_string()));
        }
        let expiry_timestamp = required("expiryTimestamp")?
            .parse::<u64>()
            .map_err(|_| Error::MalformedUri("Invalid expiryTimestamp".to_string()))?;
        let methods = params
            .get("methods")
            .map(|raw| raw.split(',').filter(|m| !m.is_empty()).map(str::to_string).collect())
            .unwrap_or_default();

        Ok(Self {
            topic: topic.to_string(),
            version,
            relay_protocol: required("relay-protocol")?.to_string(),
            sym_key,
            expiry_timestamp,
            methods,
        })
    }
}

impl fmt::Display for PairingUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "wc:{}@{}?relay-protocol={}&symKey={}&expiryTimestamp={}",
            self.topic, self.version, self.relay_protocol, self.sym_key, self.expiry_timestamp
        )?;
        if !self.methods.is_empty() {
            write!(f, "&methods={}", self.methods.join(","))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> PairingUri {
        PairingUri {
            topic: "a".repeat(64),
            version: 2,
            relay_protocol: "irn".to_string(),
            sym_key: "b".repeat(64),
            expiry_timestamp: 1_700_000_000,
            methods: vec![],
        }
    }

    #[test]
    fn test_round_trip() {
        let uri = sample();
        assert_eq!(PairingUri::parse(&uri.to_string()).unwrap(), uri);

        let with_methods = PairingUri {
            methods: vec!["wc_sessionPropose".into(), "wc_sessionRequest".into()],
            ..sample()
        };
        assert_eq!(PairingUri::parse(&with_methods.to_string()).unwrap(), with_methods);
    }

    #[test]
    fn test_deep_link_double_slash_accepted() {
        let uri = sample().to_string().replacen("wc:", "wc://", 1);
        assert_eq!(PairingUri::parse(&uri).unwrap().topic, "a".repeat(64));
    }

    #[test]
    fn test_rejects_malformed() {
        for bad in [
            "http://example.com",
            "wc:topic?symKey=aa",                       // no version
            &format!("wc:@2?relay-protocol=irn&symKey={}&expiryTimestamp=1", "b".repeat(64)), // empty topic
            &format!("wc:t@2?symKey={}&expiryTimestamp=1", "b".repeat(64)),   // no relay-protocol
            "wc:t@2?relay-protocol=irn&symKey=zz&expiryTimestamp=1",          // bad symkey
            &format!("wc:t@2?relay-protocol=irn&symKey={}", "b".repeat(64)),  // no expiry
        ] {
            assert!(PairingUri::parse(bad).is_err(), "should reject: {bad}");
        }
    }
}

//! Config identity: a stable digest of an environment's security and
//! resource configuration.
//!
//! The digest covers the trust level, the canonicalized capability map and
//! the resource limits. It is order-independent over capability keys and
//! insensitive to equivalent spellings of limits (`1g` == `1024m`). The full
//! SHA-256 hex digest goes into container labels; [`ConfigHash::short`]
//! (48 bits) is what humans see.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

use crate::config::LimitsConfig;
use crate::error::{Error, Result};

/// Bump when the canonical document layout changes.
const IDENTITY_VERSION: u32 = 1;

/// Hex characters kept by [`ConfigHash::short`] (12 hex = 48 bits).
pub const SHORT_HASH_LEN: usize = 12;

/// How much the platform trusts the session's workload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrustLevel {
    Untrusted,
    Standard,
    Trusted,
}

impl TrustLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrustLevel::Untrusted => "untrusted",
            TrustLevel::Standard => "standard",
            TrustLevel::Trusted => "trusted",
        }
    }
}

impl FromStr for TrustLevel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "untrusted" => Ok(TrustLevel::Untrusted),
            "standard" => Ok(TrustLevel::Standard),
            "trusted" => Ok(TrustLevel::Trusted),
            other => Err(Error::invalid_config(format!(
                "unsupported trust level '{}'",
                other
            ))),
        }
    }
}

impl fmt::Display for TrustLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resource limits as configured (human spellings).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// e.g. "512m", "1g", "268435456"
    pub memory: String,
    /// Cores, fractional allowed
    pub cpus: f64,
    pub pids: u32,
    /// Turn deadline
    pub timeout_secs: u64,
}

impl From<&LimitsConfig> for ResourceLimits {
    fn from(c: &LimitsConfig) -> Self {
        Self {
            memory: c.memory.clone(),
            cpus: c.cpus,
            pids: c.pids,
            timeout_secs: c.timeout_secs,
        }
    }
}

impl ResourceLimits {
    pub fn memory_bytes(&self) -> Result<u64> {
        parse_memory(&self.memory)
    }

    /// CPU quota in thousandths of a core.
    pub fn cpu_millis(&self) -> Result<u64> {
        if !self.cpus.is_finite() || self.cpus <= 0.0 {
            return Err(Error::invalid_config(format!(
                "cpu limit must be positive, got {}",
                self.cpus
            )));
        }
        let millis = (self.cpus * 1000.0).round() as u64;
        if millis == 0 {
            return Err(Error::invalid_config("cpu limit rounds to zero"));
        }
        Ok(millis)
    }

    pub fn validate(&self) -> Result<()> {
        self.memory_bytes()?;
        self.cpu_millis()?;
        if self.pids == 0 {
            return Err(Error::invalid_config("pids limit must be positive"));
        }
        if self.timeout_secs == 0 {
            return Err(Error::invalid_config("turn timeout must be positive"));
        }
        Ok(())
    }
}

/// Everything that determines an environment's identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SandboxProfile {
    pub trust_level: TrustLevel,
    #[serde(default)]
    pub capabilities: Map<String, Value>,
    pub limits: ResourceLimits,
}

impl SandboxProfile {
    pub fn new(trust_level: TrustLevel, limits: ResourceLimits) -> Self {
        Self {
            trust_level,
            capabilities: Map::new(),
            limits,
        }
    }

    pub fn with_capability(mut self, key: impl Into<String>, value: Value) -> Self {
        self.capabilities.insert(key.into(), value);
        self
    }

    /// Outbound network is granted only by an explicit `network: true` capability.
    pub fn network_enabled(&self) -> bool {
        matches!(self.capabilities.get("network"), Some(Value::Bool(true)))
    }

    pub fn config_hash(&self) -> Result<ConfigHash> {
        config_hash(self)
    }
}

/// Full SHA-256 digest of a [`SandboxProfile`], hex-encoded.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConfigHash(String);

impl ConfigHash {
    pub fn full(&self) -> &str {
        &self.0
    }

    /// Truncated form for names and display.
    pub fn short(&self) -> &str {
        &self.0[..SHORT_HASH_LEN.min(self.0.len())]
    }
}

impl fmt::Display for ConfigHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for ConfigHash {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Compute the identity of a profile. Pure; fails only on invalid input.
pub fn config_hash(profile: &SandboxProfile) -> Result<ConfigHash> {
    profile.limits.validate()?;

    let doc = json!({
        "v": IDENTITY_VERSION,
        "trust_level": profile.trust_level.as_str(),
        "capabilities": canonicalize(&Value::Object(profile.capabilities.clone())),
        "memory_bytes": profile.limits.memory_bytes()?,
        "cpu_millis": profile.limits.cpu_millis()?,
        "pids": profile.limits.pids,
        "timeout_secs": profile.limits.timeout_secs,
    });

    let canonical = serde_json::to_string(&canonicalize(&doc))
        .map_err(|e| Error::invalid_config(format!("unserializable profile: {}", e)))?;

    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    Ok(ConfigHash(hex_encode(&hasher.finalize())))
}

/// Recursively sort object keys and normalize scalar values. Keys are kept
/// byte-exact so distinct maps never merge.
pub fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut out = Map::new();
            for k in keys {
                out.insert(k.clone(), canonicalize(&map[k]));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        Value::String(s) => Value::String(s.trim().to_string()),
        Value::Number(n) => {
            // 2.0 and 2 mean the same limit
            match n.as_f64() {
                Some(f) if n.is_f64() && f.fract() == 0.0 && f.abs() < 9.0e15 => {
                    Value::from(f as i64)
                }
                _ => value.clone(),
            }
        }
        _ => value.clone(),
    }
}

/// Parse a memory limit ("512m", "1G", "64k", "1048576", "2gb") into bytes.
pub fn parse_memory(s: &str) -> Result<u64> {
    let trimmed = s.trim().to_ascii_lowercase();
    let trimmed = trimmed.strip_suffix('b').unwrap_or(&trimmed);
    if trimmed.is_empty() {
        return Err(Error::invalid_config(format!("invalid memory limit '{}'", s)));
    }

    let (digits, multiplier) = match trimmed.chars().last() {
        Some('k') => (&trimmed[..trimmed.len() - 1], 1u64 << 10),
        Some('m') => (&trimmed[..trimmed.len() - 1], 1u64 << 20),
        Some('g') => (&trimmed[..trimmed.len() - 1], 1u64 << 30),
        _ => (trimmed, 1u64),
    };

    let n: u64 = digits
        .trim()
        .parse()
        .map_err(|_| Error::invalid_config(format!("invalid memory limit '{}'", s)))?;

    match n.checked_mul(multiplier) {
        Some(0) | None => Err(Error::invalid_config(format!(
            "memory limit '{}' is out of range",
            s
        ))),
        Some(bytes) => Ok(bytes),
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits(memory: &str) -> ResourceLimits {
        ResourceLimits {
            memory: memory.to_string(),
            cpus: 1.0,
            pids: 256,
            timeout_secs: 300,
        }
    }

    fn profile() -> SandboxProfile {
        SandboxProfile::new(TrustLevel::Untrusted, limits("512m"))
            .with_capability("network", json!(false))
            .with_capability(
                "mcp_servers",
                json!({"search": {"url": "http://s", "timeout": 5}, "fs": {"root": "/x"}}),
            )
            .with_capability("plugins", json!(["a", "b"]))
    }

    #[test]
    fn hash_is_full_sha256_hex() {
        let hash = profile().config_hash().unwrap();
        assert_eq!(hash.full().len(), 64);
        assert!(hash.full().chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(hash.short().len(), SHORT_HASH_LEN);
        assert!(hash.full().starts_with(hash.short()));
    }

    #[test]
    fn hash_is_invariant_under_key_order() {
        let a = profile();

        let mut reordered = Map::new();
        reordered.insert("plugins".into(), json!(["a", "b"]));
        reordered.insert(
            "mcp_servers".into(),
            json!({"fs": {"root": "/x"}, "search": {"timeout": 5, "url": "http://s"}}),
        );
        reordered.insert("network".into(), json!(false));
        let b = SandboxProfile {
            capabilities: reordered,
            ..a.clone()
        };

        assert_eq!(a.config_hash().unwrap(), b.config_hash().unwrap());
    }

    #[test]
    fn identical_profiles_share_a_hash() {
        assert_eq!(
            profile().config_hash().unwrap(),
            profile().config_hash().unwrap()
        );
    }

    #[test]
    fn every_field_changes_the_hash() {
        let base = profile().config_hash().unwrap();

        let mut p = profile();
        p.limits.memory = "1g".into();
        assert_ne!(p.config_hash().unwrap(), base, "memory");

        let mut p = profile();
        p.limits.cpus = 2.0;
        assert_ne!(p.config_hash().unwrap(), base, "cpus");

        let mut p = profile();
        p.limits.timeout_secs = 301;
        assert_ne!(p.config_hash().unwrap(), base, "timeout");

        let mut p = profile();
        p.limits.pids = 512;
        assert_ne!(p.config_hash().unwrap(), base, "pids");

        let mut p = profile();
        p.trust_level = TrustLevel::Trusted;
        assert_ne!(p.config_hash().unwrap(), base, "trust level");

        let p = profile().with_capability("network", json!(true));
        assert_ne!(p.config_hash().unwrap(), base, "capability value");

        let p = profile().with_capability("plugins", json!(["b", "a"]));
        assert_ne!(p.config_hash().unwrap(), base, "array order is significant");

        let padded = profile().with_capability("tools", json!({" a": 1, "a": 2}));
        let plain = profile().with_capability("tools", json!({"a": 2}));
        assert_ne!(
            padded.config_hash().unwrap(),
            plain.config_hash().unwrap(),
            "keys differing only in whitespace"
        );
    }

    #[test]
    fn equivalent_spellings_normalize() {
        let a = SandboxProfile::new(TrustLevel::Standard, limits("1g"));
        let b = SandboxProfile::new(TrustLevel::Standard, limits("1024M"));
        assert_eq!(a.config_hash().unwrap(), b.config_hash().unwrap());

        let c = a.clone().with_capability("retries", json!(2.0));
        let d = a.clone().with_capability("retries", json!(2));
        assert_eq!(c.config_hash().unwrap(), d.config_hash().unwrap());

        let e = a.clone().with_capability("model", json!(" opus "));
        let f = a.with_capability("model", json!("opus"));
        assert_eq!(e.config_hash().unwrap(), f.config_hash().unwrap());
    }

    #[test]
    fn trust_level_parsing() {
        assert_eq!("Untrusted".parse::<TrustLevel>().unwrap(), TrustLevel::Untrusted);
        assert_eq!(" trusted ".parse::<TrustLevel>().unwrap(), TrustLevel::Trusted);
        let err = "root".parse::<TrustLevel>().unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::InvalidConfig);
    }

    #[test]
    fn invalid_limits_are_rejected() {
        for memory in ["", "abc", "0", "12q", "m"] {
            let p = SandboxProfile::new(TrustLevel::Standard, limits(memory));
            assert!(p.config_hash().is_err(), "memory {:?}", memory);
        }

        let mut p = SandboxProfile::new(TrustLevel::Standard, limits("512m"));
        p.limits.cpus = 0.0;
        assert!(p.config_hash().is_err());

        let mut p = SandboxProfile::new(TrustLevel::Standard, limits("512m"));
        p.limits.timeout_secs = 0;
        assert!(p.config_hash().is_err());
    }

    #[test]
    fn parse_memory_units() {
        assert_eq!(parse_memory("512m").unwrap(), 512 * 1024 * 1024);
        assert_eq!(parse_memory("1G").unwrap(), 1 << 30);
        assert_eq!(parse_memory("64k").unwrap(), 64 * 1024);
        assert_eq!(parse_memory("2gb").unwrap(), 2 << 30);
        assert_eq!(parse_memory("4096").unwrap(), 4096);
    }

    #[test]
    fn network_capability_gate() {
        let p = SandboxProfile::new(TrustLevel::Standard, limits("512m"));
        assert!(!p.network_enabled());
        assert!(!p.clone().with_capability("network", json!("yes")).network_enabled());
        assert!(p.with_capability("network", json!(true)).network_enabled());
    }
}

//! Versions and identity strings for agents and knowledge contracts.
//!
//! Identities follow `<Namespace>-<DOMAIN>-(AGENT|KNOWLEDGE)-V<major>[.<minor>]`,
//! e.g. `Elementum-DSA-DATA_ANALYSIS-AGENT-V1.0`.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

static IDENTITY_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^(?P<ns>[A-Za-z0-9]+(?:-[A-Za-z0-9]+)*)-(?P<domain>[A-Z0-9_]+)-(?P<kind>AGENT|KNOWLEDGE)-V(?P<version>\d+(?:\.\d+)?)$",
    )
    .expect("identity pattern is a valid regex")
});

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VersionError {
    #[error("empty version string")]
    Empty,
    #[error("invalid version '{0}': expected <major>[.<minor>]")]
    Malformed(String),
}

/// Non-negative `<major>.<minor>` version number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
}

impl Version {
    pub const fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

impl FromStr for Version {
    type Err = VersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(VersionError::Empty);
        }

        let (major, minor) = match s.split_once('.') {
            Some((major, minor)) => (major, minor),
            None => (s, "0"),
        };

        // No leading zeros: one spelling per version.
        let parse = |part: &str| -> Result<u32, VersionError> {
            if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
                return Err(VersionError::Malformed(s.to_string()));
            }
            if part.len() > 1 && part.starts_with('0') {
                return Err(VersionError::Malformed(s.to_string()));
            }
            part.parse().map_err(|_| VersionError::Malformed(s.to_string()))
        };

        Ok(Self {
            major: parse(major)?,
            minor: parse(minor)?,
        })
    }
}

impl Serialize for Version {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Version {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        // Knowledge documents carry versions both as `1.0` and `"1.0"`.
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Number(serde_json::Number),
            Text(String),
        }

        let text = match Raw::deserialize(deserializer)? {
            Raw::Number(n) => n.to_string(),
            Raw::Text(s) => s,
        };
        text.parse().map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityKind {
    Agent,
    Knowledge,
}

impl IdentityKind {
    fn tag(self) -> &'static str {
        match self {
            IdentityKind::Agent => "AGENT",
            IdentityKind::Knowledge => "KNOWLEDGE",
        }
    }
}

/// Parsed form of an agent or knowledge identity string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub namespace: String,
    pub domain_tag: String,
    pub kind: IdentityKind,
    pub version: Version,
}

impl Identity {
    pub fn parse(raw: &str) -> Option<Self> {
        let caps = IDENTITY_PATTERN.captures(raw)?;
        let kind = match &caps["kind"] {
            "AGENT" => IdentityKind::Agent,
            _ => IdentityKind::Knowledge,
        };
        Some(Self {
            namespace: caps["ns"].to_string(),
            domain_tag: caps["domain"].to_string(),
            kind,
            version: caps["version"].parse().ok()?,
        })
    }

    /// Canonical identity for an agent of `domain` at `version`.
    pub fn agent(namespace: &str, domain: &str, version: Version) -> String {
        Self::format(namespace, domain, IdentityKind::Agent, version)
    }

    /// Canonical identity for a knowledge contract of `domain` at `version`.
    pub fn knowledge(namespace: &str, domain: &str, version: Version) -> String {
        Self::format(namespace, domain, IdentityKind::Knowledge, version)
    }

    fn format(namespace: &str, domain: &str, kind: IdentityKind, version: Version) -> String {
        format!("{}-{}-{}-V{}", namespace, domain_tag(domain), kind.tag(), version)
    }
}

/// Upper-case tag used for a domain inside identity strings.
pub fn domain_tag(domain: &str) -> String {
    domain
        .chars()
        .map(|c| match c {
            '-' | ' ' | '.' => '_',
            other => other.to_ascii_uppercase(),
        })
        .collect()
}

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{Error, Result};

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Architecture {
    #[serde(rename = "x86_64")]
    X86_64,
    #[serde(rename = "arm64")]
    Arm64,
    #[serde(rename = "i386")]
    I386,
    #[serde(rename = "x86_64_mac")]
    X86_64Mac,
    #[serde(rename = "arm64_mac")]
    Arm64Mac,
}

impl Architecture {
    pub fn as_str(&self) -> &'static str {
        match self {
            Architecture::X86_64 => "x86_64",
            Architecture::Arm64 => "arm64",
            Architecture::I386 => "i386",
            Architecture::X86_64Mac => "x86_64_mac",
            Architecture::Arm64Mac => "arm64_mac",
        }
    }

    /// Maps a provider architecture tag. Unknown tags are an error: scheduling an
    /// image on the wrong architecture is worse than listing nothing.
    pub fn from_provider_tag(tag: &str) -> Result<Self> {
        match tag {
            "x86_64" => Ok(Architecture::X86_64),
            "arm64" => Ok(Architecture::Arm64),
            "i386" => Ok(Architecture::I386),
            "x86_64_mac" => Ok(Architecture::X86_64Mac),
            "arm64_mac" => Ok(Architecture::Arm64Mac),
            other => Err(Error::UnmappedArchitecture(other.to_string())),
        }
    }
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Provider-agnostic description of a compute offering.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct InstanceType {
    pub name: String,
    pub vcpus: i32,
    pub cores: i32,
    pub memory_mib: i64,
    pub architecture: Architecture,
    pub ephemeral_storage_gb: i64,
    pub supported: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_tags_map() {
        assert_eq!(Architecture::from_provider_tag("x86_64").unwrap(), Architecture::X86_64);
        assert_eq!(Architecture::from_provider_tag("arm64").unwrap(), Architecture::Arm64);
        assert_eq!(
            Architecture::from_provider_tag("arm64_mac").unwrap(),
            Architecture::Arm64Mac
        );
    }

    #[test]
    fn unknown_tag_is_an_error() {
        match Architecture::from_provider_tag("mips") {
            Err(Error::UnmappedArchitecture(tag)) => assert_eq!(tag, "mips"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn serializes_as_provider_tag() {
        let json = serde_json::to_string(&Architecture::X86_64Mac).unwrap();
        assert_eq!(json, "\"x86_64_mac\"");
    }
}

//! Endpoint identity as seen by the RTR layer.
//!
//! Host inventory lives elsewhere; the RTR operations only need a host's
//! agent id and enough platform knowledge to refuse commands that would
//! not run there.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Operating system family, as reported by the Falcon `platform_name` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Platform {
    Windows,
    Linux,
    Mac,
    /// Anything else, or not known to the caller.
    #[serde(other)]
    Unknown,
}

impl FromStr for Platform {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_ascii_lowercase().as_str() {
            "windows" | "win" => Platform::Windows,
            "linux" => Platform::Linux,
            "mac" | "macos" | "darwin" => Platform::Mac,
            _ => Platform::Unknown,
        })
    }
}

/// A managed host addressed by its Falcon agent id (AID).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub id: String,
    pub platform: Platform,
    pub hostname: Option<String>,
}

impl Endpoint {
    pub fn new(id: impl Into<String>, platform: Platform) -> Self {
        Endpoint {
            id: id.into(),
            platform,
            hostname: None,
        }
    }

    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = Some(hostname.into());
        self
    }

    pub fn is_windows(&self) -> bool {
        self.platform == Platform::Windows
    }

    pub fn is_linux(&self) -> bool {
        self.platform == Platform::Linux
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.hostname {
            Some(name) => write!(f, "{name} ({})", self.id),
            None => f.write_str(&self.id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn platform_parses_vendor_names_case_insensitively() {
        assert_eq!("Windows".parse::<Platform>().unwrap(), Platform::Windows);
        assert_eq!("LINUX".parse::<Platform>().unwrap(), Platform::Linux);
        assert_eq!("Mac".parse::<Platform>().unwrap(), Platform::Mac);
        assert_eq!("Solaris".parse::<Platform>().unwrap(), Platform::Unknown);
    }

    #[test]
    fn predicates_follow_platform() {
        let win = Endpoint::new("aid-1", Platform::Windows);
        assert!(win.is_windows());
        assert!(!win.is_linux());
        let nix = Endpoint::new("aid-2", Platform::Linux);
        assert!(nix.is_linux());
    }

    #[test]
    fn display_prefers_hostname() {
        let e = Endpoint::new("aid-1", Platform::Windows).with_hostname("WS-042");
        assert_eq!(e.to_string(), "WS-042 (aid-1)");
        assert_eq!(Endpoint::new("aid-2", Platform::Linux).to_string(), "aid-2");
    }
}

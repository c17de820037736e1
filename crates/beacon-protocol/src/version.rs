//! Protocol versioning for Beacon.
//!
//! Clients announce the versions they speak in the CONNECT
//! `accept-version` header; the server picks the highest common one.

use std::fmt;
use std::str::FromStr;

/// Highest protocol version the server speaks.
pub const PROTOCOL_VERSION: Version = Version { major: 1, minor: 2 };

/// Every version the server accepts, lowest first.
pub const SUPPORTED_VERSIONS: [Version; 3] = [
    Version::new(1, 0),
    Version::new(1, 1),
    Version::new(1, 2),
];

/// Protocol version information.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Version {
    /// Major version - breaking changes increment this.
    pub major: u8,
    /// Minor version - backwards-compatible changes increment this.
    pub minor: u8,
}

impl Version {
    /// Create a new version.
    #[must_use]
    pub const fn new(major: u8, minor: u8) -> Self {
        Self { major, minor }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

impl FromStr for Version {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (major, minor) = s.trim().split_once('.').ok_or("Missing minor version")?;
        let major = major.parse().map_err(|_| "Invalid major version")?;
        let minor = minor.parse().map_err(|_| "Invalid minor version")?;
        Ok(Version::new(major, minor))
    }
}

impl Default for Version {
    fn default() -> Self {
        PROTOCOL_VERSION
    }
}

/// Pick the highest supported version from an `accept-version` header.
///
/// A missing header means the client only speaks 1.0. Returns `None`
/// when there is no common version.
#[must_use]
pub fn negotiate(accept_version: Option<&str>) -> Option<Version> {
    let Some(offered) = accept_version else {
        return Some(Version::new(1, 0));
    };

    offered
        .split(',')
        .filter_map(|v| v.parse::<Version>().ok())
        .filter(|v| SUPPORTED_VERSIONS.contains(v))
        .max()
}

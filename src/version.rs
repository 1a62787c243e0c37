// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Cluster and driver version values.
//!
//! [`ClusterVersion`] gates features and selects the registration API shape.
//! [`DriverVersion`] is what the version probe extracts from the driver image.

use crate::constants::MIN_DRIVER_VERSION;
use crate::errors::SetupError;
use k8s_openapi::apimachinery::pkg::version::Info;

/// Major/minor version of the target Kubernetes cluster.
///
/// Ordering is numeric on `(major, minor)`, so `1.9 < 1.18 < 2.0`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ClusterVersion {
    pub major: u32,
    pub minor: u32,
}

impl ClusterVersion {
    #[must_use]
    pub const fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }

    /// Parse the `major`/`minor` strings reported by the API server.
    ///
    /// Managed distributions report values such as `"21+"`; only the leading
    /// digits are significant.
    ///
    /// # Errors
    ///
    /// Returns [`SetupError::ClusterVersion`] when either component has no leading digits.
    pub fn parse(major: &str, minor: &str) -> Result<Self, SetupError> {
        Ok(Self {
            major: leading_number(major).ok_or_else(|| {
                SetupError::ClusterVersion(format!("invalid major version {major:?}"))
            })?,
            minor: leading_number(minor).ok_or_else(|| {
                SetupError::ClusterVersion(format!("invalid minor version {minor:?}"))
            })?,
        })
    }

    /// Build from the API server's `/version` response.
    ///
    /// # Errors
    ///
    /// Returns [`SetupError::ClusterVersion`] if the response is not numeric.
    pub fn from_info(info: &Info) -> Result<Self, SetupError> {
        Self::parse(&info.major, &info.minor)
    }

    /// True when this version is at or above `major.minor`.
    #[must_use]
    pub fn at_least(&self, major: u32, minor: u32) -> bool {
        *self >= Self::new(major, minor)
    }

    /// True when this version is at or below `major.minor`.
    #[must_use]
    pub fn at_most(&self, major: u32, minor: u32) -> bool {
        *self <= Self::new(major, minor)
    }
}

impl std::fmt::Display for ClusterVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

fn leading_number(raw: &str) -> Option<u32> {
    let digits: String = raw
        .trim()
        .chars()
        .take_while(char::is_ascii_digit)
        .collect();
    digits.parse().ok()
}

/// Semantic version of the Ceph CSI driver image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DriverVersion {
    pub major: u32,
    pub minor: u32,
    pub bugfix: u32,
}

/// Prefix of the line carrying the version in `cephcsi --version` output
const VERSION_LINE_PREFIX: &str = "cephcsi version:";

impl DriverVersion {
    #[must_use]
    pub const fn new(major: u32, minor: u32, bugfix: u32) -> Self {
        Self {
            major,
            minor,
            bugfix,
        }
    }

    /// Oldest release the operator deploys.
    #[must_use]
    pub const fn minimum() -> Self {
        Self::new(
            MIN_DRIVER_VERSION.0,
            MIN_DRIVER_VERSION.1,
            MIN_DRIVER_VERSION.2,
        )
    }

    /// Extract the version from `cephcsi --version` output.
    ///
    /// The driver prints several lines; the relevant one looks like
    /// `Cephcsi Version: v3.6.0`. Returns `None` if no such line parses.
    #[must_use]
    pub fn extract(output: &str) -> Option<Self> {
        output.lines().find_map(|line| {
            let line = line.trim();
            let lowered = line.to_ascii_lowercase();
            let rest = lowered.strip_prefix(VERSION_LINE_PREFIX)?;
            Self::parse(rest.trim())
        })
    }

    /// Parse `vX.Y.Z` or `X.Y.Z`, ignoring any pre-release or build suffix.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.strip_prefix('v').unwrap_or(raw);
        let core: String = raw
            .chars()
            .take_while(|c| c.is_ascii_digit() || *c == '.')
            .collect();
        let mut parts = core.split('.');
        let major = parts.next()?.parse().ok()?;
        let minor = parts.next()?.parse().ok()?;
        let bugfix = parts.next()?.parse().ok()?;
        Some(Self::new(major, minor, bugfix))
    }

    /// True when this release is at or above [`DriverVersion::minimum`].
    #[must_use]
    pub fn is_supported(&self) -> bool {
        *self >= Self::minimum()
    }
}

impl std::fmt::Display for DriverVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "v{}.{}.{}", self.major, self.minor, self.bugfix)
    }
}

#[cfg(test)]
#[path = "version_tests.rs"]
mod version_tests;

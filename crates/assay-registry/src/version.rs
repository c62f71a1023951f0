//! Semantic versions for algorithm manifests
//!
//! Ordering follows semantic-version precedence: numeric core first, and a
//! pre-release sorts below the release it precedes.

use crate::error::RegistryError;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// `MAJOR.MINOR.PATCH[-PRE]`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Version {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
    pub pre: Option<String>,
}

impl Version {
    /// Release version without pre-release tag
    #[inline]
    #[must_use]
    pub const fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self {
            major,
            minor,
            patch,
            pre: None,
        }
    }

    /// With pre-release tag
    #[inline]
    #[must_use]
    pub fn with_pre(mut self, pre: impl Into<String>) -> Self {
        self.pre = Some(pre.into());
        self
    }

    /// Same major version and at least as new
    #[must_use]
    pub fn is_compatible_with(&self, required: &Version) -> bool {
        self.major == required.major && self >= required
    }
}

impl FromStr for Version {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || RegistryError::InvalidVersion(s.to_string());
        let trimmed = s.trim().trim_start_matches('v');

        let (core, pre) = match trimmed.split_once('-') {
            Some((core, pre)) if !pre.is_empty() => (core, Some(pre.to_string())),
            Some(_) => return Err(invalid()),
            None => (trimmed, None),
        };

        let mut parts = core.split('.');
        let mut next = || -> Result<u64, RegistryError> {
            parts
                .next()
                .filter(|p| !p.is_empty())
                .and_then(|p| p.parse().ok())
                .ok_or_else(invalid)
        };
        let major = next()?;
        let minor = next()?;
        let patch = next()?;
        if parts.next().is_some() {
            return Err(invalid());
        }

        Ok(Self {
            major,
            minor,
            patch,
            pre,
        })
    }
}

impl TryFrom<String> for Version {
    type Error = RegistryError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Version> for String {
    fn from(value: Version) -> Self {
        value.to_string()
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)?;
        if let Some(pre) = &self.pre {
            write!(f, "-{pre}")?;
        }
        Ok(())
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.major, self.minor, self.patch)
            .cmp(&(other.major, other.minor, other.patch))
            .then_with(|| match (&self.pre, &other.pre) {
                (None, None) => Ordering::Equal,
                (None, Some(_)) => Ordering::Greater,
                (Some(_), None) => Ordering::Less,
                (Some(a), Some(b)) => compare_pre(a, b),
            })
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Dot-separated identifiers: numeric ones compare numerically and sort
/// below alphanumeric ones; a shorter prefix sorts first.
fn compare_pre(a: &str, b: &str) -> Ordering {
    let mut left = a.split('.');
    let mut right = b.split('.');
    loop {
        match (left.next(), right.next()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(x), Some(y)) => {
                let ord = match (x.parse::<u64>(), y.parse::<u64>()) {
                    (Ok(x), Ok(y)) => x.cmp(&y),
                    (Ok(_), Err(_)) => Ordering::Less,
                    (Err(_), Ok(_)) => Ordering::Greater,
                    (Err(_), Err(_)) => x.cmp(y),
                };
                if ord != Ordering::Equal {
                    return ord;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn parse_release() {
        let v: Version = "0.1.3".parse().unwrap();
        assert_eq!(v, Version::new(0, 1, 3));
        assert_eq!(v.to_string(), "0.1.3");
    }

    #[test]
    fn parse_prerelease_and_leading_v() {
        let v: Version = "v2.0.0-rc.1".parse().unwrap();
        assert_eq!(v, Version::new(2, 0, 0).with_pre("rc.1"));
    }

    #[test]
    fn parse_rejects_garbage() {
        for bad in ["", "1", "1.2", "1.2.3.4", "a.b.c", "1.2.3-", "1..3"] {
            assert!(bad.parse::<Version>().is_err(), "{bad} should not parse");
        }
    }

    #[test]
    fn ordering_is_numeric_not_lexical() {
        let a: Version = "1.10.0".parse().unwrap();
        let b: Version = "1.9.7".parse().unwrap();
        assert!(a > b);
    }

    #[test]
    fn prerelease_sorts_below_release() {
        let rc: Version = "1.0.0-rc.2".parse().unwrap();
        let alpha: Version = "1.0.0-alpha".parse().unwrap();
        let release = Version::new(1, 0, 0);
        assert!(rc < release);
        assert!(rc.cmp(&Version::new(1, 0, 0).with_pre("rc.10")) == Ordering::Less);
        assert!(alpha > Version::new(1, 0, 0).with_pre("1"));
    }

    #[test]
    fn compatibility_requires_same_major() {
        let installed = Version::new(1, 4, 0);
        assert!(installed.is_compatible_with(&Version::new(1, 2, 0)));
        assert!(!installed.is_compatible_with(&Version::new(1, 5, 0)));
        assert!(!installed.is_compatible_with(&Version::new(0, 4, 0)));
    }

    #[test]
    fn serde_as_string() {
        let json = serde_json::to_string(&Version::new(3, 2, 1)).unwrap();
        assert_eq!(json, "\"3.2.1\"");
        let back: Version = serde_json::from_str(&json).unwrap();
        assert_eq!(back, Version::new(3, 2, 1));
    }

    proptest! {
        #[test]
        fn prop_display_parse_is_identity(
            major in 0u64..1000,
            minor in 0u64..1000,
            patch in 0u64..1000,
        ) {
            let v = Version::new(major, minor, patch);
            let parsed: Version = v.to_string().parse().unwrap();
            prop_assert_eq!(parsed, v);
        }
    }
}

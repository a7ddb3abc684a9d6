//! Repository and tag names

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{RegistryError, RegistryResult};

const MAX_NAME_LEN: usize = 255;
const MAX_TAG_LEN: usize = 128;

fn lower_alnum(b: u8) -> bool {
    b.is_ascii_lowercase() || b.is_ascii_digit()
}

/// `[a-z0-9]+` runs joined by one `.`, one or two `_`, or any number of `-`.
fn valid_component(component: &str) -> bool {
    let bytes = component.as_bytes();
    let (Some(&first), Some(&last)) = (bytes.first(), bytes.last()) else {
        return false;
    };
    if !lower_alnum(first) || !lower_alnum(last) {
        return false;
    }

    let mut rest = component;
    while let Some(start) = rest.find(|c: char| !c.is_ascii_lowercase() && !c.is_ascii_digit()) {
        let tail = &rest[start..];
        let end = tail
            .find(|c: char| c.is_ascii_lowercase() || c.is_ascii_digit())
            .unwrap_or(tail.len());
        let separator = &tail[..end];
        let valid = matches!(separator, "." | "_" | "__") || separator.bytes().all(|b| b == b'-');
        if !valid {
            return false;
        }
        rest = &tail[end..];
    }
    true
}

/// A validated repository name, like `library/ubuntu`.
///
/// Components are lowercase alphanumeric runs separated by `/`. A name never
/// starts a component with `_`, so it cannot collide with the registry's own
/// directories.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RepositoryName(String);

impl RepositoryName {
    /// Validate a repository name.
    pub fn new(name: impl Into<String>) -> RegistryResult<Self> {
        let name = name.into();
        if name.len() > MAX_NAME_LEN || !name.split('/').all(valid_component) {
            return Err(RegistryError::InvalidRepository(name));
        }
        Ok(Self(name))
    }

    /// The name as a string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether `self` equals `prefix` or is nested below it.
    pub fn starts_with(&self, prefix: &RepositoryName) -> bool {
        self.0
            .strip_prefix(prefix.as_str())
            .is_some_and(|rest| rest.is_empty() || rest.starts_with('/'))
    }
}

impl fmt::Display for RepositoryName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for RepositoryName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl FromStr for RepositoryName {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for RepositoryName {
    type Error = RegistryError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<RepositoryName> for String {
    fn from(value: RepositoryName) -> Self {
        value.0
    }
}

/// Check a tag name: `[A-Za-z0-9_][A-Za-z0-9_.-]*`, at most 128 characters.
pub fn check_tag(tag: &str) -> RegistryResult<()> {
    let valid = tag.len() <= MAX_TAG_LEN
        && tag
            .bytes()
            .next()
            .is_some_and(|b| b.is_ascii_alphanumeric() || b == b'_')
        && tag
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'.' | b'-'));

    if valid {
        Ok(())
    } else {
        Err(RegistryError::InvalidTag(tag.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repository_names() {
        for name in [
            "ubuntu",
            "library/ubuntu",
            "a/b/c",
            "foo.bar",
            "foo_bar",
            "foo__bar",
            "foo---bar",
            "0",
        ] {
            assert!(RepositoryName::new(name).is_ok(), "{name:?} should be valid");
        }

        for name in [
            "",
            "Ubuntu",
            "/ubuntu",
            "ubuntu/",
            "a//b",
            "_layers",
            "a/_manifests",
            "foo..bar",
            "foo___bar",
            "foo.-bar",
            "-foo",
            "foo-",
            "a/../b",
            "foo bar",
        ] {
            assert!(
                matches!(RepositoryName::new(name), Err(RegistryError::InvalidRepository(_))),
                "{name:?} should be invalid"
            );
        }

        assert!(RepositoryName::new("a".repeat(256)).is_err());
    }

    #[test]
    fn prefix_matching() {
        let library: RepositoryName = "library".parse().unwrap();
        assert!(RepositoryName::new("library").unwrap().starts_with(&library));
        assert!(RepositoryName::new("library/ubuntu").unwrap().starts_with(&library));
        assert!(!RepositoryName::new("library-extra").unwrap().starts_with(&library));
        assert!(!RepositoryName::new("lib").unwrap().starts_with(&library));
    }

    #[test]
    fn tags() {
        let longest = "a".repeat(128);
        let too_long = "a".repeat(129);
        for tag in ["latest", "v1.0.0", "_private", "Release-2024_01", longest.as_str()] {
            assert!(check_tag(tag).is_ok(), "{tag:?} should be valid");
        }
        for tag in ["", ".hidden", "-dash", "a/b", "a:b", too_long.as_str()] {
            assert!(check_tag(tag).is_err(), "{tag:?} should be invalid");
        }
    }
}

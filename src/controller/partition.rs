//! Partition identity.
//!
//! Stored partitions are addressed by a plain string name `<kind>-<version>`,
//! but everywhere else a partition is a [`PartitionName`]: a kind plus a version
//! tag. Deciding whether a stored partition belongs to the running controller is
//! a structural comparison, not a string scan.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PartitionKind {
  /// Static shell resources, served cache-first.
  AppShell,
  /// Remote-data API responses, served stale-while-revalidate.
  AppData,
  /// Images, served stale-while-revalidate.
  ImageCache,
}

impl PartitionKind {
  pub const ALL: [PartitionKind; 3] = [Self::AppShell, Self::AppData, Self::ImageCache];

  pub fn as_str(self) -> &'static str {
    match self {
      Self::AppShell => "app-shell",
      Self::AppData => "app-data",
      Self::ImageCache => "image-cache",
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PartitionName {
  pub kind: PartitionKind,
  pub version: String,
}

impl PartitionName {
  pub fn new(kind: PartitionKind, version: impl Into<String>) -> Self {
    Self {
      kind,
      version: version.into(),
    }
  }

  /// Parse a stored name. Names that do not follow `<kind>-<version>` yield `None`.
  pub fn parse(name: &str) -> Option<Self> {
    PartitionKind::ALL.into_iter().find_map(|kind| {
      name
        .strip_prefix(kind.as_str())
        .and_then(|rest| rest.strip_prefix('-'))
        .filter(|version| !version.is_empty())
        .map(|version| Self::new(kind, version))
    })
  }
}

impl fmt::Display for PartitionName {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}-{}", self.kind.as_str(), self.version)
  }
}

/// The partitions owned by one controller version.
#[derive(Debug, Clone)]
pub struct PartitionSet {
  version: String,
}

impl PartitionSet {
  pub fn new(version: impl Into<String>) -> Self {
    Self {
      version: version.into(),
    }
  }

  pub fn version(&self) -> &str {
    &self.version
  }

  pub fn name(&self, kind: PartitionKind) -> PartitionName {
    PartitionName::new(kind, self.version.clone())
  }

  /// Whether a stored partition name is one of the live partitions.
  pub fn is_current(&self, stored: &str) -> bool {
    PartitionName::parse(stored).is_some_and(|name| name.version == self.version)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_parse_known_kinds() {
    for kind in PartitionKind::ALL {
      let name = PartitionName::new(kind, "v7");
      assert_eq!(PartitionName::parse(&name.to_string()), Some(name));
    }
  }

  #[test]
  fn test_parse_rejects_foreign_names() {
    assert_eq!(PartitionName::parse("app-shell"), None);
    assert_eq!(PartitionName::parse("app-shell-"), None);
    assert_eq!(PartitionName::parse("workbox-precache-v2"), None);
    assert_eq!(PartitionName::parse("app-shellv2"), None);
  }

  #[test]
  fn test_version_with_dashes() {
    let parsed = PartitionName::parse("image-cache-2024-06-01").unwrap();
    assert_eq!(parsed.kind, PartitionKind::ImageCache);
    assert_eq!(parsed.version, "2024-06-01");
  }

  #[test]
  fn test_is_current() {
    let set = PartitionSet::new("v2");
    assert!(set.is_current("app-shell-v2"));
    assert!(set.is_current("app-data-v2"));
    assert!(set.is_current("image-cache-v2"));
    assert!(!set.is_current("app-shell-v1"));
    assert!(!set.is_current("static-v2"));
  }
}

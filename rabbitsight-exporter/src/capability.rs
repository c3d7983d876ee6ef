//! Optional behaviour flags resolved once from configuration.

use std::collections::BTreeSet;
use std::fmt;

use crate::config::ConfigError;

/// A named optional behaviour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Capability {
    /// Keep the upstream order of entities instead of sorting by name.
    NoSort,
    /// Ask the broker for BERT-encoded payloads instead of JSON.
    Bert,
}

impl Capability {
    pub const ALL: [Capability; 2] = [Capability::NoSort, Capability::Bert];

    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::NoSort => "no_sort",
            Capability::Bert => "bert",
        }
    }
}

impl std::str::FromStr for Capability {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Capability::ALL
            .into_iter()
            .find(|cap| cap.as_str() == s)
            .ok_or_else(|| ConfigError::UnknownCapability(s.to_string()))
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The set of enabled capabilities.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapabilitySet(BTreeSet<Capability>);

impl CapabilitySet {
    /// Parse a comma separated list such as `"no_sort,bert"`.
    ///
    /// Blank entries are ignored; unknown names are rejected.
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        raw.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::parse)
            .collect::<Result<BTreeSet<_>, _>>()
            .map(CapabilitySet)
    }

    pub fn contains(&self, cap: Capability) -> bool {
        self.0.contains(&cap)
    }

    /// Whether entity-scoped samples must be emitted in name order.
    pub fn stable_ordering(&self) -> bool {
        !self.contains(Capability::NoSort)
    }

    pub fn iter(&self) -> impl Iterator<Item = Capability> + '_ {
        self.0.iter().copied()
    }
}

impl FromIterator<Capability> for CapabilitySet {
    fn from_iter<I: IntoIterator<Item = Capability>>(iter: I) -> Self {
        CapabilitySet(iter.into_iter().collect())
    }
}

impl fmt::Display for CapabilitySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.0.iter().map(Capability::as_str).collect();
        f.write_str(&names.join(","))
    }
}

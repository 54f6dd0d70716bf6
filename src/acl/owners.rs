use std::collections::{BTreeMap, BTreeSet};

use anyhow::{Context as _, Result};
use serde::Deserialize;

#[derive(Debug, Default, Deserialize)]
struct OwnersFile {
    #[serde(default)]
    approvers: Vec<String>,
    #[serde(default)]
    reviewers: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
struct OwnersAliasesFile {
    #[serde(default)]
    aliases: BTreeMap<String, Vec<String>>,
}

/// Logins recognized as approvers or reviewers in `OWNERS`, with
/// `OWNERS_ALIASES` expanded. Expansion is one pass; cycles are broken by
/// visiting each alias at most once (spec §4.3/§9).
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct OwnersSet {
    logins: BTreeSet<String>,
}

impl OwnersSet {
    pub fn contains(&self, login: &str) -> bool {
        self.logins.contains(&login.to_lowercase())
    }

    pub fn parse(owners_yaml: &[u8], aliases_yaml: Option<&[u8]>) -> Result<Self> {
        let owners: OwnersFile =
            serde_yaml::from_slice(owners_yaml).with_context(|| "failed to parse OWNERS file")?;
        let aliases: OwnersAliasesFile = match aliases_yaml {
            Some(bytes) => serde_yaml::from_slice(bytes).with_context(|| "failed to parse OWNERS_ALIASES file")?,
            None => OwnersAliasesFile::default(),
        };

        let mut logins = BTreeSet::new();
        for entry in owners.approvers.iter().chain(owners.reviewers.iter()) {
            expand(entry, &aliases.aliases, &mut BTreeSet::new(), &mut logins);
        }
        Ok(Self { logins })
    }
}

/// Resolves `entry` into concrete logins, expanding aliases one pass deep
/// with a visited set to guard against cyclic alias references.
fn expand(
    entry: &str,
    aliases: &BTreeMap<String, Vec<String>>,
    visited: &mut BTreeSet<String>,
    out: &mut BTreeSet<String>,
) {
    let lower = entry.to_lowercase();
    if !visited.insert(lower.clone()) {
        return;
    }
    match aliases.get(entry) {
        Some(members) => {
            for member in members {
                expand(member, aliases, visited, out);
            }
        }
        None => {
            out.insert(lower);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn recognizes_approvers_and_reviewers() {
        let owners = b"approvers:\n  - alice\nreviewers:\n  - bob\n";
        let set = OwnersSet::parse(owners, None).unwrap();
        assert!(set.contains("alice"));
        assert!(set.contains("BOB"));
        assert!(!set.contains("carol"));
    }

    #[test]
    fn expands_aliases_one_pass() {
        let owners = b"approvers:\n  - team-a\n";
        let aliases = b"aliases:\n  team-a:\n    - alice\n    - bob\n";
        let set = OwnersSet::parse(owners, Some(aliases)).unwrap();
        assert!(set.contains("alice"));
        assert!(set.contains("bob"));
    }

    #[test]
    fn alias_cycle_terminates() {
        let owners = b"approvers:\n  - team-a\n";
        let aliases = b"aliases:\n  team-a:\n    - team-b\n  team-b:\n    - team-a\n    - carol\n";
        let set = OwnersSet::parse(owners, Some(aliases)).unwrap();
        assert!(set.contains("carol"));
    }
}

//! The immutable allow/replace/deny ruleset that governs one direction of
//! traffic through a [`crate::session::Session`].

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

/// Which side originated a line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Client to upstream (the control daemon).
    ClientToUpstream,
    /// Upstream (the control daemon) to client.
    UpstreamToClient,
}

/// The four rule collections that apply to a single [`Direction`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectionalRules {
    /// Exact line strings that pass through unchanged.
    #[serde(default)]
    pub allowed: BTreeSet<String>,
    /// Prefixes; any line starting with one passes through unchanged.
    ///
    /// Kept as a `Vec` (not a set) so that iteration order is stable and
    /// reproducible, matching the spec's requirement that prefix evaluation
    /// order be deterministic within a run.
    #[serde(default)]
    pub allowed_prefixes: Vec<String>,
    /// Exact line string -> substitute line string.
    #[serde(default)]
    pub replacements: BTreeMap<String, String>,
    /// Prefix -> substitute line string. The *entire* line is replaced.
    #[serde(default)]
    pub replacement_prefixes: BTreeMap<String, String>,
}

/// The immutable, per-process ruleset controlling both directions of a
/// filtered control-port session.
///
/// Built once (via [`Policy::from_config`]) and shared by `Arc` with every
/// [`crate::session::Session`]; never mutated afterward.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Policy {
    client_to_upstream: DirectionalRules,
    upstream_to_client: DirectionalRules,
}

impl Policy {
    /// Construct a `Policy` from its two directional rulesets.
    pub fn new(client_to_upstream: DirectionalRules, upstream_to_client: DirectionalRules) -> Self {
        Policy {
            client_to_upstream,
            upstream_to_client,
        }
    }

    /// Return the rules governing `dir`.
    pub fn rules(&self, dir: Direction) -> &DirectionalRules {
        match dir {
            Direction::ClientToUpstream => &self.client_to_upstream,
            Direction::UpstreamToClient => &self.upstream_to_client,
        }
    }
}

/// The outcome of evaluating one line against a [`Policy`] in a given
/// [`Direction`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// The line passes through unchanged.
    PassThrough,
    /// The line is replaced with the given substitute.
    Replace(String),
    /// The line is denied; no bytes reach the far side.
    Deny,
}

/// Evaluate `line` against `policy` for `dir`, in the fixed order:
/// prefix-replace, exact-replace, exact-allow, prefix-allow, deny. The
/// first match wins.
pub fn evaluate(policy: &Policy, dir: Direction, line: &str) -> Verdict {
    let rules = policy.rules(dir);

    for (prefix, substitute) in &rules.replacement_prefixes {
        if line.starts_with(prefix.as_str()) {
            return Verdict::Replace(substitute.clone());
        }
    }
    if let Some(substitute) = rules.replacements.get(line) {
        return Verdict::Replace(substitute.clone());
    }
    if rules.allowed.contains(line) {
        return Verdict::PassThrough;
    }
    if rules.allowed_prefixes.iter().any(|p| line.starts_with(p.as_str())) {
        return Verdict::PassThrough;
    }
    Verdict::Deny
}

#[cfg(test)]
mod test {
    use super::*;

    fn rules_with(
        allowed: &[&str],
        allowed_prefixes: &[&str],
        replacements: &[(&str, &str)],
        replacement_prefixes: &[(&str, &str)],
    ) -> DirectionalRules {
        DirectionalRules {
            allowed: allowed.iter().map(|s| s.to_string()).collect(),
            allowed_prefixes: allowed_prefixes.iter().map(|s| s.to_string()).collect(),
            replacements: replacements
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            replacement_prefixes: replacement_prefixes
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    #[test]
    fn exact_allow_passes_through() {
        let rules = rules_with(&["GETINFO version"], &[], &[], &[]);
        let policy = Policy::new(rules, DirectionalRules::default());
        assert_eq!(
            evaluate(&policy, Direction::ClientToUpstream, "GETINFO version"),
            Verdict::PassThrough
        );
    }

    #[test]
    fn unmatched_line_is_denied() {
        let policy = Policy::default();
        assert_eq!(
            evaluate(&policy, Direction::ClientToUpstream, "SIGNAL SHUTDOWN"),
            Verdict::Deny
        );
    }

    #[test]
    fn prefix_allow_passes_through() {
        let rules = rules_with(&[], &["GETINFO "], &[], &[]);
        let policy = Policy::new(rules, DirectionalRules::default());
        assert_eq!(
            evaluate(&policy, Direction::ClientToUpstream, "GETINFO version"),
            Verdict::PassThrough
        );
    }

    #[test]
    fn exact_replacement_wins_over_exact_allow() {
        // Same line can't be in both `allowed` and `replacements` in a sane
        // policy, but if it somehow were, replacement must win.
        let rules = rules_with(
            &["250-SocksPort=127.0.0.1:9050"],
            &[],
            &[("250-SocksPort=127.0.0.1:9050", "250-SocksPort=127.0.0.1:9150")],
            &[],
        );
        let policy = Policy::new(DirectionalRules::default(), rules);
        assert_eq!(
            evaluate(
                &policy,
                Direction::UpstreamToClient,
                "250-SocksPort=127.0.0.1:9050"
            ),
            Verdict::Replace("250-SocksPort=127.0.0.1:9150".to_string())
        );
    }

    #[test]
    fn prefix_replacement_wins_over_broad_prefix_allow() {
        let rules = rules_with(
            &[],
            &["250-"],
            &[],
            &[("250-SocksPort=", "250-SocksPort=127.0.0.1:9150")],
        );
        let policy = Policy::new(DirectionalRules::default(), rules);
        assert_eq!(
            evaluate(
                &policy,
                Direction::UpstreamToClient,
                "250-SocksPort=127.0.0.1:9050"
            ),
            Verdict::Replace("250-SocksPort=127.0.0.1:9150".to_string())
        );
    }

    #[test]
    fn prefix_replacement_outranks_exact_replacement() {
        let rules = rules_with(
            &[],
            &[],
            &[("AB", "exact-wins")],
            &[("A", "prefix-wins")],
        );
        let policy = Policy::new(rules, DirectionalRules::default());
        assert_eq!(
            evaluate(&policy, Direction::ClientToUpstream, "AB"),
            Verdict::Replace("prefix-wins".to_string())
        );
    }

    #[test]
    fn empty_line_matches_empty_string_allow_entry() {
        let rules = rules_with(&[""], &[], &[], &[]);
        let policy = Policy::new(rules, DirectionalRules::default());
        assert_eq!(
            evaluate(&policy, Direction::ClientToUpstream, ""),
            Verdict::PassThrough
        );
    }

    #[test]
    fn empty_line_denied_without_explicit_rule() {
        let policy = Policy::default();
        assert_eq!(
            evaluate(&policy, Direction::ClientToUpstream, ""),
            Verdict::Deny
        );
    }

    #[test]
    fn directions_are_independent() {
        let rules = rules_with(&["GETINFO version"], &[], &[], &[]);
        let policy = Policy::new(rules, DirectionalRules::default());
        assert_eq!(
            evaluate(&policy, Direction::UpstreamToClient, "GETINFO version"),
            Verdict::Deny
        );
    }

    #[test]
    fn policy_round_trips_through_toml() {
        let rules = rules_with(
            &["GETINFO version"],
            &["GETINFO "],
            &[("A", "B")],
            &[("C", "D")],
        );
        let policy = Policy::new(rules.clone(), rules);
        let doc = crate::cfg::PolicyDoc::from_policy(&policy);
        let toml_text = toml::to_string(&doc).unwrap();
        let parsed: crate::cfg::PolicyDoc = toml::from_str(&toml_text).unwrap();
        assert_eq!(parsed.into_policy(), policy);
    }
}

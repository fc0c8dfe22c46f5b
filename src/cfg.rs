//! Configuration for `tor-ctl-filter`.
//!
//! The on-disk format is a single TOML document; see
//! [`ARTI_EXAMPLE_CONFIG`]-style documentation in the project README for a
//! worked example. Unlike the rest of the Arti family, this crate does not
//! pull in the layered `tor-config` source-resolution machinery: one file,
//! loaded once at startup, is all the policy model in §2a of the spec asks
//! for.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::policy::{DirectionalRules, Policy};

/// Default authentication-phase deadline, in seconds.
const DEFAULT_AUTH_TIMEOUT_SECS: u64 = 10;

/// Default console tracing filter.
const DEFAULT_CONSOLE_FILTER: &str = "info";

/// Where the client-facing listener binds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenTarget {
    /// A TCP socket address.
    Tcp(String),
    /// A unix-domain socket path.
    Unix(PathBuf),
}

/// Where the upstream control daemon can be reached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpstreamTarget {
    /// A TCP socket address (typically `127.0.0.1:<port>`).
    Tcp(String),
    /// A unix-domain socket path (the daemon's preferred control socket).
    Unix(PathBuf),
}

/// Parse a `listen`/`upstream` address string.
///
/// `unix:<path>` denotes a filesystem socket; anything else is taken to be
/// a `host:port` TCP address and is not further validated here (resolution
/// happens at bind/connect time, where a bad address surfaces naturally).
fn parse_target(raw: &str) -> Result<(bool, String), Error> {
    if let Some(path) = raw.strip_prefix("unix:") {
        if path.is_empty() {
            return Err(Error::ConfigInvalid(format!(
                "empty unix socket path in {raw:?}"
            )));
        }
        Ok((true, path.to_string()))
    } else {
        if raw.is_empty() {
            return Err(Error::ConfigInvalid("empty address".to_string()));
        }
        Ok((false, raw.to_string()))
    }
}

impl ListenTarget {
    fn parse(raw: &str) -> Result<Self, Error> {
        match parse_target(raw)? {
            (true, path) => Ok(ListenTarget::Unix(PathBuf::from(path))),
            (false, addr) => Ok(ListenTarget::Tcp(addr)),
        }
    }
}

impl UpstreamTarget {
    fn parse(raw: &str) -> Result<Self, Error> {
        match parse_target(raw)? {
            (true, path) => Ok(UpstreamTarget::Unix(PathBuf::from(path))),
            (false, addr) => Ok(UpstreamTarget::Tcp(addr)),
        }
    }
}

/// Logging options, resolved from the `[logging]` table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingConfig {
    /// Tracing filter directives for the console layer.
    pub console: String,
    /// Optional path to a rotating logfile.
    pub file: Option<PathBuf>,
    /// If true, disable redaction of matched line contents in logs.
    ///
    /// Cookies, nonces, and derived hashes are never logged regardless of
    /// this setting; see §2b/§9 of the specification.
    pub log_sensitive_information: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            console: DEFAULT_CONSOLE_FILTER.to_string(),
            file: None,
            log_sensitive_information: false,
        }
    }
}

/// The fully resolved, validated configuration for one run of the proxy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    /// Where the client-facing listener binds.
    pub listen: ListenTarget,
    /// Where the upstream control daemon is reached.
    pub upstream: UpstreamTarget,
    /// The filtering policy.
    pub policy: Policy,
    /// Logging configuration.
    pub logging: LoggingConfig,
    /// Authentication-phase deadline.
    pub auth_timeout_secs: u64,
}

/// Serde shape for the eight Policy collections, exactly as they appear in
/// the TOML document (see §2a / §6 of the spec for the key names).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PolicyDoc {
    #[serde(default, rename = "client-allowed")]
    client_allowed: BTreeSet<String>,
    #[serde(default, rename = "client-allowed-prefixes")]
    client_allowed_prefixes: Vec<String>,
    #[serde(default, rename = "client-replacements")]
    client_replacements: BTreeMap<String, String>,
    #[serde(default, rename = "client-replacement-prefixes")]
    client_replacement_prefixes: BTreeMap<String, String>,

    #[serde(default, rename = "server-allowed")]
    server_allowed: BTreeSet<String>,
    #[serde(default, rename = "server-allowed-prefixes")]
    server_allowed_prefixes: Vec<String>,
    #[serde(default, rename = "server-replacements")]
    server_replacements: BTreeMap<String, String>,
    #[serde(default, rename = "server-replacement-prefixes")]
    server_replacement_prefixes: BTreeMap<String, String>,
}

impl PolicyDoc {
    /// Build the wire/document shape back out of a resolved [`Policy`].
    ///
    /// Used by the config-round-trip property test; the running proxy
    /// never needs to re-serialize its own policy.
    #[cfg(test)]
    pub fn from_policy(policy: &Policy) -> Self {
        use crate::policy::Direction;
        let c = policy.rules(Direction::ClientToUpstream);
        let s = policy.rules(Direction::UpstreamToClient);
        PolicyDoc {
            client_allowed: c.allowed.clone(),
            client_allowed_prefixes: c.allowed_prefixes.clone(),
            client_replacements: c.replacements.clone(),
            client_replacement_prefixes: c.replacement_prefixes.clone(),
            server_allowed: s.allowed.clone(),
            server_allowed_prefixes: s.allowed_prefixes.clone(),
            server_replacements: s.replacements.clone(),
            server_replacement_prefixes: s.replacement_prefixes.clone(),
        }
    }

    /// Convert the document shape into a [`Policy`].
    pub fn into_policy(self) -> Policy {
        let client = DirectionalRules {
            allowed: self.client_allowed,
            allowed_prefixes: self.client_allowed_prefixes,
            replacements: self.client_replacements,
            replacement_prefixes: self.client_replacement_prefixes,
        };
        let server = DirectionalRules {
            allowed: self.server_allowed,
            allowed_prefixes: self.server_allowed_prefixes,
            replacements: self.server_replacements,
            replacement_prefixes: self.server_replacement_prefixes,
        };
        Policy::new(client, server)
    }
}

/// Serde shape for the `[logging]` table.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct LoggingDoc {
    console: Option<String>,
    file: Option<PathBuf>,
    #[serde(default)]
    log_sensitive_information: bool,
}

/// Serde shape for the whole configuration document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigDoc {
    listen: Option<String>,
    upstream: Option<String>,
    #[serde(default)]
    policy: PolicyDoc,
    #[serde(default)]
    logging: LoggingDoc,
    auth_timeout_secs: Option<u64>,
}

/// Parse and validate a configuration document's text into [`Settings`].
pub fn parse(text: &str) -> Result<Settings, Error> {
    let doc: ConfigDoc =
        toml::from_str(text).map_err(|e| Error::ConfigInvalid(format!("{e}")))?;

    let listen = match doc.listen {
        Some(raw) => ListenTarget::parse(&raw)?,
        None => {
            return Err(Error::ConfigInvalid(
                "missing required `listen` setting".to_string(),
            ));
        }
    };
    let upstream = match doc.upstream {
        Some(raw) => UpstreamTarget::parse(&raw)?,
        None => {
            return Err(Error::ConfigInvalid(
                "missing required `upstream` setting".to_string(),
            ));
        }
    };

    let logging = LoggingConfig {
        console: doc
            .logging
            .console
            .unwrap_or_else(|| DEFAULT_CONSOLE_FILTER.to_string()),
        file: doc.logging.file,
        log_sensitive_information: doc.logging.log_sensitive_information,
    };

    Ok(Settings {
        listen,
        upstream,
        policy: doc.policy.into_policy(),
        logging,
        auth_timeout_secs: doc.auth_timeout_secs.unwrap_or(DEFAULT_AUTH_TIMEOUT_SECS),
    })
}

/// Load and validate the configuration document at `path`.
pub fn load(path: &Path) -> Result<Settings, Error> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| Error::ConfigInvalid(format!("reading {path:?}: {e}")))?;
    parse(&text)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn minimal_document_resolves_defaults() {
        let settings = parse(
            r#"
            listen = "127.0.0.1:9151"
            upstream = "unix:/var/run/tor/control"
            "#,
        )
        .unwrap();
        assert_eq!(settings.listen, ListenTarget::Tcp("127.0.0.1:9151".into()));
        assert_eq!(
            settings.upstream,
            UpstreamTarget::Unix("/var/run/tor/control".into())
        );
        assert_eq!(settings.logging.console, "info");
        assert_eq!(settings.auth_timeout_secs, DEFAULT_AUTH_TIMEOUT_SECS);
        assert!(!settings.logging.log_sensitive_information);
    }

    #[test]
    fn missing_listen_is_config_invalid() {
        let err = parse(r#"upstream = "unix:/var/run/tor/control""#).unwrap_err();
        assert!(matches!(err, Error::ConfigInvalid(_)));
    }

    #[test]
    fn missing_upstream_is_config_invalid() {
        let err = parse(r#"listen = "127.0.0.1:9151""#).unwrap_err();
        assert!(matches!(err, Error::ConfigInvalid(_)));
    }

    #[test]
    fn misspelled_policy_key_is_config_invalid() {
        let err = parse(
            r#"
            listen = "127.0.0.1:9151"
            upstream = "unix:/var/run/tor/control"

            [policy]
            client-alowed = ["GETINFO version"]
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, Error::ConfigInvalid(_)));
    }

    #[test]
    fn malformed_toml_is_config_invalid() {
        let err = parse("this is not valid toml {{{").unwrap_err();
        assert!(matches!(err, Error::ConfigInvalid(_)));
    }

    #[test]
    fn full_policy_document_parses() {
        let settings = parse(
            r#"
            listen = "unix:/tmp/ctl-filter.sock"
            upstream = "unix:/var/run/tor/control"
            auth_timeout_secs = 5

            [logging]
            console = "debug"
            log_sensitive_information = false

            [policy]
            client-allowed = ["GETINFO version", "QUIT"]
            client-allowed-prefixes = ["GETINFO "]
            client-replacements = { "SIGNAL RELOAD" = "SIGNAL RELOAD" }
            client-replacement-prefixes = {}

            server-allowed = []
            server-allowed-prefixes = ["250 ", "250-", "650 "]
            server-replacements = {}
            server-replacement-prefixes = { "250-SocksPort=" = "250-SocksPort=127.0.0.1:9150" }
            "#,
        )
        .unwrap();
        assert_eq!(settings.auth_timeout_secs, 5);
        assert_eq!(settings.logging.console, "debug");
        use crate::policy::{evaluate, Direction, Verdict};
        assert_eq!(
            evaluate(
                &settings.policy,
                Direction::ClientToUpstream,
                "GETINFO version"
            ),
            Verdict::PassThrough
        );
        assert_eq!(
            evaluate(
                &settings.policy,
                Direction::UpstreamToClient,
                "250-SocksPort=127.0.0.1:9050"
            ),
            Verdict::Replace("250-SocksPort=127.0.0.1:9150".to_string())
        );
    }
}

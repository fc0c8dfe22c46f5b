//! Reading the daemon's authentication cookie file.
//!
//! The path to the cookie arrives from the daemon wire-quoted, e.g.
//! `COOKIEFILE="/var/run/tor/control.authcookie"`. We have to undo that
//! quoting before we can open the file.

use std::path::{Path, PathBuf};

use fs_mistrust::Mistrust;
use tracing::warn;
use zeroize::Zeroizing;

use crate::error::{Error, Result};

/// The raw contents of a cookie file, treated as opaque HMAC key material.
///
/// Wrapped in [`Zeroizing`] so the bytes are scrubbed from memory when
/// dropped; cookie bytes are never themselves written to a log.
pub type CookieBytes = Zeroizing<Vec<u8>>;

/// Undo the daemon's double-quoted, backslash-escaped wire quoting.
///
/// Returns `None` if the string is not validly quoted; callers treat that
/// the same as if no cookie path had been offered at all.
pub fn unquote(raw: &str) -> Option<String> {
    let inner = raw.strip_prefix('"')?.strip_suffix('"')?;
    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        if c == '"' {
            // An unescaped quote inside the body means the string wasn't
            // validly quoted.
            return None;
        }
        if c == '\\' {
            match chars.next() {
                Some(esc) => out.push(esc),
                None => return None,
            }
        } else {
            out.push(c);
        }
    }
    Some(out)
}

/// Re-quote a path the way the daemon would have emitted it.
///
/// Used only by the round-trip property test in this module; the proxy
/// itself never needs to re-emit a quoted cookie path.
#[cfg(test)]
fn requote(path: &str) -> String {
    let mut out = String::with_capacity(path.len() + 2);
    out.push('"');
    for c in path.chars() {
        if c == '"' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('"');
    out
}

/// Read the contents of the cookie file at `path`.
///
/// Before opening the file, checks its permissions with `mistrust` and logs
/// a warning (but does not abort) if they look unexpectedly loose: the
/// daemon's own ACL on the cookie file is the actual authority here, this
/// check exists only to surface local misconfiguration early.
pub fn read_cookie_file(path: &Path, mistrust: &Mistrust) -> Result<CookieBytes> {
    if let Err(e) = mistrust.verifier().require_file().check(path) {
        warn!(
            path = %path.display(),
            "cookie file permissions look unexpectedly permissive: {e}"
        );
    }
    let bytes = std::fs::read(path).map_err(Error::CookieRead)?;
    Ok(Zeroizing::new(bytes))
}

/// Convert a daemon-supplied `COOKIEFILE=` value into a filesystem path,
/// returning `None` (not an error) if it fails to unquote.
pub fn cookie_path_from_wire(raw: &str) -> Option<PathBuf> {
    unquote(raw).map(PathBuf::from)
}

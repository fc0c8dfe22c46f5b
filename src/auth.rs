//! Authenticating to the upstream control daemon on the filter's behalf.
//!
//! The filter speaks the control protocol's authentication handshake itself,
//! once per session, before it starts relaying the client's own traffic. The
//! client never sees the daemon's cookie or nonces; it only ever sees the
//! final `250 OK` (or the connection closing on failure).

use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use tokio::io::{AsyncBufRead, AsyncWrite};
use tracing::debug;

use crate::codec::{write_line, LineReader};
use crate::cookie::{self, CookieBytes};
use crate::error::{Error, Result};

/// HMAC key used by the daemon to compute the hash it sends us, per the
/// control-spec SAFECOOKIE definition.
const SERVER_HASH_KEY: &[u8] = b"Tor safe cookie authentication server-to-controller hash";

/// HMAC key used by us to compute the hash we send the daemon.
const CLIENT_HASH_KEY: &[u8] = b"Tor safe cookie authentication controller-to-server hash";

/// Length in bytes of the client and server nonces.
const NONCE_LEN: usize = 32;

/// Which authentication method we ended up using, after negotiating with
/// the daemon's `PROTOCOLINFO` reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    /// No authentication configured on the daemon side.
    Null,
    /// Plain cookie: the cookie bytes themselves are sent, hex-encoded.
    Cookie,
    /// Challenge-response cookie: see [`compute_client_hash`].
    SafeCookie,
}

/// The daemon's parsed `PROTOCOLINFO` reply, as far as authentication cares.
#[derive(Debug, Clone, Default)]
struct ProtocolInfo {
    methods: Vec<String>,
    cookie_file: Option<std::path::PathBuf>,
}

/// Parse a `PROTOCOLINFO` reply's lines into a [`ProtocolInfo`].
///
/// The reply is a short multi-line block, e.g.:
/// ```text
/// 250-PROTOCOLINFO 1
/// 250-AUTH METHODS=COOKIE,SAFECOOKIE COOKIEFILE="/var/run/tor/control.authcookie"
/// 250-VERSION Tor="0.4.8.12"
/// 250 OK
/// ```
fn parse_protocolinfo(lines: &[String]) -> Result<ProtocolInfo> {
    let mut info = ProtocolInfo::default();
    let mut saw_auth_line = false;
    for line in lines {
        let rest = match line.strip_prefix("250-AUTH ") {
            Some(r) => r,
            None => continue,
        };
        saw_auth_line = true;
        for token in rest.split(' ') {
            if let Some(methods) = token.strip_prefix("METHODS=") {
                info.methods = methods.split(',').map(str::to_string).collect();
            } else if let Some(file) = token.strip_prefix("COOKIEFILE=") {
                info.cookie_file = cookie::cookie_path_from_wire(file);
            }
        }
    }
    if !saw_auth_line {
        return Err(Error::AuthParse(
            "PROTOCOLINFO reply had no AUTH line".to_string(),
        ));
    }
    Ok(info)
}

/// Read a `PROTOCOLINFO` reply's lines up to and including the terminating
/// `250 OK` line, or an `5xx` error reply.
async fn read_reply_block<R: AsyncBufRead + Unpin>(
    reader: &mut LineReader<R>,
) -> Result<Vec<String>> {
    let mut lines = Vec::new();
    loop {
        let line = reader.read_line().await?;
        let is_final = line
            .as_bytes()
            .get(3)
            .map(|&b| b == b' ')
            .unwrap_or(false);
        let code_ok = line.len() >= 3 && line.as_bytes()[0] == b'2';
        lines.push(line.clone());
        if is_final {
            if !code_ok {
                return Err(Error::AuthParse(format!(
                    "daemon rejected request: {line}"
                )));
            }
            return Ok(lines);
        }
    }
}

/// Pick the strongest method we can use from the daemon's advertised list.
///
/// Preference order: NULL, then SAFECOOKIE, then COOKIE. NULL wins whenever
/// it's offered: if the daemon advertises it, the operator has chosen "no
/// authentication required", and we have no secret to present anyway.
/// Within the cookie family, SAFECOOKIE is preferred over plain COOKIE
/// because it never puts the raw cookie on the wire between us and the
/// daemon.
fn choose_method(info: &ProtocolInfo) -> Result<Method> {
    if info.methods.iter().any(|m| m == "NULL") {
        Ok(Method::Null)
    } else if info.methods.iter().any(|m| m == "SAFECOOKIE") && info.cookie_file.is_some() {
        Ok(Method::SafeCookie)
    } else if info.methods.iter().any(|m| m == "COOKIE") && info.cookie_file.is_some() {
        Ok(Method::Cookie)
    } else {
        Err(Error::AuthMethodUnavailable)
    }
}

/// Compute the SAFECOOKIE controller-to-server hash we send in
/// `AUTHENTICATE`.
fn compute_client_hash(cookie: &[u8], client_nonce: &[u8], server_nonce: &[u8]) -> Vec<u8> {
    hmac_over(CLIENT_HASH_KEY, cookie, client_nonce, server_nonce)
}

/// Compute the SAFECOOKIE server-to-controller hash, for comparison against
/// what the daemon sent us in its `AUTHCHALLENGE` reply.
fn compute_server_hash(cookie: &[u8], client_nonce: &[u8], server_nonce: &[u8]) -> Vec<u8> {
    hmac_over(SERVER_HASH_KEY, cookie, client_nonce, server_nonce)
}

fn hmac_over(key: &[u8], cookie: &[u8], client_nonce: &[u8], server_nonce: &[u8]) -> Vec<u8> {
    let mut mac = Hmac::<Sha256>::new_from_slice(key).expect("HMAC accepts keys of any length");
    mac.update(cookie);
    mac.update(client_nonce);
    mac.update(server_nonce);
    mac.finalize().into_bytes().to_vec()
}

/// Decode a daemon-supplied hex token, rejecting anything that isn't exactly
/// valid lowercase-or-uppercase hex of even length.
fn decode_hex(s: &str) -> Result<Vec<u8>> {
    hex::decode(s).map_err(|e| Error::AuthParse(format!("bad hex token: {e}")))
}

/// Run the full authentication handshake against the daemon reachable over
/// `reader`/`writer`, using `cookie_base` as the filesystem root for
/// resolving any `COOKIEFILE=` the daemon advertises.
///
/// On success, the daemon has accepted our `AUTHENTICATE` and is ready to
/// process ordinary control commands.
pub async fn authenticate<R, W>(
    reader: &mut LineReader<R>,
    writer: &mut W,
    mistrust: &fs_mistrust::Mistrust,
) -> Result<Method>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    write_line(writer, "PROTOCOLINFO 1").await?;
    let reply = read_reply_block(reader).await?;
    let info = parse_protocolinfo(&reply)?;
    let method = choose_method(&info)?;
    debug!(?method, "negotiated authentication method");

    match method {
        Method::Null => {
            write_line(writer, "AUTHENTICATE").await?;
            let ack = read_reply_block(reader).await?;
            expect_ok(&ack)?;
        }
        Method::Cookie => {
            let path = info.cookie_file.as_deref().expect("checked in choose_method");
            let cookie = cookie::read_cookie_file(path, mistrust)?;
            let token = hex::encode(&cookie[..]);
            write_line(writer, &format!("AUTHENTICATE {token}")).await?;
            let ack = read_reply_block(reader).await?;
            expect_ok(&ack)?;
        }
        Method::SafeCookie => {
            let path = info.cookie_file.as_deref().expect("checked in choose_method");
            let cookie = cookie::read_cookie_file(path, mistrust)?;
            authenticate_safecookie(reader, writer, &cookie).await?;
        }
    }
    Ok(method)
}

/// Run the `AUTHCHALLENGE`/`AUTHENTICATE` exchange specific to SAFECOOKIE.
async fn authenticate_safecookie<R, W>(
    reader: &mut LineReader<R>,
    writer: &mut W,
    cookie: &CookieBytes,
) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut client_nonce = [0u8; NONCE_LEN];
    rand::rng().fill_bytes(&mut client_nonce);
    let client_nonce_hex = hex::encode(client_nonce);

    write_line(writer, &format!("AUTHCHALLENGE SAFECOOKIE {client_nonce_hex}")).await?;
    let reply = read_reply_block(reader).await?;
    let (server_hash, server_nonce) = parse_authchallenge(&reply)?;

    let expected_server_hash = compute_server_hash(&cookie[..], &client_nonce, &server_nonce);
    if !bool::from(expected_server_hash.ct_eq(&server_hash)) {
        return Err(Error::ServerHashMismatch);
    }

    let client_hash = compute_client_hash(&cookie[..], &client_nonce, &server_nonce);
    write_line(writer, &format!("AUTHENTICATE {}", hex::encode(&client_hash))).await?;
    let ack = read_reply_block(reader).await?;
    expect_ok(&ack)
}

/// Parse an `AUTHCHALLENGE` reply's `SERVERHASH=`/`SERVERNONCE=` tokens.
fn parse_authchallenge(lines: &[String]) -> Result<(Vec<u8>, Vec<u8>)> {
    let line = lines
        .iter()
        .find(|l| l.starts_with("250 AUTHCHALLENGE"))
        .ok_or_else(|| Error::AuthParse("missing AUTHCHALLENGE reply line".to_string()))?;

    let mut server_hash = None;
    let mut server_nonce = None;
    for token in line.split(' ') {
        if let Some(v) = token.strip_prefix("SERVERHASH=") {
            server_hash = Some(decode_hex(v)?);
        } else if let Some(v) = token.strip_prefix("SERVERNONCE=") {
            server_nonce = Some(decode_hex(v)?);
        }
    }
    match (server_hash, server_nonce) {
        (Some(h), Some(n)) => Ok((h, n)),
        _ => Err(Error::AuthParse(
            "AUTHCHALLENGE reply missing SERVERHASH or SERVERNONCE".to_string(),
        )),
    }
}

/// Confirm a reply block's final line is a plain `250 OK`.
fn expect_ok(lines: &[String]) -> Result<()> {
    match lines.last() {
        Some(l) if l == "250 OK" => Ok(()),
        Some(l) => Err(Error::AuthParse(format!("expected 250 OK, got {l:?}"))),
        None => Err(Error::AuthParse("empty reply".to_string())),
    }
}

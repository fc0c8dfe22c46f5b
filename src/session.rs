//! One filtered control-port session: authenticate to the daemon once, then
//! relay lines in both directions through the [`Policy`] until either side
//! closes.

use std::sync::Arc;

use safelog::sensitive;
use tokio::io::{AsyncBufRead, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, instrument};

use crate::auth;
use crate::cfg::Settings;
use crate::codec::{write_line, LineReader};
use crate::error::{Error, Result};
use crate::policy::{self, Direction, Policy, Verdict};

/// Synthesized reply sent back to the client in place of relaying a
/// policy-denied command.
///
/// A denial never closes the session or surfaces an error to the client;
/// from the client's point of view, a denied command simply does nothing.
const SOFT_DENIAL_REPLY: &str = "250 OK";

/// Run one client session end to end: authenticate to `upstream` on the
/// session's behalf, then pump lines between `client` and `upstream` under
/// `policy` until either side closes or a fatal error occurs.
///
/// `client` and `upstream` must each be split into a read half implementing
/// [`AsyncRead`] and a write half implementing [`AsyncWrite`] by the caller,
/// matching how `tokio::io::split` exposes duplex transports. Returns once
/// both pumps have exited; the returned `Err`, if any, is whichever side
/// stopped first (see [`crate::error::Error`]) -- a clean close by either
/// peer looks the same as any other transport error from here.
#[instrument(skip_all, level = "debug")]
pub async fn run<CR, CW, UR, UW>(
    client_reader: CR,
    client_writer: CW,
    upstream_reader: UR,
    mut upstream_writer: UW,
    settings: Arc<Settings>,
    mistrust: Arc<fs_mistrust::Mistrust>,
) -> Result<()>
where
    CR: AsyncRead + Unpin + Send + 'static,
    CW: AsyncWrite + Unpin + Send + 'static,
    UR: AsyncRead + Unpin + Send + 'static,
    UW: AsyncWrite + Unpin + Send + 'static,
{
    let mut upstream_reader = LineReader::new(BufReader::new(upstream_reader));

    let deadline = std::time::Duration::from_secs(settings.auth_timeout_secs);
    let method = tokio::time::timeout(
        deadline,
        auth::authenticate(&mut upstream_reader, &mut upstream_writer, &mistrust),
    )
    .await
    .map_err(|_| {
        Error::AuthParse("authentication with upstream daemon timed out".to_string())
    })??;
    debug!(?method, "session authenticated");

    let client_reader = LineReader::new(BufReader::new(client_reader));
    let client_writer = Arc::new(Mutex::new(client_writer));

    let (err_tx, mut err_rx) = mpsc::channel::<Error>(2);

    let policy = settings.policy.clone();

    let c2u = tokio::spawn(pump_client_to_upstream(
        client_reader,
        upstream_writer,
        Arc::clone(&client_writer),
        policy.clone(),
        err_tx.clone(),
    ));
    let u2c = tokio::spawn(pump_upstream_to_client(
        upstream_reader,
        Arc::clone(&client_writer),
        policy,
        err_tx,
    ));

    let _ = c2u.await;
    let _ = u2c.await;

    match err_rx.recv().await {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Relay lines from the client to the upstream daemon, applying policy.
async fn pump_client_to_upstream<R, U, C>(
    mut reader: LineReader<R>,
    mut upstream_writer: U,
    client_writer: Arc<Mutex<C>>,
    policy: Policy,
    err_tx: mpsc::Sender<Error>,
) where
    R: AsyncBufRead + Unpin,
    U: AsyncWrite + Unpin,
    C: AsyncWrite + Unpin,
{
    let exit_err = loop {
        let line = match reader.read_line().await {
            Ok(l) => l,
            Err(e) => break e,
        };
        let result = match policy::evaluate(&policy, Direction::ClientToUpstream, &line) {
            Verdict::PassThrough => write_line(&mut upstream_writer, &line).await,
            Verdict::Replace(substitute) => {
                debug!(line = %sensitive(&line), "client line replaced");
                write_line(&mut upstream_writer, &substitute).await
            }
            Verdict::Deny => {
                debug!(line = %sensitive(&line), "client line denied");
                let mut w = client_writer.lock().await;
                write_line(&mut *w, SOFT_DENIAL_REPLY).await
            }
        };
        if let Err(e) = result {
            break e;
        }
    };
    let _ = upstream_writer.shutdown().await;
    let _ = shutdown_silently(Arc::clone(&client_writer)).await;
    let _ = err_tx.send(exit_err).await;
}

/// Relay lines from the upstream daemon to the client, applying policy.
async fn pump_upstream_to_client<R, C>(
    mut reader: LineReader<R>,
    client_writer: Arc<Mutex<C>>,
    policy: Policy,
    err_tx: mpsc::Sender<Error>,
) where
    R: AsyncBufRead + Unpin,
    C: AsyncWrite + Unpin,
{
    let exit_err = loop {
        let line = match reader.read_line().await {
            Ok(l) => l,
            Err(e) => break e,
        };
        let verdict = policy::evaluate(&policy, Direction::UpstreamToClient, &line);
        let mut w = client_writer.lock().await;
        let result = match verdict {
            Verdict::PassThrough => write_line(&mut *w, &line).await,
            Verdict::Replace(substitute) => {
                debug!(line = %sensitive(&line), "upstream line replaced");
                write_line(&mut *w, &substitute).await
            }
            Verdict::Deny => {
                debug!(line = %sensitive(&line), "upstream line denied");
                write_line(&mut *w, SOFT_DENIAL_REPLY).await
            }
        };
        drop(w);
        if let Err(e) = result {
            break e;
        }
    };
    let _ = shutdown_silently(Arc::clone(&client_writer)).await;
    let _ = err_tx.send(exit_err).await;
}

/// Best-effort half-close of the client connection once the other side of
/// the session has gone away; errors here are not reported, the session is
/// already tearing down. Called by both pumps so teardown is symmetric
/// regardless of which side disconnects first.
async fn shutdown_silently<W: AsyncWrite + Unpin>(writer: Arc<Mutex<W>>) -> std::io::Result<()> {
    let mut w = writer.lock().await;
    w.shutdown().await
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::policy::DirectionalRules;
    use tokio::io::duplex;

    fn null_policy() -> Policy {
        Policy::default()
    }

    fn allow_all_policy() -> Policy {
        let rules = DirectionalRules {
            allowed: Default::default(),
            allowed_prefixes: vec![String::new()],
            replacements: Default::default(),
            replacement_prefixes: Default::default(),
        };
        Policy::new(rules.clone(), rules)
    }

    #[tokio::test]
    async fn denied_client_line_gets_soft_ok_and_nothing_reaches_upstream() {
        let (client_side, mut test_client) = duplex(256);
        let (upstream_side, mut test_upstream) = duplex(256);
        let (client_r, client_w) = tokio::io::split(client_side);
        let (upstream_r, upstream_w) = tokio::io::split(upstream_side);

        let client_writer = Arc::new(Mutex::new(client_w));
        let (err_tx, _err_rx) = mpsc::channel(2);
        tokio::spawn(pump_client_to_upstream(
            LineReader::new(BufReader::new(client_r)),
            upstream_w,
            client_writer,
            null_policy(),
            err_tx,
        ));

        test_client.write_all(b"SIGNAL SHUTDOWN\n").await.unwrap();

        let mut buf = [0u8; 64];
        let n = test_client.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"250 OK\n");

        // Nothing should have reached the upstream half.
        drop(test_client);
        let mut upstream_buf = [0u8; 16];
        let n = tokio::time::timeout(
            std::time::Duration::from_millis(50),
            test_upstream.read(&mut upstream_buf),
        )
        .await;
        assert!(n.is_err() || n.unwrap().unwrap() == 0);
    }

    #[tokio::test]
    async fn allowed_line_passes_through_unchanged() {
        let (client_side, mut test_client) = duplex(256);
        let (upstream_side, mut test_upstream) = duplex(256);
        let (client_r, client_w) = tokio::io::split(client_side);
        let (_upstream_r, upstream_w) = tokio::io::split(upstream_side);

        let client_writer = Arc::new(Mutex::new(client_w));
        let (err_tx, _err_rx) = mpsc::channel(2);
        tokio::spawn(pump_client_to_upstream(
            LineReader::new(BufReader::new(client_r)),
            upstream_w,
            client_writer,
            allow_all_policy(),
            err_tx,
        ));

        test_client.write_all(b"GETINFO version\n").await.unwrap();

        let mut buf = [0u8; 32];
        let n = test_upstream.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"GETINFO version\n");
    }
}

//! Accept connections on the configured listener and hand each one off to
//! its own [`crate::session`].

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use tokio::net::{TcpListener, UnixListener};
use tracing::{debug, error, info, warn};

use crate::cfg::{ListenTarget, Settings, UpstreamTarget};
use crate::session;

/// Bind the listener described by `settings.listen` and accept connections
/// from it forever, spawning one session task per connection.
///
/// Returns only on a fatal accept error; a client disconnecting, or a
/// session ending with an error, never stops the loop.
pub async fn run(settings: Arc<Settings>, mistrust: Arc<fs_mistrust::Mistrust>) -> Result<()> {
    match &settings.listen {
        ListenTarget::Tcp(addr) => {
            let listener = TcpListener::bind(addr)
                .await
                .with_context(|| format!("binding TCP listener on {addr}"))?;
            info!(%addr, "listening for control connections");
            accept_tcp_loop(listener, settings, mistrust).await
        }
        ListenTarget::Unix(path) => {
            // Binding a stale socket path fails with AddrInUse; remove it
            // first the way most unix daemons do, since we own this path.
            let _ = std::fs::remove_file(path);
            let listener = UnixListener::bind(path)
                .with_context(|| format!("binding unix listener on {}", path.display()))?;
            info!(path = %path.display(), "listening for control connections");
            accept_unix_loop(listener, settings, mistrust).await
        }
    }
}

async fn accept_tcp_loop(
    listener: TcpListener,
    settings: Arc<Settings>,
    mistrust: Arc<fs_mistrust::Mistrust>,
) -> Result<()> {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(pair) => pair,
            Err(err) => {
                if accept_err_is_fatal(&err) {
                    return Err(anyhow!(err)).context("accepting TCP connection");
                }
                warn!(error = %err, "accepting TCP connection failed, continuing");
                continue;
            }
        };
        debug!(%peer, "accepted connection");
        spawn_session(stream, settings.clone(), mistrust.clone());
    }
}

async fn accept_unix_loop(
    listener: UnixListener,
    settings: Arc<Settings>,
    mistrust: Arc<fs_mistrust::Mistrust>,
) -> Result<()> {
    loop {
        let (stream, _addr) = match listener.accept().await {
            Ok(pair) => pair,
            Err(err) => {
                if accept_err_is_fatal(&err) {
                    return Err(anyhow!(err)).context("accepting unix connection");
                }
                warn!(error = %err, "accepting unix connection failed, continuing");
                continue;
            }
        };
        debug!("accepted connection");
        spawn_session(stream, settings.clone(), mistrust.clone());
    }
}

/// Dial the configured upstream and spawn a session task relaying `client`
/// through it. Connection failures to the upstream are logged and dropped;
/// they do not affect the accept loop.
fn spawn_session<S>(client: S, settings: Arc<Settings>, mistrust: Arc<fs_mistrust::Mistrust>)
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let upstream_stream = match dial_upstream(&settings.upstream).await {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "could not reach upstream control daemon");
                return;
            }
        };

        let (client_r, client_w) = tokio::io::split(client);
        let result = match upstream_stream {
            Upstream::Tcp(s) => {
                let (u_r, u_w) = tokio::io::split(s);
                session::run(client_r, client_w, u_r, u_w, settings, mistrust).await
            }
            Upstream::Unix(s) => {
                let (u_r, u_w) = tokio::io::split(s);
                session::run(client_r, client_w, u_r, u_w, settings, mistrust).await
            }
        };
        if let Err(e) = result {
            match e {
                crate::error::Error::ServerHashMismatch => {
                    error!(error = %e, "SAFECOOKIE server hash did not verify, possible daemon impersonation");
                }
                e => debug!(error = %e, "session ended"),
            }
        }
    });
}

/// A connected upstream transport, before it's split into read/write halves.
enum Upstream {
    Tcp(tokio::net::TcpStream),
    Unix(tokio::net::UnixStream),
}

async fn dial_upstream(target: &UpstreamTarget) -> std::io::Result<Upstream> {
    match target {
        UpstreamTarget::Tcp(addr) => Ok(Upstream::Tcp(tokio::net::TcpStream::connect(addr).await?)),
        UpstreamTarget::Unix(path) => {
            Ok(Upstream::Unix(tokio::net::UnixStream::connect(path).await?))
        }
    }
}

/// Whether an accept error should bring the whole listener down.
///
/// EMFILE/ENFILE mean the process (or system) ran out of file descriptors;
/// the listener should keep trying rather than exit, since the condition is
/// usually transient.
fn accept_err_is_fatal(err: &std::io::Error) -> bool {
    !matches!(err.raw_os_error(), Some(libc::EMFILE) | Some(libc::ENFILE))
}

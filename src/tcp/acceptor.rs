//! Accepting connections and supervising their sessions.
//!
//! One task per listener accepts connections and forwards them over a
//! channel; the supervisor spawns an isolated relay session per
//! connection and reaps finished sessions from a [`JoinSet`]. A session
//! task owns only its accepted stream, never the listeners, and nothing
//! it does can disturb a sibling session.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use log::{debug, error, info};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinSet};

use crate::relay::{Session, SessionEnd};
use crate::tcp::{ConnMessage, ConnRequest, ConnSender, ListenerSet};
use crate::{udp, HANDSHAKE_LEN};

/// Accepts connections on the whole listener set and relays each one to
/// the UDP destination until a listener fails. Session faults are
/// logged and contained; only accept failures end the server.
pub async fn serve(
    listeners: ListenerSet,
    destination: String,
    handshake: [u8; HANDSHAKE_LEN],
    timeout: Option<Duration>,
) -> Result<()> {
    let (tx, mut rx) = mpsc::channel(16);
    for listener in listeners.into_inner() {
        tokio::spawn(accept_loop(listener, tx.clone()));
    }
    drop(tx);

    let mut sessions: JoinSet<(SocketAddr, Result<SessionEnd>)> = JoinSet::new();
    loop {
        tokio::select! {
            message = rx.recv() => match message {
                Some(ConnMessage::Incoming(request)) => {
                    info!("Received a TCP connection from {}", request.peer_addr);
                    let destination = destination.clone();
                    sessions.spawn(async move {
                        let peer = request.peer_addr;
                        let end =
                            run_session(request, &destination, handshake, timeout).await;
                        (peer, end)
                    });
                }
                Some(ConnMessage::Failed(e)) => return Err(e).context("accept"),
                // Every accept task is gone; nothing left to serve.
                None => anyhow::bail!("All listeners have terminated"),
            },

            Some(finished) = sessions.join_next() => reap(finished),
        }
    }
}

/// Accepts connections on one listener and hands them to the
/// supervisor. A closed channel means the supervisor is gone.
async fn accept_loop(listener: TcpListener, tx: ConnSender) {
    loop {
        match listener.accept().await {
            Ok((stream, peer_addr)) => {
                let request = ConnRequest { stream, peer_addr };
                if tx.send(ConnMessage::Incoming(request)).await.is_err() {
                    return;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
            Err(e) => {
                let _ = tx.send(ConnMessage::Failed(e)).await;
                return;
            }
        }
    }
}

/// One complete server-side session: opens this connection's own UDP
/// socket towards the destination and runs the relay until it ends.
async fn run_session(
    request: ConnRequest,
    destination: &str,
    handshake: [u8; HANDSHAKE_LEN],
    timeout: Option<Duration>,
) -> Result<SessionEnd> {
    let (udp_socket, udp_peer) = udp::udp_client(destination).await?;
    let session = Session::server(request.stream, udp_socket, udp_peer, handshake, timeout);
    session.run().await
}

fn reap(finished: Result<(SocketAddr, Result<SessionEnd>), JoinError>) {
    match finished {
        Ok((peer, Ok(end))) => debug!("Session with {peer} ended: {end:?}"),
        Ok((peer, Err(e))) => error!("Session with {peer} failed: {e:#}"),
        Err(e) => error!("Session task panicked: {e}"),
    }
}

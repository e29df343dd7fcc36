//! Per-connection I/O for the proxy server.
//!
//! Each accepted socket gets one [`ConnectionHandler`] task that owns the framed
//! stream. It answers `PING` inline, forwards requests to a per-session worker
//! (so requests of one session are processed strictly in order while the socket
//! keeps being read), writes queued replies and notifications, and watches the
//! heartbeat deadline. Whatever ends the loop, cleanup runs through
//! [`ProxyServer::close_session`], which is idempotent.

use super::session::SessionId;
use super::ProxyServer;
use crate::driver::Driver;
use crate::error::ProxyError;
use crate::protocol::codec::{CodecError, FrameCodec};
use crate::protocol::{unix_now, Frame, CONTROL_CALL_ID, PROTOCOL_VERSION};
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::time::Instant;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

type FramedStream = Framed<TcpStream, FrameCodec>;

pub(crate) struct ConnectionHandler<D: Driver> {
    server: ProxyServer<D>,
    stream: TcpStream,
    peer: SocketAddr,
}

struct Handshaken {
    session: SessionId,
    outbound_tx: mpsc::UnboundedSender<Frame>,
    outbound_rx: mpsc::UnboundedReceiver<Frame>,
}

impl<D: Driver> ConnectionHandler<D> {
    pub(crate) fn new(server: ProxyServer<D>, stream: TcpStream, peer: SocketAddr) -> Self {
        Self {
            server,
            stream,
            peer,
        }
    }

    pub(crate) async fn run(self) {
        let Self {
            server,
            stream,
            peer,
        } = self;
        if let Err(err) = stream.set_nodelay(true) {
            debug!(%peer, error = %err, "could not disable Nagle");
        }
        let codec = FrameCodec::with_max_frame_bytes(server.options().max_frame_bytes);
        let mut framed = Framed::new(stream, codec);

        let greeting = tokio::time::timeout(
            server.options().handshake_timeout,
            handshake(&server, &mut framed, peer),
        );
        let Handshaken {
            session,
            outbound_tx,
            mut outbound_rx,
        } = tokio::select! {
            _ = server.cancellation().cancelled() => return,
            outcome = greeting => match outcome {
                Ok(Ok(done)) => done,
                Ok(Err(err)) => {
                    warn!(%peer, error = %err, "handshake failed");
                    return;
                }
                Err(_) => {
                    warn!(%peer, "handshake timed out");
                    return;
                }
            },
        };

        let (work_tx, work_rx) = mpsc::unbounded_channel();
        tokio::spawn(request_worker(server.clone(), session, work_rx, outbound_tx));

        let timeout = server.options().liveness_timeout();
        let mut liveness = tokio::time::interval(server.options().heartbeat_interval);
        let cancel = server.cancellation().clone();

        let reason = loop {
            tokio::select! {
                _ = cancel.cancelled() => break "server shutdown",
                Some(frame) = outbound_rx.recv() => {
                    if let Err(err) = framed.send(frame).await {
                        debug!(%session, error = %err, "write failed");
                        break "write failed";
                    }
                }
                _ = liveness.tick() => match server.last_heartbeat(session) {
                    None => break "session closed by server",
                    Some(seen) if seen.elapsed() > timeout => {
                        warn!(%session, timeout_ms = timeout.as_millis() as u64, "missed heartbeats");
                        break "missed heartbeats";
                    }
                    Some(_) => {}
                },
                inbound = framed.next() => match inbound {
                    None => break "peer closed the connection",
                    Some(Err(err)) => {
                        if !err.is_protocol_error() {
                            debug!(%session, error = %err, "read failed");
                            break "read failed";
                        }
                        reject(&mut framed, session, err).await;
                        break "protocol error";
                    }
                    Some(Ok(frame)) => {
                        server.touch(session);
                        match frame {
                            Frame::Ping => {
                                if framed.send(Frame::Pong).await.is_err() {
                                    break "write failed";
                                }
                            }
                            Frame::Bye => break "client said goodbye",
                            frame if is_request(&frame) => {
                                if work_tx.send(frame).is_err() {
                                    break "request worker stopped";
                                }
                            }
                            other => {
                                let err = ProxyError::Protocol(format!(
                                    "unexpected {} frame from client",
                                    other.name()
                                ));
                                let _ = framed.send(Frame::error(CONTROL_CALL_ID, &err)).await;
                                warn!(%session, frame = other.name(), "protocol violation");
                                break "protocol error";
                            }
                        }
                    }
                },
            }
        };

        server.close_session(session, reason);
        drop(work_tx);

        // Best effort: deliver what is already queued (SHUTDOWN_ACK, BYE).
        while let Ok(frame) = outbound_rx.try_recv() {
            if framed.send(frame).await.is_err() {
                break;
            }
        }
        if let Err(err) = SinkExt::<Frame>::close(&mut framed).await {
            debug!(%session, error = %err, "error while closing socket");
        }
    }
}

async fn handshake<D: Driver>(
    server: &ProxyServer<D>,
    framed: &mut FramedStream,
    peer: SocketAddr,
) -> Result<Handshaken, ProxyError> {
    let first = match framed.next().await {
        Some(Ok(frame)) => frame,
        Some(Err(err)) => return Err(ProxyError::Handshake(err.to_string())),
        None => return Err(ProxyError::Handshake("closed before HELLO".into())),
    };

    let client_name = match first {
        Frame::Hello {
            protocol_version,
            client_name,
        } if protocol_version == PROTOCOL_VERSION => client_name,
        Frame::Hello {
            protocol_version, ..
        } => {
            let reason = format!(
                "protocol version {protocol_version} not supported (server speaks {PROTOCOL_VERSION})"
            );
            send_reject(framed, &reason).await;
            return Err(ProxyError::Handshake(reason));
        }
        other => {
            let reason = format!("expected HELLO, got {}", other.name());
            send_reject(framed, &reason).await;
            return Err(ProxyError::Handshake(reason));
        }
    };

    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let session = match server.register_session(peer, client_name, outbound_tx.clone()) {
        Ok(id) => id,
        Err(err) => {
            send_reject(framed, &err.to_string()).await;
            return Err(err);
        }
    };

    let ack = Frame::HelloAck {
        protocol_version: PROTOCOL_VERSION,
        session_id: session,
        manifest: server.manifest().as_ref().clone(),
        fingerprint: server.fingerprint().to_string(),
        heartbeat_interval_ms: server.options().heartbeat_interval.as_millis() as u64,
    };
    if let Err(err) = framed.send(ack).await {
        server.close_session(session, "handshake write failed");
        return Err(ProxyError::Connection(err.to_string()));
    }

    Ok(Handshaken {
        session,
        outbound_tx,
        outbound_rx,
    })
}

async fn send_reject(framed: &mut FramedStream, reason: &str) {
    let frame = Frame::HelloReject {
        reason: reason.to_string(),
    };
    if let Err(err) = framed.send(frame).await {
        debug!(error = %err, "could not send HELLO_REJECT");
    }
}

async fn reject(framed: &mut FramedStream, session: SessionId, err: CodecError) {
    warn!(%session, error = %err, "malformed frame");
    let reply = Frame::error(CONTROL_CALL_ID, &ProxyError::Protocol(err.to_string()));
    let _ = framed.send(reply).await;
}

fn is_request(frame: &Frame) -> bool {
    matches!(
        frame,
        Frame::Call { .. }
            | Frame::RequestAdmin { .. }
            | Frame::ReleaseAdmin
            | Frame::AdminStatus
            | Frame::Stats
            | Frame::Shutdown
            | Frame::GetResult
            | Frame::Abort
            | Frame::SetLogLevel { .. }
    )
}

/// Swap a reply the codec would refuse to encode for an `oversized` driver error.
fn fit_reply(reply: Frame, limit: usize) -> Frame {
    let size = match serde_json::to_vec(&reply) {
        Ok(body) => body.len(),
        Err(_) => return reply,
    };
    if size <= limit {
        return reply;
    }
    let call_id = match &reply {
        Frame::Result { call_id, .. } => *call_id,
        _ => CONTROL_CALL_ID,
    };
    warn!(frame = reply.name(), size, limit, "reply exceeds the frame size limit");
    Frame::error(
        call_id,
        &ProxyError::driver(
            "oversized",
            format!(
                "{} reply of {size} bytes exceeds the {limit} byte frame limit",
                reply.name()
            ),
        ),
    )
}

/// Processes one session's requests in arrival order.
///
/// Keeps running after the connection closes so that an in-flight driver call
/// completes; its result is then discarded.
async fn request_worker<D: Driver>(
    server: ProxyServer<D>,
    session: SessionId,
    mut requests: mpsc::UnboundedReceiver<Frame>,
    outbound: mpsc::UnboundedSender<Frame>,
) {
    while let Some(frame) = requests.recv().await {
        if !server.is_connected(session) {
            debug!(%session, frame = frame.name(), "discarding request of closed session");
            continue;
        }

        let started = Instant::now();
        let started_at = unix_now();
        let reply = fit_reply(
            server.process(session, frame).await,
            server.options().max_frame_bytes,
        );
        server.record_reply(session, started.elapsed(), started_at);

        let shutdown = reply == Frame::ShutdownAck;
        if !server.is_connected(session) || outbound.send(reply).is_err() {
            debug!(%session, "discarding reply for closed session");
        }
        if shutdown {
            info!(%session, "stopping server on remote request");
            server.shutdown();
        }
    }
}

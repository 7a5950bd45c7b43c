//! Accepting and connecting render clients.
//!
//! Each authenticated connection gets two pumps: the reader forwards frames
//! to the event loop, the writer drains the client's [`Outgoing`] queue.

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::bridge::handshake::{ServerHandshake, server_handshake};
use crate::bridge::protocol::Message;
use crate::connection::{Connection, ConnectionError, ConnectionReader, ConnectionWriter};
use crate::error::ErrorKind;
use crate::orchestrator::{Event, EventSender, FarmContext};
use crate::worker::{ClientId, ClientLink, Outgoing};

/// Accept render clients until the task is aborted.
pub async fn accept_loop(listener: TcpListener, ctx: FarmContext) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                tracing::debug!(%peer, "Accepted connection");
                let _ = stream.set_nodelay(true);
                tokio::spawn(admit(stream, peer.to_string(), ctx.clone()));
            }
            Err(e) => {
                tracing::warn!(error = %e, "Accept failed");
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            }
        }
    }
}

/// Connect out to a render client listening at `addr`. The farm still
/// issues the challenge.
pub fn spawn_connect(addr: String, ctx: FarmContext) -> JoinHandle<()> {
    tokio::spawn(async move {
        match TcpStream::connect(&addr).await {
            Ok(stream) => {
                let _ = stream.set_nodelay(true);
                tracing::info!(peer = %addr, "Connected to render client");
                admit(stream, addr, ctx).await;
            }
            Err(e) => {
                tracing::warn!(peer = %addr, error = %e, "Failed to connect to render client");
            }
        }
    })
}

/// Authenticate `stream` and, on success, hand it to the scheduler.
pub(crate) async fn admit<S>(stream: S, peer: String, ctx: FarmContext)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let Some(password) = ctx.config.password.as_deref() else {
        tracing::warn!(%peer, "No password configured, dropping connection");
        return;
    };
    let mut conn = Connection::new(stream);
    let params = ServerHandshake {
        password,
        njobs: ctx.config.client_njobs,
        start_time: ctx.start_time,
        accepting: ctx.is_accepting(),
        timeout: ctx.config.handshake_timeout,
    };
    if let Err(e) = server_handshake(&mut conn, &params).await {
        tracing::warn!(%peer, kind = %e.kind(), error = %e, "Client handshake failed");
        return;
    }

    let id = ctx.allocate_client_id();
    let (tx, rx) = mpsc::unbounded_channel();
    let link = ClientLink::new(id, peer, tx);
    let closed = link.closed_token();
    let (reader, writer) = conn.split();

    let authenticated = Event::ClientAuthenticated {
        link,
        njobs: params.njobs,
    };
    if ctx.events.send(authenticated).is_err() {
        return;
    }
    tokio::spawn(write_pump(id, writer, rx, ctx.events.clone()));
    read_pump(id, reader, closed, ctx.events).await;
}

async fn read_pump<S>(
    client: ClientId,
    mut reader: ConnectionReader<S>,
    closed: CancellationToken,
    events: EventSender,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let received = tokio::select! {
            biased;
            _ = closed.cancelled() => return,
            received = reader.recv() => received,
        };
        let event = match received {
            Ok(Some(frame)) => {
                let end = frame.message == Message::EndOfStream;
                let _ = events.send(Event::ClientFrame { client, frame });
                if end {
                    return;
                }
                continue;
            }
            Ok(None) => Event::ClientLost {
                client,
                kind: ErrorKind::ConnectionLost,
                reason: "connection closed by peer".to_string(),
            },
            Err(e) => Event::ClientLost {
                client,
                kind: if e.is_protocol() {
                    ErrorKind::ProtocolError
                } else {
                    ErrorKind::ConnectionLost
                },
                reason: e.to_string(),
            },
        };
        let _ = events.send(event);
        return;
    }
}

async fn write_pump<S>(
    client: ClientId,
    mut writer: ConnectionWriter<S>,
    mut rx: mpsc::UnboundedReceiver<Outgoing>,
    events: EventSender,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    while let Some(outgoing) = rx.recv().await {
        let result = match outgoing {
            Outgoing::Message(message) => {
                if let Message::TaskRequest(request) = &message {
                    let _ = events.send(Event::Dispatching {
                        client,
                        frame_no: request.frame_no,
                        seq_no: writer.next_seq(),
                    });
                }
                writer.send(message).await.map(drop)
            }
            Outgoing::File {
                frame_no,
                name,
                path,
            } => match writer.copy_file(frame_no, &name, &path).await {
                Ok(_) => Ok(()),
                // Io here is the local file; socket failures surface as Codec.
                Err(e @ (ConnectionError::Io(_) | ConnectionError::FileChanged { .. })) => {
                    tracing::warn!(%client, frame = frame_no, file = %name, error = %e, "Input file unreadable");
                    let _ = events.send(Event::FileFailed {
                        client,
                        frame_no,
                        name,
                        error: e.to_string(),
                    });
                    Ok(())
                }
                Err(e) => Err(e),
            },
            Outgoing::Disconnect => {
                if let Err(e) = writer.close().await {
                    tracing::debug!(%client, error = %e, "Close failed");
                }
                return;
            }
        };
        if let Err(e) = result {
            let _ = events.send(Event::ClientLost {
                client,
                kind: ErrorKind::ConnectionLost,
                reason: e.to_string(),
            });
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::bridge::handshake::{HandshakeError, client_handshake};
    use crate::bridge::protocol::{RefuseReason, TaskStateKind};
    use crate::config::FarmConfig;
    use crate::task::TaskRecord;

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn context(password: &str) -> (FarmContext, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let config = FarmConfig::new()
            .with_password(password)
            .with_client_njobs(2);
        (FarmContext::new(tx, Arc::new(config), 42), rx)
    }

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<Event>) -> Event {
        tokio::time::timeout(TIMEOUT, rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event channel closed")
    }

    /// Admit one in-memory client and return its connection and link.
    async fn admitted(
        ctx: FarmContext,
        events: &mut mpsc::UnboundedReceiver<Event>,
    ) -> (Connection<tokio::io::DuplexStream>, ClientLink) {
        let (a, b) = tokio::io::duplex(256 * 1024);
        tokio::spawn(admit(a, "test-peer".to_string(), ctx));
        let mut client = Connection::new(b);
        let session = client_handshake(&mut client, "pw", TIMEOUT).await.unwrap();
        assert_eq!(session.njobs, 2);
        assert_eq!(session.start_time, 42);

        match next_event(events).await {
            Event::ClientAuthenticated { link, njobs } => {
                assert_eq!(njobs, 2);
                assert_eq!(link.peer(), "test-peer");
                (client, link)
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn frames_flow_both_ways() {
        let (ctx, mut events) = context("pw");
        let (mut client, link) = admitted(ctx, &mut events).await;

        client
            .send(Message::TaskState {
                frame_no: 9,
                state: TaskStateKind::Rendering,
            })
            .await
            .unwrap();
        match next_event(&mut events).await {
            Event::ClientFrame { client: id, frame } => {
                assert_eq!(id, link.id());
                assert_eq!(frame.message.frame_no(), Some(9));
            }
            other => panic!("unexpected {other:?}"),
        }

        let request = TaskRecord::new(9, 4, 4, "png").to_request();
        link.send(Outgoing::Message(Message::TaskRequest(request)))
            .unwrap();
        let seq_no = match next_event(&mut events).await {
            Event::Dispatching {
                frame_no, seq_no, ..
            } => {
                assert_eq!(frame_no, 9);
                seq_no
            }
            other => panic!("unexpected {other:?}"),
        };
        let frame = client.recv_required().await.unwrap();
        assert_eq!(frame.seq_no, seq_no);
        assert!(matches!(frame.message, Message::TaskRequest(_)));
    }

    #[tokio::test]
    async fn missing_input_file_reported() {
        let (ctx, mut events) = context("pw");
        let (_client, link) = admitted(ctx, &mut events).await;

        link.send(Outgoing::File {
            frame_no: 3,
            name: "scene.pov".to_string(),
            path: "/nonexistent/scene.pov".into(),
        })
        .unwrap();
        match next_event(&mut events).await {
            Event::FileFailed { frame_no, name, .. } => {
                assert_eq!(frame_no, 3);
                assert_eq!(name, "scene.pov");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(!link.is_closed());
    }

    #[tokio::test]
    async fn disconnect_sends_end_of_stream() {
        let (ctx, mut events) = context("pw");
        let (mut client, link) = admitted(ctx, &mut events).await;

        link.disconnect();
        let frame = client.recv_required().await.unwrap();
        assert_eq!(frame.message, Message::EndOfStream);
        assert!(client.recv().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn peer_close_is_connection_lost() {
        let (ctx, mut events) = context("pw");
        let (client, link) = admitted(ctx, &mut events).await;
        drop(client);

        match next_event(&mut events).await {
            Event::ClientLost { client, kind, .. } => {
                assert_eq!(client, link.id());
                assert_eq!(kind, ErrorKind::ConnectionLost);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn wrong_password_never_reaches_scheduler() {
        let (ctx, mut events) = context("pw");
        let (a, b) = tokio::io::duplex(4096);
        let admitting = tokio::spawn(admit(a, "bad".to_string(), ctx));

        let mut client = Connection::new(b);
        let err = client_handshake(&mut client, "nope", TIMEOUT)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            HandshakeError::Refused(RefuseReason::AuthenticationFailed)
        ));
        admitting.await.unwrap();
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn paused_admission_refuses() {
        let (ctx, mut events) = context("pw");
        ctx.set_accepting(false);
        let (a, b) = tokio::io::duplex(4096);
        tokio::spawn(admit(a, "late".to_string(), ctx));

        let mut client = Connection::new(b);
        let err = client_handshake(&mut client, "pw", TIMEOUT)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            HandshakeError::Refused(RefuseReason::NotAccepting)
        ));
        assert!(events.try_recv().is_err());
    }
}

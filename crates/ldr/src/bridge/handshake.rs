//! Connection handshake.
//!
//! ```text
//! server                                client
//!   ChallengeRequest{id, vers, chal} ->
//!                                    <- ChallengeResponse{id, hmac}
//!   NowConnected{njobs, start}       ->   (authenticated)
//!   ConnectionRefused{reason}, EOS   ->   (refused, closed)
//! ```

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};

use super::auth;
use super::protocol::{Command, IdString, Message, PROTOCOL_VERSION, RefuseReason};
use crate::connection::{Connection, ConnectionError};
use crate::error::ErrorKind;

#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error("handshake timed out")]
    Timeout,
    #[error("unexpected {0:?} during handshake")]
    Unexpected(Command),
    #[error("peer identified as {0:?}")]
    BadIdentity(String),
    #[error("protocol version {theirs} not supported (expected {ours})")]
    VersionMismatch { theirs: u16, ours: u16 },
    #[error("authentication failed")]
    AuthenticationFailed,
    #[error("not accepting new clients")]
    NotAccepting,
    #[error("refused by peer: {0:?}")]
    Refused(RefuseReason),
    #[error("invalid password key")]
    InvalidKey(#[from] auth::InvalidKey),
}

impl HandshakeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::AuthenticationFailed
            | Self::InvalidKey(_)
            | Self::Refused(RefuseReason::AuthenticationFailed) => ErrorKind::AuthenticationFailed,
            Self::Timeout => ErrorKind::Timeout,
            Self::Connection(e) if !e.is_protocol() => ErrorKind::ConnectionLost,
            _ => ErrorKind::ProtocolError,
        }
    }
}

/// Server-side handshake parameters.
#[derive(Debug, Clone)]
pub struct ServerHandshake<'a> {
    pub password: &'a str,
    /// Slots granted to the client.
    pub njobs: u16,
    /// Server start time, milliseconds since the epoch.
    pub start_time: u64,
    pub accepting: bool,
    pub timeout: Duration,
}

/// What the client learns from a successful handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Session {
    pub njobs: u16,
    pub start_time: u64,
}

async fn recv_within<S>(
    conn: &mut Connection<S>,
    timeout: Duration,
) -> Result<Message, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match tokio::time::timeout(timeout, conn.recv_required()).await {
        Ok(frame) => Ok(frame?.message),
        Err(_) => Err(HandshakeError::Timeout),
    }
}

async fn refuse<S>(conn: &mut Connection<S>, reason: RefuseReason)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if let Err(e) = conn.send(Message::ConnectionRefused { reason }).await {
        tracing::debug!(error = %e, "Failed to send ConnectionRefused");
        return;
    }
    if let Err(e) = conn.close().await {
        tracing::debug!(error = %e, "Failed to close refused connection");
    }
}

/// Authenticate an incoming render client.
///
/// On any refusal the connection has already been told why and closed.
pub async fn server_handshake<S>(
    conn: &mut Connection<S>,
    params: &ServerHandshake<'_>,
) -> Result<(), HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let challenge = auth::new_challenge();
    conn.send(Message::ChallengeRequest {
        id: IdString::server(),
        protocol_vers: PROTOCOL_VERSION,
        challenge,
    })
    .await?;

    let (id, response) = match recv_within(conn, params.timeout).await? {
        Message::ChallengeResponse { id, response } => (id, response),
        Message::ConnectionRefused { reason } => return Err(HandshakeError::Refused(reason)),
        other => {
            refuse(conn, RefuseReason::AuthenticationFailed).await;
            return Err(HandshakeError::Unexpected(other.command()));
        }
    };

    if id != IdString::client() {
        refuse(conn, RefuseReason::AuthenticationFailed).await;
        return Err(HandshakeError::BadIdentity(id.as_str()));
    }

    if !auth::verify_response(params.password, &challenge, &response) {
        refuse(conn, RefuseReason::AuthenticationFailed).await;
        return Err(HandshakeError::AuthenticationFailed);
    }

    if !params.accepting {
        refuse(conn, RefuseReason::NotAccepting).await;
        return Err(HandshakeError::NotAccepting);
    }

    conn.send(Message::NowConnected {
        njobs: params.njobs,
        start_time: params.start_time,
    })
    .await?;
    Ok(())
}

/// Authenticate against a server as a render client.
pub async fn client_handshake<S>(
    conn: &mut Connection<S>,
    password: &str,
    timeout: Duration,
) -> Result<Session, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (id, protocol_vers, challenge) = match recv_within(conn, timeout).await? {
        Message::ChallengeRequest {
            id,
            protocol_vers,
            challenge,
        } => (id, protocol_vers, challenge),
        other => return Err(HandshakeError::Unexpected(other.command())),
    };

    if id != IdString::server() {
        return Err(HandshakeError::BadIdentity(id.as_str()));
    }
    if protocol_vers != PROTOCOL_VERSION {
        refuse(conn, RefuseReason::VersionMismatch).await;
        return Err(HandshakeError::VersionMismatch {
            theirs: protocol_vers,
            ours: PROTOCOL_VERSION,
        });
    }

    let response = auth::compute_response(password, &challenge)?;
    conn.send(Message::ChallengeResponse {
        id: IdString::client(),
        response,
    })
    .await?;

    match recv_within(conn, timeout).await? {
        Message::NowConnected { njobs, start_time } => Ok(Session { njobs, start_time }),
        Message::ConnectionRefused { reason } => Err(HandshakeError::Refused(reason)),
        other => Err(HandshakeError::Unexpected(other.command())),
    }
}

//! Per-stream request/response state machine.
//!
//! A [`Session`] wraps one duplex stream and enforces the protocol's shape:
//! `Idle → Reading → Dispatching → Writing → Reading | Closed`. The server
//! role loops `read` / `write`, answering each request with at most one
//! reply; the client role uses [`Session::request`] for a single
//! round-trip, or [`Session::send`] for fire-and-forget messages such as
//! provider announcements.
//!
//! The read that follows a write is armed with the response timeout, so an
//! idle counterpart cannot pin the session open forever.

use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::time::timeout;
use tracing::{trace, warn};

use crate::core::PeerId;
use crate::framing::{read_frame, write_frame};
use crate::host::DhtStream;
use crate::protocol::Message;
use crate::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Reading,
    Dispatching,
    Writing,
    Closed,
}

pub struct Session {
    stream: Box<dyn DhtStream>,
    remote: PeerId,
    state: SessionState,
    response_timeout: Duration,
    /// Set after a write; arms the response timeout on the next read.
    awaiting_response: bool,
    /// Set once the current request has been answered.
    replied: bool,
}

impl Session {
    pub fn new(stream: Box<dyn DhtStream>, remote: PeerId, response_timeout: Duration) -> Self {
        Self {
            stream,
            remote,
            state: SessionState::Idle,
            response_timeout,
            awaiting_response: false,
            replied: false,
        }
    }

    pub fn remote(&self) -> &PeerId {
        &self.remote
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Read and decode the next message.
    ///
    /// Returns `Ok(None)` on a clean end-of-stream. When the previous
    /// operation was a write, the read is bounded by the response timeout
    /// and expiry closes the session with [`Error::Timeout`].
    pub async fn read(&mut self) -> Result<Option<Message>, Error> {
        if self.state == SessionState::Closed {
            return Ok(None);
        }
        self.state = SessionState::Reading;

        let frame = if self.awaiting_response {
            match timeout(self.response_timeout, read_frame(&mut self.stream)).await {
                Ok(read) => read,
                Err(_) => {
                    self.state = SessionState::Closed;
                    return Err(Error::Timeout);
                }
            }
        } else {
            read_frame(&mut self.stream).await
        };
        self.awaiting_response = false;

        let frame = frame.map_err(|e| {
            self.state = SessionState::Closed;
            Error::WireError(e.to_string())
        })?;
        let Some(bytes) = frame else {
            self.state = SessionState::Closed;
            return Ok(None);
        };

        let msg = Message::decode(&bytes).inspect_err(|_| {
            self.state = SessionState::Closed;
        })?;
        trace!(remote = %self.remote, message_type = ?msg.message_type, "session read");
        self.state = SessionState::Dispatching;
        self.replied = false;
        Ok(Some(msg))
    }

    /// Write one reply for the message currently being dispatched.
    ///
    /// A second write for the same request is refused: each query gets at
    /// most one response.
    pub async fn write(&mut self, msg: &Message) -> Result<(), Error> {
        if self.state == SessionState::Closed {
            return Err(Error::Cancelled);
        }
        if self.replied {
            warn!(remote = %self.remote, "dropping duplicate response");
            return Err(Error::Cancelled);
        }
        self.state = SessionState::Writing;
        let bytes = msg.encode()?;
        write_frame(&mut self.stream, &bytes).await.map_err(|e| {
            self.state = SessionState::Closed;
            Error::WireError(e.to_string())
        })?;
        self.replied = true;
        self.awaiting_response = true;
        self.state = SessionState::Reading;
        Ok(())
    }

    /// Client role: send one request and read its single reply, bounded by
    /// `request_timeout`. The session is closed afterwards.
    pub async fn request(
        &mut self,
        msg: &Message,
        request_timeout: Duration,
    ) -> Result<Message, Error> {
        let exchange = async {
            let bytes = msg.encode()?;
            write_frame(&mut self.stream, &bytes)
                .await
                .map_err(|e| Error::WireError(e.to_string()))?;
            match read_frame(&mut self.stream).await {
                Ok(Some(reply)) => Message::decode(&reply),
                Ok(None) => Err(Error::Unreachable),
                Err(e) => Err(Error::WireError(e.to_string())),
            }
        };
        let outcome = timeout(request_timeout, exchange).await;
        match outcome {
            Ok(reply) => {
                self.close().await;
                reply
            }
            Err(_) => {
                self.state = SessionState::Closed;
                Err(Error::Timeout)
            }
        }
    }

    /// Client role: send one message without expecting a reply.
    pub async fn send(&mut self, msg: &Message) -> Result<(), Error> {
        let bytes = msg.encode()?;
        write_frame(&mut self.stream, &bytes)
            .await
            .map_err(|e| Error::WireError(e.to_string()))?;
        self.close().await;
        Ok(())
    }

    pub async fn close(&mut self) {
        if self.state != SessionState::Closed {
            let _ = self.stream.shutdown().await;
            self.state = SessionState::Closed;
        }
    }
}

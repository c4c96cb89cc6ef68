use super::protocol::{self, Request, Response};
use super::transport::{self, Stream};
use super::{Endpoints, TerminalMode};
use crate::error::{ProtocolError, Result, ServiceError};
use crate::lifecycle::{LifecycleState, Outcome, StateChange, Value};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use std::collections::VecDeque;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::{debug, trace};

/// Client side of the relay, used by `--terminal` mode
pub struct TerminalClient {
    framed: Framed<Stream, LengthDelimitedCodec>,
    service: String,
    mode: TerminalMode,
    state: LifecycleState,
    /// Events that arrived while waiting for a reply
    pending: VecDeque<StateChange>,
}

impl TerminalClient {
    /// Connect to the local endpoint, falling back to the global one, and
    /// read the greeting.
    pub async fn connect(endpoints: &Endpoints) -> Result<Self> {
        let stream = match transport::connect(&endpoints.local).await {
            Ok(stream) => stream,
            Err(local_err) => {
                trace!(error = %local_err, "Local terminal endpoint unavailable, trying global");
                transport::connect(&endpoints.global).await?
            }
        };

        let mut framed = Framed::new(stream, protocol::codec());
        match read(&mut framed).await? {
            Some(Response::Hello {
                service,
                mode,
                state,
            }) => {
                debug!(service = %service, mode = ?mode, state = %state, "Attached to service");
                Ok(Self {
                    framed,
                    service,
                    mode,
                    state,
                    pending: VecDeque::new(),
                })
            }
            Some(other) => Err(ProtocolError::Unexpected(format!("{:?}", other)).into()),
            None => Err(ServiceError::Remote(
                "service closed the terminal connection".to_string(),
            )),
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn mode(&self) -> TerminalMode {
        self.mode
    }

    /// Last state reported by the service
    pub fn state(&self) -> LifecycleState {
        self.state
    }

    /// Send a lifecycle verb or callback kind and wait for its outcome.
    pub async fn command(&mut self, kind: &str, args: Vec<Value>) -> Result<Outcome> {
        let response = self
            .request(Request::Command {
                kind: kind.to_string(),
                args,
            })
            .await?;
        match response {
            Response::Outcome {
                result,
                state,
                value,
            } => {
                self.state = state;
                Ok(Outcome {
                    result,
                    state,
                    value,
                })
            }
            other => Err(unexpected(other)),
        }
    }

    /// Start receiving state changes; returns the state at subscription time.
    pub async fn subscribe(&mut self) -> Result<LifecycleState> {
        match self.request(Request::Subscribe).await? {
            Response::Subscribed { state } => {
                self.state = state;
                Ok(state)
            }
            other => Err(unexpected(other)),
        }
    }

    pub async fn unsubscribe(&mut self) -> Result<()> {
        match self.request(Request::Unsubscribe).await? {
            Response::Unsubscribed => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    pub async fn ping(&mut self) -> Result<LifecycleState> {
        match self.request(Request::Ping).await? {
            Response::Pong { state, .. } => {
                self.state = state;
                Ok(state)
            }
            other => Err(unexpected(other)),
        }
    }

    /// Next state change; `None` once the service closes the connection.
    pub async fn next_event(&mut self) -> Result<Option<StateChange>> {
        if let Some(change) = self.pending.pop_front() {
            return Ok(Some(change));
        }
        loop {
            match read(&mut self.framed).await? {
                Some(Response::StateChanged { from, to }) => {
                    self.state = to;
                    return Ok(Some(StateChange { from, to }));
                }
                Some(other) => trace!(response = ?other, "Ignoring non-event frame"),
                None => return Ok(None),
            }
        }
    }

    async fn request(&mut self, request: Request) -> Result<Response> {
        let bytes = protocol::encode_request(&request)?;
        self.framed
            .send(Bytes::from(bytes))
            .await
            .map_err(ProtocolError::from)?;

        loop {
            match read(&mut self.framed).await? {
                Some(Response::StateChanged { from, to }) => {
                    self.pending.push_back(StateChange { from, to });
                }
                Some(Response::Refused { reason }) => return Err(ServiceError::Remote(reason)),
                Some(Response::Error { message }) => return Err(ServiceError::Remote(message)),
                Some(response) => return Ok(response),
                None => return Err(ProtocolError::Closed.into()),
            }
        }
    }
}

async fn read(framed: &mut Framed<Stream, LengthDelimitedCodec>) -> Result<Option<Response>> {
    match framed.next().await {
        None => Ok(None),
        Some(Err(e)) if e.kind() == std::io::ErrorKind::ConnectionReset => Ok(None),
        Some(Err(e)) => Err(ProtocolError::from(e).into()),
        Some(Ok(frame)) => Ok(Some(protocol::decode_response(&frame)?)),
    }
}

fn unexpected(response: Response) -> ServiceError {
    ProtocolError::Unexpected(format!("{:?}", response)).into()
}

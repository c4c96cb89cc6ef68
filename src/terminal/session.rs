use super::protocol::{self, Request, Response};
use super::{TerminalInfo, TerminalMode};
use crate::error::ProtocolError;
use crate::lifecycle::{Command, LifecycleCore, StateChange, StateSubscription};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Protocol handler for one attached terminal.
///
/// Requests are handled strictly one at a time. The cancellation token is
/// only observed between requests, so a command that already started always
/// gets its reply written.
pub struct TerminalSession<S> {
    info: TerminalInfo,
    service_name: String,
    core: Arc<LifecycleCore>,
    framed: Framed<S, LengthDelimitedCodec>,
    subscription: Option<StateSubscription>,
    cancel: CancellationToken,
}

impl<S> TerminalSession<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(
        stream: S,
        info: TerminalInfo,
        service_name: impl Into<String>,
        core: Arc<LifecycleCore>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            info,
            service_name: service_name.into(),
            core,
            framed: Framed::new(stream, protocol::codec()),
            subscription: None,
            cancel,
        }
    }

    pub fn info(&self) -> &TerminalInfo {
        &self.info
    }

    /// Serve the connection until the peer closes it, a protocol violation
    /// occurs, or the token is cancelled.
    pub async fn run(mut self) -> Result<(), ProtocolError> {
        let id = self.info.id;
        debug!(terminal = id, mode = ?self.info.mode, "Terminal session started");

        let result = self.serve().await;

        // Reap the subscriber before the connection slot is released
        if let Some(subscription) = self.subscription.take() {
            self.core.unsubscribe(subscription.id());
        }

        match &result {
            Ok(()) => debug!(terminal = id, "Terminal session ended"),
            Err(e) => warn!(terminal = id, error = %e, "Terminal session aborted"),
        }
        result
    }

    async fn serve(&mut self) -> Result<(), ProtocolError> {
        let hello = Response::Hello {
            service: self.service_name.clone(),
            mode: self.info.mode,
            state: self.core.state(),
        };
        self.send(&hello).await?;

        if self.info.mode == TerminalMode::ReadWriteActive {
            self.subscription = Some(self.core.subscribe());
        }

        loop {
            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => {
                    debug!(terminal = self.info.id, "Terminal session cancelled");
                    return Ok(());
                }

                change = next_change(&mut self.subscription) => match change {
                    Some(change) => {
                        self.send(&Response::StateChanged { from: change.from, to: change.to }).await?;
                    }
                    None => self.subscription = None,
                },

                frame = self.framed.next() => match frame {
                    None => return Ok(()),
                    Some(Err(e)) => return Err(e.into()),
                    Some(Ok(bytes)) => {
                        let request = match protocol::decode_request(&bytes) {
                            Ok(request) => request,
                            Err(e) => {
                                let _ = self.send(&Response::Error { message: e.to_string() }).await;
                                return Err(e);
                            }
                        };
                        let response = self.handle(request).await;
                        self.flush_changes().await?;
                        self.send(&response).await?;
                    }
                },
            }
        }
    }

    async fn handle(&mut self, request: Request) -> Response {
        trace!(terminal = self.info.id, request = ?request, "Handling terminal request");
        match request {
            Request::Command { kind, args } => {
                if !self.info.mode.can_command() {
                    return Response::Refused {
                        reason: "terminal is read-only".to_string(),
                    };
                }
                match self.core.dispatch(Command::parse(&kind, args)).await {
                    Ok(outcome) => Response::Outcome {
                        result: outcome.result,
                        state: outcome.state,
                        value: outcome.value,
                    },
                    Err(e) => Response::Error {
                        message: e.to_string(),
                    },
                }
            }

            Request::Subscribe => {
                if !self.info.mode.can_subscribe() {
                    return Response::Refused {
                        reason: "terminal is write-only".to_string(),
                    };
                }
                if self.subscription.is_none() {
                    self.subscription = Some(self.core.subscribe());
                }
                Response::Subscribed {
                    state: self.core.state(),
                }
            }

            Request::Unsubscribe => {
                self.subscription = None;
                Response::Unsubscribed
            }

            Request::Ping => Response::Pong {
                service: self.service_name.clone(),
                state: self.core.state(),
            },
        }
    }

    /// Write out changes already queued, so a command's own events precede
    /// its reply.
    async fn flush_changes(&mut self) -> Result<(), ProtocolError> {
        loop {
            let Some(change) = self.subscription.as_mut().and_then(StateSubscription::try_recv)
            else {
                return Ok(());
            };
            self.send(&Response::StateChanged {
                from: change.from,
                to: change.to,
            })
            .await?;
        }
    }

    async fn send(&mut self, response: &Response) -> Result<(), ProtocolError> {
        let bytes = protocol::encode_response(response)?;
        self.framed.send(Bytes::from(bytes)).await?;
        Ok(())
    }
}

async fn next_change(subscription: &mut Option<StateSubscription>) -> Option<StateChange> {
    match subscription {
        Some(subscription) => subscription.recv().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::machine::tests::ScriptedHooks;
    use crate::lifecycle::{CommandResult, LifecycleState, Value};
    use crate::terminal::TerminalScope;
    use tokio::io::DuplexStream;
    use tokio::task::JoinHandle;

    struct Peer {
        framed: Framed<DuplexStream, LengthDelimitedCodec>,
    }

    impl Peer {
        async fn send(&mut self, request: Request) {
            let bytes = protocol::encode_request(&request).unwrap();
            self.framed.send(Bytes::from(bytes)).await.unwrap();
        }

        async fn recv(&mut self) -> Option<Response> {
            let frame = self.framed.next().await?.unwrap();
            Some(protocol::decode_response(&frame).unwrap())
        }

        /// Next non-event frame
        async fn reply(&mut self) -> Response {
            loop {
                let response = self.recv().await.unwrap();
                if !response.is_event() {
                    return response;
                }
            }
        }
    }

    fn spawn_session(
        core: &Arc<LifecycleCore>,
        mode: TerminalMode,
        cancel: CancellationToken,
    ) -> (Peer, JoinHandle<Result<(), ProtocolError>>) {
        let (server, client) = tokio::io::duplex(64 * 1024);
        let info = TerminalInfo {
            id: 1,
            scope: TerminalScope::Local,
            mode,
            peer_uid: None,
        };
        let session = TerminalSession::new(server, info, "svcA", Arc::clone(core), cancel);
        let handle = tokio::spawn(session.run());
        let peer = Peer {
            framed: Framed::new(client, protocol::codec()),
        };
        (peer, handle)
    }

    fn running_core() -> Arc<LifecycleCore> {
        LifecycleCore::new(Arc::new(ScriptedHooks::default()))
    }

    #[tokio::test]
    async fn test_hello_then_command() {
        let core = running_core();
        core.start().await.unwrap();
        let (mut peer, _handle) =
            spawn_session(&core, TerminalMode::ReadWritePassive, CancellationToken::new());

        assert_eq!(
            peer.recv().await.unwrap(),
            Response::Hello {
                service: "svcA".to_string(),
                mode: TerminalMode::ReadWritePassive,
                state: LifecycleState::Running,
            }
        );

        peer.send(Request::Command {
            kind: "pause".to_string(),
            args: vec![],
        })
        .await;
        assert_eq!(
            peer.reply().await,
            Response::Outcome {
                result: CommandResult::Completed,
                state: LifecycleState::Paused,
                value: Value::Null,
            }
        );
        assert_eq!(core.state(), LifecycleState::Paused);
    }

    #[tokio::test]
    async fn test_illegal_command_is_error_reply() {
        let core = running_core();
        let (mut peer, _handle) =
            spawn_session(&core, TerminalMode::ReadWritePassive, CancellationToken::new());
        peer.recv().await.unwrap();

        peer.send(Request::Command {
            kind: "pause".to_string(),
            args: vec![],
        })
        .await;
        assert!(matches!(peer.reply().await, Response::Error { .. }));
        assert_eq!(core.state(), LifecycleState::Created);
    }

    #[tokio::test]
    async fn test_read_only_refuses_commands() {
        let core = running_core();
        core.start().await.unwrap();
        let (mut peer, _handle) =
            spawn_session(&core, TerminalMode::ReadOnly, CancellationToken::new());
        peer.recv().await.unwrap();

        peer.send(Request::Command {
            kind: "stop".to_string(),
            args: vec![],
        })
        .await;
        assert!(matches!(peer.reply().await, Response::Refused { .. }));
        assert_eq!(core.state(), LifecycleState::Running);
    }

    #[tokio::test]
    async fn test_write_only_refuses_subscribe() {
        let core = running_core();
        let (mut peer, _handle) =
            spawn_session(&core, TerminalMode::WriteOnly, CancellationToken::new());
        peer.recv().await.unwrap();

        peer.send(Request::Subscribe).await;
        assert!(matches!(peer.reply().await, Response::Refused { .. }));
        assert_eq!(core.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_active_mode_streams_events() {
        let core = running_core();
        let (mut peer, _handle) =
            spawn_session(&core, TerminalMode::ReadWriteActive, CancellationToken::new());
        peer.recv().await.unwrap();
        peer.send(Request::Ping).await;
        assert!(matches!(peer.reply().await, Response::Pong { .. }));

        core.start().await.unwrap();
        assert_eq!(
            peer.recv().await.unwrap(),
            Response::StateChanged {
                from: LifecycleState::Created,
                to: LifecycleState::Starting,
            }
        );
        assert_eq!(
            peer.recv().await.unwrap(),
            Response::StateChanged {
                from: LifecycleState::Starting,
                to: LifecycleState::Running,
            }
        );
    }

    #[tokio::test]
    async fn test_own_events_precede_outcome() {
        let core = running_core();
        core.start().await.unwrap();
        let (mut peer, _handle) =
            spawn_session(&core, TerminalMode::ReadWriteActive, CancellationToken::new());
        peer.recv().await.unwrap();

        peer.send(Request::Command {
            kind: "pause".to_string(),
            args: vec![],
        })
        .await;
        assert_eq!(
            peer.recv().await.unwrap(),
            Response::StateChanged {
                from: LifecycleState::Running,
                to: LifecycleState::Pausing,
            }
        );
        assert_eq!(
            peer.recv().await.unwrap(),
            Response::StateChanged {
                from: LifecycleState::Pausing,
                to: LifecycleState::Paused,
            }
        );
        assert!(matches!(
            peer.recv().await.unwrap(),
            Response::Outcome {
                state: LifecycleState::Paused,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_disconnect_reaps_subscriber() {
        let core = running_core();
        let (mut peer, handle) =
            spawn_session(&core, TerminalMode::ReadWritePassive, CancellationToken::new());
        peer.recv().await.unwrap();
        peer.send(Request::Subscribe).await;
        assert!(matches!(peer.reply().await, Response::Subscribed { .. }));
        assert_eq!(core.subscriber_count(), 1);

        drop(peer);
        handle.await.unwrap().unwrap();
        assert_eq!(core.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_garbage_frame_ends_only_this_session() {
        let core = running_core();
        let (mut bad, bad_handle) =
            spawn_session(&core, TerminalMode::ReadWritePassive, CancellationToken::new());
        let (mut good, _good_handle) =
            spawn_session(&core, TerminalMode::ReadWritePassive, CancellationToken::new());
        bad.recv().await.unwrap();
        good.recv().await.unwrap();

        bad.framed
            .send(Bytes::from_static(&[0xde, 0xad, 0xbe, 0xef]))
            .await
            .unwrap();
        assert!(matches!(bad.recv().await, Some(Response::Error { .. })));
        assert!(bad_handle.await.unwrap().is_err());

        good.send(Request::Command {
            kind: "start".to_string(),
            args: vec![],
        })
        .await;
        assert!(matches!(
            good.reply().await,
            Response::Outcome {
                state: LifecycleState::Running,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_cancel_ends_idle_session() {
        let core = running_core();
        let cancel = CancellationToken::new();
        let (mut peer, handle) = spawn_session(&core, TerminalMode::ReadWriteActive, cancel.clone());
        peer.recv().await.unwrap();
        assert_eq!(core.subscriber_count(), 1);

        cancel.cancel();
        handle.await.unwrap().unwrap();
        assert_eq!(core.subscriber_count(), 0);
        assert!(peer.recv().await.is_none());
    }
}

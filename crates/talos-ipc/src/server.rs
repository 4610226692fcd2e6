//! The IPC socket server.
//!
//! One Unix domain socket per engine. Every connection authenticates with a
//! service token before anything else; after that, requests update the
//! subscription hub and events stream back over the same connection.

#![cfg(unix)]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;

use crate::auth::AuthTokenRegistry;
use crate::error::{IpcError, Result};
use crate::frame::{read_message, write_message};
use crate::hub::SubscriptionHub;
use crate::protocol::{Event, Request, Response, ServerMessage};

/// The engine's IPC server.
pub struct IpcServer {
    listener: UnixListener,
    path: PathBuf,
    hub: Arc<SubscriptionHub>,
    auth: Arc<AuthTokenRegistry>,
}

impl IpcServer {
    /// Binds the socket at `path`, replacing any stale socket file.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket cannot be bound.
    pub fn bind(
        path: impl AsRef<Path>,
        hub: Arc<SubscriptionHub>,
        auth: Arc<AuthTokenRegistry>,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if path.exists() {
            std::fs::remove_file(&path)?;
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let listener = UnixListener::bind(&path)?;
        tracing::info!(path = ?path, "IPC server listening");
        Ok(Self {
            listener,
            path,
            hub,
            auth,
        })
    }

    /// The socket path services connect to.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Accepts connections until the task is aborted.
    pub async fn run(self) {
        loop {
            match self.listener.accept().await {
                Ok((stream, _addr)) => {
                    let hub = self.hub.clone();
                    let auth = self.auth.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, hub, auth).await {
                            tracing::debug!(error = %e, "IPC connection ended with error");
                        }
                    });
                }
                Err(e) => {
                    tracing::warn!(error = %e, "IPC accept failed");
                }
            }
        }
    }
}

async fn handle_connection(
    stream: UnixStream,
    hub: Arc<SubscriptionHub>,
    auth: Arc<AuthTokenRegistry>,
) -> Result<()> {
    let (mut reader, mut writer) = stream.into_split();

    let service = authenticate(&mut reader, &mut writer, &auth).await?;
    tracing::debug!(service = %service, "IPC connection authenticated");

    let (event_tx, event_rx) = SubscriptionHub::event_channel();
    let result = serve(&mut reader, &mut writer, &hub, &service, &event_tx, event_rx).await;

    hub.unsubscribe_all(&service);
    tracing::debug!(service = %service, "IPC connection closed");
    result
}

async fn authenticate(
    reader: &mut OwnedReadHalf,
    writer: &mut OwnedWriteHalf,
    auth: &AuthTokenRegistry,
) -> Result<String> {
    let first: Option<Request> = read_message(reader).await?;
    let Some(Request::Authenticate { token }) = first else {
        let reason = "first request must be authenticate".to_string();
        let _ = write_message(
            writer,
            &ServerMessage::Response(Response::Error {
                message: reason.clone(),
            }),
        )
        .await;
        return Err(IpcError::Unauthenticated { reason });
    };

    match auth.validate(&token) {
        Some(service) => {
            write_message(writer, &ServerMessage::Response(Response::Ok)).await?;
            Ok(service)
        }
        None => {
            let reason = "unknown or revoked token".to_string();
            let _ = write_message(
                writer,
                &ServerMessage::Response(Response::Error {
                    message: reason.clone(),
                }),
            )
            .await;
            Err(IpcError::Unauthenticated { reason })
        }
    }
}

async fn serve(
    reader: &mut OwnedReadHalf,
    writer: &mut OwnedWriteHalf,
    hub: &SubscriptionHub,
    service: &str,
    event_tx: &mpsc::Sender<Event>,
    mut event_rx: mpsc::Receiver<Event>,
) -> Result<()> {
    loop {
        tokio::select! {
            request = read_message::<_, Request>(reader) => {
                let Some(request) = request? else {
                    return Ok(());
                };
                let response = handle_request(hub, service, event_tx, request);
                write_message(writer, &ServerMessage::Response(response)).await?;
            }
            event = event_rx.recv() => {
                let Some(event) = event else {
                    return Ok(());
                };
                write_message(writer, &ServerMessage::Event(event)).await?;
            }
        }
    }
}

fn handle_request(
    hub: &SubscriptionHub,
    service: &str,
    event_tx: &mpsc::Sender<Event>,
    request: Request,
) -> Response {
    match request {
        Request::Authenticate { .. } => Response::Error {
            message: "already authenticated".to_string(),
        },
        Request::SubscribeToComponentUpdates => {
            hub.subscribe_component_updates(service, event_tx.clone());
            Response::Ok
        }
        Request::SubscribeToValidateConfigurationUpdates => {
            hub.subscribe_validate_configuration(service, event_tx.clone());
            Response::Ok
        }
        Request::DeferComponentUpdate {
            deployment_id,
            recheck_after_ms,
            message,
        } => {
            hub.record_deferral(
                &deployment_id,
                service,
                std::time::Duration::from_millis(recheck_after_ms),
                message,
            );
            Response::Ok
        }
        Request::SendConfigurationValidityReport {
            deployment_id,
            status,
            message,
        } => {
            hub.record_validity_report(&deployment_id, service, status, message);
            Response::Ok
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ValidityStatus;
    use std::time::Duration;
    use talos_lifecycle::UpdateGate;

    async fn send(stream: &mut UnixStream, request: &Request) -> ServerMessage {
        let (mut reader, mut writer) = stream.split();
        crate::frame::write_message(&mut writer, request).await.unwrap();
        crate::frame::read_message(&mut reader).await.unwrap().unwrap()
    }

    async fn read_server_message(stream: &mut UnixStream) -> ServerMessage {
        let (mut reader, _) = stream.split();
        crate::frame::read_message(&mut reader).await.unwrap().unwrap()
    }

    fn start_server() -> (
        tempfile::TempDir,
        Arc<SubscriptionHub>,
        Arc<AuthTokenRegistry>,
        PathBuf,
    ) {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("ipc.sock");
        let hub = Arc::new(SubscriptionHub::new().with_response_window(Duration::from_millis(20)));
        let auth = Arc::new(AuthTokenRegistry::new());

        let server = IpcServer::bind(&socket, hub.clone(), auth.clone()).unwrap();
        tokio::spawn(server.run());
        (dir, hub, auth, socket)
    }

    #[tokio::test]
    async fn test_rejects_bad_token() {
        let (_dir, _hub, _auth, socket) = start_server();

        let mut stream = UnixStream::connect(&socket).await.unwrap();
        let response = send(
            &mut stream,
            &Request::Authenticate {
                token: "bogus".to_string(),
            },
        )
        .await;
        assert!(matches!(
            response,
            ServerMessage::Response(Response::Error { .. })
        ));
    }

    #[tokio::test]
    async fn test_defer_round_trip_over_socket() {
        let (_dir, hub, auth, socket) = start_server();
        let token = auth.issue("signal-hub");

        let mut stream = UnixStream::connect(&socket).await.unwrap();
        let response = send(&mut stream, &Request::Authenticate { token }).await;
        assert_eq!(response, ServerMessage::Response(Response::Ok));

        let response = send(&mut stream, &Request::SubscribeToComponentUpdates).await;
        assert_eq!(response, ServerMessage::Response(Response::Ok));

        // Client loop: on PreUpdate, defer by 7s.
        let client = tokio::spawn(async move {
            let message = read_server_message(&mut stream).await;
            let ServerMessage::Event(Event::PreUpdate { deployment_id }) = message else {
                panic!("expected preUpdate, got {message:?}");
            };
            let response = send(
                &mut stream,
                &Request::DeferComponentUpdate {
                    deployment_id,
                    recheck_after_ms: 7000,
                    message: Some("finishing upload".to_string()),
                },
            )
            .await;
            assert_eq!(response, ServerMessage::Response(Response::Ok));
        });

        let deferrals = hub.poll_pre_update("d-1").await;
        client.await.unwrap();

        assert_eq!(deferrals.len(), 1);
        assert_eq!(deferrals[0].component, "signal-hub");
        assert_eq!(deferrals[0].recheck_after, Duration::from_secs(7));
    }

    #[tokio::test]
    async fn test_validity_report_over_socket() {
        let (_dir, hub, auth, socket) = start_server();
        let token = auth.issue("signal-hub");

        let mut stream = UnixStream::connect(&socket).await.unwrap();
        send(&mut stream, &Request::Authenticate { token }).await;
        send(
            &mut stream,
            &Request::SubscribeToValidateConfigurationUpdates,
        )
        .await;

        let client = tokio::spawn(async move {
            let message = read_server_message(&mut stream).await;
            let ServerMessage::Event(Event::ValidateConfiguration { deployment_id, .. }) =
                message
            else {
                panic!("expected validateConfiguration, got {message:?}");
            };
            send(
                &mut stream,
                &Request::SendConfigurationValidityReport {
                    deployment_id,
                    status: ValidityStatus::Accepted,
                    message: None,
                },
            )
            .await;
        });

        let mut proposals = std::collections::BTreeMap::new();
        proposals.insert("signal-hub".to_string(), serde_json::json!({"interval": 5}));

        use crate::hub::ConfigurationValidator;
        hub.validate("d-2", &proposals, Duration::from_secs(2))
            .await
            .unwrap();
        client.await.unwrap();
    }

    #[tokio::test]
    async fn test_disconnect_clears_subscriptions() {
        let (_dir, hub, auth, socket) = start_server();
        let token = auth.issue("signal-hub");

        let mut stream = UnixStream::connect(&socket).await.unwrap();
        send(&mut stream, &Request::Authenticate { token }).await;
        send(&mut stream, &Request::SubscribeToComponentUpdates).await;
        assert!(hub.has_update_subscribers());

        drop(stream);
        // Give the server task a moment to observe the close.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!hub.has_update_subscribers());
    }
}

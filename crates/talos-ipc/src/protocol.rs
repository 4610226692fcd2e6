//! The IPC protocol.
//!
//! Clients open the engine's Unix socket, authenticate with their service
//! token, then exchange typed messages: requests flow client → engine,
//! responses and events flow engine → client. All messages are JSON bodies
//! in length-prefixed frames.

use serde::{Deserialize, Serialize};

/// Environment variable carrying a service's IPC auth token.
pub const AUTH_TOKEN_ENV: &str = "TALOS_AUTH_TOKEN";

/// Environment variable carrying the engine's socket path.
pub const SOCKET_PATH_ENV: &str = "TALOS_IPC_SOCKET";

/// A component's verdict on a proposed configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ValidityStatus {
    /// The component accepts the proposed configuration.
    Accepted,

    /// The component rejects it; the deployment aborts.
    Rejected,
}

/// Client → engine messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "operation", rename_all = "camelCase")]
pub enum Request {
    /// First message on every connection.
    Authenticate {
        /// Bearer token issued at service launch.
        token: String,
    },

    /// Subscribe to `pre_update`/`post_update` events.
    SubscribeToComponentUpdates,

    /// Ask the engine to postpone an update.
    #[serde(rename_all = "camelCase")]
    DeferComponentUpdate {
        /// Deployment being deferred.
        deployment_id: String,

        /// How long to wait before polling again, in milliseconds.
        recheck_after_ms: u64,

        /// Operator-facing reason.
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },

    /// Subscribe to configuration validation round-trips.
    SubscribeToValidateConfigurationUpdates,

    /// Report a verdict on a proposed configuration.
    #[serde(rename_all = "camelCase")]
    SendConfigurationValidityReport {
        /// Deployment the proposal belongs to.
        deployment_id: String,

        /// Accept or reject.
        status: ValidityStatus,

        /// Rejection reason, surfaced in the deployment failure cause.
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
}

/// Engine → client responses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "camelCase")]
pub enum Response {
    /// The request was applied.
    Ok,

    /// The request failed.
    #[serde(rename_all = "camelCase")]
    Error {
        /// Failure reason.
        message: String,
    },
}

/// Engine → client events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum Event {
    /// A disruptive deployment wants to proceed; subscribers may defer.
    #[serde(rename_all = "camelCase")]
    PreUpdate {
        /// Deployment about to apply.
        deployment_id: String,
    },

    /// The deployment is proceeding.
    #[serde(rename_all = "camelCase")]
    PostUpdate {
        /// Deployment that proceeded.
        deployment_id: String,
    },

    /// A proposed configuration awaits this component's verdict.
    #[serde(rename_all = "camelCase")]
    ValidateConfiguration {
        /// Deployment proposing the change.
        deployment_id: String,

        /// The configuration the component would receive.
        proposed_configuration: serde_json::Value,
    },
}

/// Engine → client stream: either a direct response or a pushed event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ServerMessage {
    /// Response to the client's most recent request.
    Response(Response),

    /// Asynchronously pushed event.
    Event(Event),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_wire_shape() {
        let request = Request::DeferComponentUpdate {
            deployment_id: "d-1".to_string(),
            recheck_after_ms: 7000,
            message: Some("flushing".to_string()),
        };

        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(
            json,
            json!({
                "operation": "deferComponentUpdate",
                "deploymentId": "d-1",
                "recheckAfterMs": 7000,
                "message": "flushing"
            })
        );
    }

    #[test]
    fn test_subscribe_request_round_trip() {
        let json = r#"{"operation":"subscribeToComponentUpdates"}"#;
        let request: Request = serde_json::from_str(json).unwrap();
        assert_eq!(request, Request::SubscribeToComponentUpdates);
    }

    #[test]
    fn test_validity_report_round_trip() {
        let request = Request::SendConfigurationValidityReport {
            deployment_id: "d-2".to_string(),
            status: ValidityStatus::Rejected,
            message: Some("port already bound".to_string()),
        };
        let json = serde_json::to_string(&request).unwrap();
        assert!(json.contains(r#""status":"REJECTED""#));

        let back: Request = serde_json::from_str(&json).unwrap();
        assert_eq!(back, request);
    }

    #[test]
    fn test_event_wire_shape() {
        let event = Event::ValidateConfiguration {
            deployment_id: "d-3".to_string(),
            proposed_configuration: json!({"interval": 30}),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "validateConfiguration");
        assert_eq!(json["proposedConfiguration"]["interval"], 30);
    }

    #[test]
    fn test_server_message_distinguishes_response_and_event() {
        let response: ServerMessage =
            serde_json::from_str(r#"{"result":"ok"}"#).unwrap();
        assert_eq!(response, ServerMessage::Response(Response::Ok));

        let event: ServerMessage =
            serde_json::from_str(r#"{"event":"postUpdate","deploymentId":"d-1"}"#).unwrap();
        assert!(matches!(event, ServerMessage::Event(Event::PostUpdate { .. })));
    }
}

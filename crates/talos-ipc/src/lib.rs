//! # Talos IPC
//!
//! The narrow IPC surface the Talos engine exposes to managed components.
//!
//! Components connect to a per-device Unix domain socket and speak a
//! length-prefixed JSON protocol with four operations:
//! `subscribeToComponentUpdates`, `deferComponentUpdate`,
//! `subscribeToValidateConfigurationUpdates` and
//! `sendConfigurationValidityReport`. Every connection authenticates with a
//! bearer token issued per service at launch and handed over through the
//! service's environment ([`AUTH_TOKEN_ENV`]).
//!
//! The [`SubscriptionHub`] is the in-process half: it implements the
//! lifecycle executor's update gate and the merger's
//! [`ConfigurationValidator`], so the deployment pipeline never touches
//! sockets directly.

pub mod auth;
pub mod error;
pub mod frame;
pub mod hub;
pub mod protocol;
#[cfg(unix)]
pub mod server;

// Re-export main types at crate root
pub use auth::AuthTokenRegistry;
pub use error::{IpcError, Result};
pub use frame::{read_frame, read_message, write_frame, write_message, MAX_FRAME_SIZE};
pub use hub::{
    ConfigurationValidator, SubscriptionHub, ValidationFailure, DEFAULT_RESPONSE_WINDOW,
};
pub use protocol::{
    Event, Request, Response, ServerMessage, ValidityStatus, AUTH_TOKEN_ENV, SOCKET_PATH_ENV,
};
#[cfg(unix)]
pub use server::IpcServer;

//! Event distribution and control surface.
//!
//! - [`Distributor`] fans the ordered reader event stream out to every
//!   subscriber, each starting with a status snapshot.
//! - [`ControlServer`] serves the HTTP control routes and the WebSocket
//!   event channel on one listener.
//!
//! The server never touches hardware; it talks to the scan service through
//! its [`ServiceHandle`](tagbridge_session::ServiceHandle) and to the
//! distributor through a [`DistributorHandle`].

pub mod config;
pub mod control;
pub mod distributor;
pub mod error;
pub mod routes;
pub mod server;
pub mod ws;

pub use config::ServerConfig;
pub use distributor::{Distributor, DistributorHandle, SubscriberId, Subscription};
pub use error::{Result, ServerError};
pub use routes::{AppState, NO_TAG_READ, SERVICE_NAME, router};
pub use server::ControlServer;
pub use ws::INVALID_MESSAGE;

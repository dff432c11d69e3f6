//! Client core for the project builder: a session mirror, the controller that
//! drives it, and the HTTP gateway to the builder backend.

pub mod config;
pub mod controller;
pub mod error;
pub mod gateway;
pub mod http_gateway;
pub mod notifier;
pub mod persistence;
pub mod store;
pub mod upload;

pub use config::{load_settings, ClientSettings, InFlightPolicy};
pub use controller::{Controller, ControllerOptions, Intent, IntentKind};
pub use error::{ControllerError, TransportError, TransportErrorKind, ValidationError};
pub use gateway::{Action, RemoteGateway, ServerDelta, SessionHandle, StartConfig, UploadFile};
pub use http_gateway::HttpGateway;
pub use notifier::{Notifier, Subscription};
pub use persistence::{load_snapshot, save_snapshot};
pub use store::SessionStore;

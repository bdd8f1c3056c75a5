//! §4.10's RPC surface, transport-agnostic: request/response contracts, the
//! `OrchestratorService` trait, the streaming contracts, and the §4.11 HMAC
//! bearer-token auth interceptor. No concrete wire codec lives here — a
//! binary mounts [`OrchestratorService`] behind whatever transport it likes.

pub mod auth;
pub mod contracts;
pub mod error;
pub mod service;
pub mod stream;

pub use auth::AuthInterceptor;
pub use contracts::*;
pub use error::{OrchError, OrchResult, Status, status_of};
pub use service::OrchestratorService;
pub use stream::{LabEvent, LabEventBus, LabStream, MonitorPing, MonitorStream, MonitorUpdate};

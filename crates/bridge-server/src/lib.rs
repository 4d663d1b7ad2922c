//! WebSocket bridge between chat clients and a streaming [`Pipeline`].
//!
//! Each accepted socket becomes a [`Session`]. Every message frame runs one
//! [`Invocation`], whose pipeline events are mapped to wire frames by
//! [`translate`].
//!
//! [`Pipeline`]: bridge_core::Pipeline

pub mod config;
pub mod connection;
pub mod errors;
pub mod invocation;
pub mod registry;
pub mod server;
pub mod session;
pub mod shutdown;
pub mod translator;

pub use config::ServerConfig;
pub use connection::{Connection, ConnectionError, Frame, WsConnection};
pub use errors::{FrameError, SessionError};
pub use invocation::{Invocation, InvocationSummary};
pub use registry::{SessionEntry, SessionRegistry};
pub use server::{build_router, start, AppState, ServerHandle, SessionTasks};
pub use session::{
    CloseReason, FrameAction, FrameOutcome, Session, SessionContext, SessionReport, SessionState,
};
pub use shutdown::ShutdownCoordinator;
pub use translator::{translate, Transcript, Translation};

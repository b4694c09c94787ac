// src/lib.rs — Library root for wharf

pub mod cli;
pub mod db;
pub mod dispatch;
pub mod future_calls;
pub mod infra;
pub mod resources;
pub mod retention;
pub mod session;

pub use dispatch::{Dispatched, Dispatcher, StreamSession};
pub use infra::config::ServerConfig;
pub use infra::errors::{Result, WharfError};
pub use resources::SharedResources;
pub use session::{Session, SessionFactory, SessionKind, SessionState};

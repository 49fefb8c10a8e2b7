//! Backend leg of a session
//!
//! This module provides:
//! - `BackendExecutor`: the connect / execute / close seam the session drives
//! - `BackendConnManager`: a pass-through implementation over TCP with
//!   optional TLS on both legs

mod conn_manager;
mod error;
mod executor;

pub use conn_manager::{BackendConnManager, BackendConnOptions};
pub use error::BackendError;
pub use executor::BackendExecutor;

//! Backend health checking
//!
//! This module provides:
//! - Periodic login checks of every distinct backend address
//! - Marking a backend unhealthy after consecutive failures so routers skip it

mod checker;
mod state;

pub use checker::{check_backend, CheckError, HealthChecker};
pub use state::{CheckState, HealthStatus};

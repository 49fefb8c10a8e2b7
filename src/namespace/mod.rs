//! Routing domains and backend selection
//!
//! A namespace groups the backends a client may be sent to. Each namespace
//! owns a `Router`; the `NamespaceManager` resolves namespaces by name.

mod manager;
pub(crate) mod router;

pub use manager::{Namespace, NamespaceManager};
pub use router::{
    BackendInstance, BalancedRouter, ConnEventReceiver, RoutableConn, Router, RouterError,
};

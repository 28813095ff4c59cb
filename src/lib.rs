pub mod adapter;
pub mod auth;
pub mod config;
pub mod emitter;
pub mod error;
pub mod load;
pub mod message;
pub mod metrics;
pub mod policy;
pub mod pool;
pub mod publish;
pub mod request;
pub mod socket;
pub mod tracker;
pub mod transport;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

// Re-export commonly used items
pub use adapter::{Adapter, AdapterContext, LocalRelay, LOCAL_RELAY_URL};
pub use auth::{AuthManager, AuthState, AuthStatus, Signer};
pub use emitter::{Emitter, Unsubscriber};
pub use error::{Error, Result};
pub use load::{union_filters, LoadOptions, Loader};
pub use message::{ClientMessage, RelayMessage, AUTH_JOIN};
pub use pool::Pool;
pub use publish::{publish, Multicast, PublishEvent, PublishOptions, PublishStatus, Unicast};
pub use request::{fetch, Multireq, MultireqEvent, RequestEvent, RequestOptions, Unireq};
pub use socket::{Socket, SocketEvent, SocketStatus};
pub use tracker::Tracker;

//! Coordination client: lease-backed service registration and discovery,
//! and distributed locks, over any [`pkg_state::CoordStore`].

pub mod codec;
pub mod connection;
pub mod context;
pub mod discovery;
pub mod error;
pub mod lease;
pub mod lock;
pub mod manager;
pub mod mutex;
pub mod options;
pub mod registry;
pub mod resilient;

pub use connection::ConnectionManager;
pub use discovery::{Connection, Dialer, ServiceDiscovery, TcpDialer};
pub use error::{CoordError, ErrorKind, Result, codes, retry_delay};
pub use lease::{KeepAliveAck, LeaseManager};
pub use lock::DistributedLock;
pub use manager::{Components, CoordManager};
pub use mutex::{SequencedMutex, Session};
pub use options::{DiscoveryOptions, ManagerBuilder, ManagerOptions, RegisterOptions, RetryConfig};
pub use registry::ServiceRegistry;
pub use resilient::{ResilientWatch, ServiceSource};

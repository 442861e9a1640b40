//! The consistent-store contract consumed by the coordination client, plus an
//! embedded single-node implementation backed by memory or SlateDB.

pub mod backend;
pub mod embedded;
pub mod error;
pub mod slate;
pub mod store;
pub mod watch;

pub use backend::{KvBackend, MemoryBackend};
pub use embedded::{EmbeddedConnector, EmbeddedStore};
pub use error::{Result, StoreError};
pub use slate::SlateBackend;
pub use store::{CoordStore, DialConfig, EventType, KeyValue, StoreConnector, StoreEvent, WatchStream};

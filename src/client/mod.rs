//! Memory service client: wire types, transports, connection negotiation,
//! and the operation facade.

pub mod facade;
pub mod negotiator;
pub mod transport;
pub mod types;

pub use facade::{MemoryClient, DEFAULT_OPERATION_TIMEOUT_MS};
pub use negotiator::{
    ConnectMode, ConnectionInfo, ConnectionNegotiator, ConnectionState,
    DEFAULT_CONNECT_TIMEOUT_MS,
};
pub use transport::{
    HttpEndpoint, InMemoryService, Protocol, StdioEndpoint, Transport, TransportEndpoint,
    DEFAULT_READY_MARKER,
};
pub use types::{HealthStatus, MemoryRecord};

pub mod codec;
pub mod connection;
pub mod error;
pub mod frame;
pub mod heartbeat;
pub mod parser;
pub mod session;
pub mod subscription;
pub mod transport;

pub use codec::{StompCodec, WireItem};
pub use connection::{Connection, MAX_WIRE_CHUNK, ProtocolVersion, Transaction};
pub use error::{ErrorEvent, StompError};
pub use frame::Frame;
pub use heartbeat::{Heartbeat, negotiate, parse_heartbeat};
pub use session::{Config, Session, SessionState, StompClient};
pub use subscription::{Message, Subscription};
pub use transport::{
    Connector, TcpConnector, Transport, TransportCommand, TransportEvent, TransportPeer, pair,
};

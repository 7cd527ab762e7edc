pub mod address;
pub mod collection;
pub mod config;
pub mod connection;
pub mod context;
pub mod datagram;
pub mod error;
pub mod loopback;
pub mod stream;
pub mod websocket;

pub use address::{
    AddressFamily, AddressMask, AddressScope, Host, LOOPBACK_TOKEN, NetAddress, Protocol, format_masked,
    parse_masked, split_host_port,
};
pub use collection::{
    BoundAddress, ClientSockets, ConnectionCollection, Inbound, MAX_CONNECTIONS, PacketHandler, READ_BUDGET, TrafficRates,
    TrafficTotals, init_client, init_server,
};
pub use config::NetConfig;
pub use connection::{AddressFlags, Connection, ConnectionInfo, LocalAddress, MAX_OVERALL_MSGLEN, PacketBuffer};
pub use context::{NetContext, Resolver, SystemResolver};
pub use error::{NetError, SendStatus, VfsError};
pub use loopback::MAX_LOOPBACK;
pub use stream::{StreamFile, StreamId, VfsFile, close_stream, open_stream, wrap_stream};

pub const DEFAULT_PORT: u16 = 27500;

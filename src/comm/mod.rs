pub mod message_future;
pub mod node_addr;
pub mod recovery;
pub mod registry;
pub mod session;

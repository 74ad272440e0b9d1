pub mod chat;
pub mod connections;
pub mod fanout;
pub mod queue;
pub mod rooms;
pub mod server;
pub mod service;
pub mod session;

pub use service::{Connection, Gateway};

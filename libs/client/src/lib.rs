pub mod config;
pub mod controller;
pub mod error;
pub mod machine;
pub mod media;
pub mod mirror;
pub mod retry;
pub mod signaling;
pub mod status;

pub use config::ClientConfig;
pub use controller::{Recover, StreamController, StreamRequest};
pub use error::ClientError;
pub use machine::{StateMachine, StreamState};
pub use mirror::MirrorStore;
pub use retry::RetryPolicy;
pub use signaling::{Signaling, SignalingClient};
pub use status::ConnectionStatus;

pub mod events;
pub mod id;
pub mod session;

pub use events::{ClientAction, ServerEvent};
pub use session::{ChatMessage, Role, Session, SessionMetadata};

pub mod session;
pub mod ws;

pub use session::{SessionStore, MAX_HISTORY_RECORDS};
pub use ws::{ChatServer, ClientFrame, ServerFrame, DEFAULT_BIND};

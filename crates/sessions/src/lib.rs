//! Durable per-conversation message history.
//!
//! One JSON file per session under `<workspace>/.sessions/<session_id>.json`.
//! Every mutation writes through to disk before returning. The store is not
//! a concurrency primitive: callers serialize writes to the same session
//! (the queue manager's per-session lane does this for agent turns).

mod store;

pub use store::{Session, SessionStore};

//! Network surfaces. Both bind requests to storage through the same [`SessionDriver`].

pub mod http;
pub mod session;
pub mod ssh;

pub use session::{SessionDriver, StorageAccess};

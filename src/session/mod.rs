//! Session management module

pub mod cancel;
pub mod handle;

pub use cancel::CancelScope;
pub use handle::{Session, SessionStatus};

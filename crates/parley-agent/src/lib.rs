//! Session runtime: everything between a finalized transcript and the
//! reply playing back.
//!
//! Each session is driven by one [`runtime::SessionReactor`] task; the
//! [`manager::SessionManager`] creates, looks up and tears those down.

pub mod debounce;
pub mod dispatcher;
pub mod manager;
pub mod runtime;

pub use manager::{ModeRequest, Services, SessionDetail, SessionManager, SessionSummary};
pub use runtime::{SessionCommand, SessionNotice};

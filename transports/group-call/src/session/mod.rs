//! Call session state
//!
//! [`CallSessionStore`] is the single source of truth for the current call.
//! The UI reads it through a [`CallStoreHandle`] and never mutates it.

pub mod state;
pub mod store;

pub use state::{
    CallNotice, CallRole, CallSession, CallSnapshot, Lifecycle, Participant, RemoteStream,
};
pub use store::{CallSessionStore, CallStoreHandle};

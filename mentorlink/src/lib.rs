//! `MentorLink` offline-first messaging engine.
//!
//! The engine keeps a chat usable while the device is offline or flaky:
//! every message is durably persisted before any network attempt
//! ([`store`]), a single live session absorbs network instability
//! ([`connection`]), a reconciliation loop drives local and remote copies
//! to convergence ([`sync`]), and a read-side cache serves paginated,
//! deduplicated conversation views ([`history`]).

pub mod config;
pub mod connection;
pub mod history;
pub mod remote;
pub mod store;
pub mod sync;
pub mod transport;

//! Session registry storage.
//!
//! Records live in a `DashMap` so the transport task, the decision loop, the reaper and
//! API callers can touch different sessions without a global lock. Access goes through
//! closures so no shard guard is ever held across an `.await`.

mod session;

pub use session::SessionStore;

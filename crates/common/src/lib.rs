//! Shared plumbing for the panel's client crates: backoff, tunable knobs,
//! the HTTP fetch seam, cancellation helpers and the persisted local store.

pub mod backoff;
pub mod http;
pub mod is_canceled;
pub mod knobs;
pub mod local_store;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

//! Group State Observer.
//!
//! ## Architecture
//!
//! - `snapshot`: member views, the reconciled [`GroupSnapshot`] and the [`QuorumVerdict`]
//! - `observer`: queries the anchor and reconciles its view with the metadata

pub mod observer;
pub mod snapshot;

pub use observer::{observe, reconcile};
pub use snapshot::{GroupSnapshot, MemberView, QuorumVerdict, compute_verdict, failure_tolerance};

// Lease lifecycle: grant, attach, keep-alive, expiry and revocation.
//
// Records live in a `LeaseStore` and are locked one lease at a time.
// Changes reach the commit log before they touch a record or the
// key-value store.

pub mod checker;
pub mod keepalive;
pub mod manager;
pub mod record;
pub mod revoke;
pub mod store;

pub use checker::ExpiryChecker;
pub use keepalive::{KeepAliveCoordinator, KeepAliveResponse, KeepAliveStream};
pub use manager::{LeaseStatus, Lessor};
pub use record::{LeaseBody, LeaseRecord};
pub use revoke::Revoker;
pub use store::{LeaseGuard, LeaseStore};

//! Thread-affine managed resources (component I) and resource pooling
//! (component J) for the Qore runtime core.
//!
//! The database driver, socket implementation, etc. behind a
//! [`ManagedResource`] is an external collaborator (spec.md §1's Non-goals);
//! this crate only implements the lifetime, locking and error-propagation
//! contract around it, grounded on
//! `original_source/include/qore/intern/DatasourcePool.h`'s division of
//! responsibility between a single connection and the pool that hands
//! connections out.

mod managed_resource;
mod pool;

pub use managed_resource::{ManagedResource, RawResource, ResourceError, ResourceState};
pub use pool::{PoolAction, PoolCommand, ResourcePool};

pub mod tags {
    pub use qore_sink::tags::{DATASOURCEPOOL_ERROR, DATASOURCEPOOL_TIMEOUT, TRANSACTION_TIMEOUT};
}

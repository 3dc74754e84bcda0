//! Atomic database primitives for the work coordinator: typed rows over the
//! tables `wc-schema` creates, and the [`CoordinatorStore`] trait that wraps
//! each operation named in the storage contract as a parameterized SQL
//! statement or short transaction.

pub mod error;
pub mod readmodel;
pub mod status;
pub mod store;
pub mod types;

pub use error::{StorageError, StorageResult};
pub use readmodel::{ReadModelRow, ReadModelStore, SqlxReadModelStore};
pub use status::{FailureReason, WorkFlags};
pub use store::{CoordinatorStore, SqlxCoordinatorStore};
pub use types::*;

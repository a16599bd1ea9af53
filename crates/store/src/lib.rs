//! Persistence gateway for saga state.
//!
//! The orchestrator only needs the narrow [`SagaStore`] contract: create,
//! load by id or correlation, whole-aggregate update, and a scan of
//! non-terminal sagas for the reconciliation loop. Updates are atomic with
//! respect to step mutations and safe under concurrent calls for the same
//! saga id via an optimistic version check.

pub mod error;
pub mod memory;
pub mod postgres;
pub mod store;

pub use error::{Result, StoreError};
pub use memory::InMemorySagaStore;
pub use postgres::PostgresSagaStore;
pub use store::{Page, SagaFilter, SagaStore};

//! # crmsync testkit
//!
//! Testing utilities for crmsync.
//!
//! ## Overview
//!
//! This crate provides:
//!
//! - **Fixtures**: a [`Harness`] wiring a memory store, a memory CRM and a
//!   manual clock to one engine, plus builders for local bodies and remote
//!   field bags
//! - **Generators**: Proptest strategies for valid INNs, timestamps and
//!   remote records
//!
//! The sync properties themselves live in this crate's `tests/` directory.
//!
//! ## Test Fixtures
//!
//! ```rust
//! use crmsync_core::EntityType;
//! use crmsync_testkit::fixtures::{remote_company, Harness, LEGAL_INNS};
//!
//! # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
//! let h = Harness::new();
//! let remote_id = h.remote_insert(EntityType::Counterparty, remote_company("Acme Ltd", LEGAL_INNS[0]));
//! h.tick();
//!
//! let stats = h.engine.pull(&h.ctx(), EntityType::Counterparty).await.unwrap();
//! assert_eq!(stats.created, 1);
//! assert!(h.local_by_remote(EntityType::Counterparty, &remote_id).await.is_some());
//! # });
//! ```
//!
//! ## Property Testing
//!
//! ```rust,ignore
//! use proptest::prelude::*;
//! use crmsync_testkit::generators::legal_inn;
//!
//! proptest! {
//!     #[test]
//!     fn generated_inns_validate(inn in legal_inn()) {
//!         prop_assert!(crmsync_core::validate_tax_id(&inn).is_ok());
//!     }
//! }
//! ```

pub mod fixtures;
pub mod generators;

pub use fixtures::{init_tracing, Harness, SteppingClock, LEGAL_INNS, PERSON_INN};
pub use generators::{legal_inn, person_inn, RemoteCompanyParams};

/// Run a future to completion on a fresh single-threaded runtime.
///
/// For async checks inside `proptest!` bodies.
pub fn block_on<F: std::future::Future>(future: F) -> F::Output {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("build test runtime")
        .block_on(future)
}

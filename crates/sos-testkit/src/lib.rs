//! # SOS Testkit
//!
//! Testing utilities for SOS.
//!
//! ## Overview
//!
//! This crate provides:
//!
//! - **Fixtures**: in-process devices with engines and a message pump
//! - **Generators**: proptest strategies for items, manifests, and key fields
//! - **Vectors**: known KVS keys and digests that must never change
//!
//! ## Test Fixtures
//!
//! ```rust,no_run
//! use sos_testkit::fixtures::{pump, TestDevice};
//!
//! # async fn example() {
//! let mut a = TestDevice::new(1, &["x"]).await;
//! let mut b = TestDevice::new(2, &["y"]).await;
//! TestDevice::mesh(&mut [&mut a, &mut b]);
//! pump(&mut [&mut a, &mut b]).await;
//! assert_eq!(a.manifest(), b.manifest());
//! # }
//! ```
//!
//! ## Property Testing
//!
//! ```rust,ignore
//! use proptest::prelude::*;
//! use sos_core::Manifest;
//! use sos_testkit::generators::manifest_pair;
//!
//! proptest! {
//!     #[test]
//!     fn diff_then_apply((a, b) in manifest_pair(32)) {
//!         prop_assert_eq!(a.apply(&Manifest::diff(&a, &b)), b);
//!     }
//! }
//! ```

pub mod fixtures;
pub mod generators;
pub mod vectors;

pub use fixtures::{init_tracing, item, pump, TestDevice};
pub use vectors::{all_key_vectors, verify_item_digests, verify_key_vectors, KeyVector};

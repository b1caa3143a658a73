//! # twindex-search
//!
//! The per-twin search-index update pipeline.
//!
//! This crate turns incoming twin changes (events and commands) into
//! persisted, authorized, searchable index state:
//!
//! - **Updater tasks**: one cooperative task per twin id, enforcing
//!   revision order, stashing during persistence, recovering the last
//!   written state
//! - **Enforcement flow**: loads twin JSON and the authorization policy
//!   through coalescing caches and produces search-index write models
//! - **Differ**: computes incremental update documents from the diff
//!   between the last persisted and the new twin state
//! - **Bulk writer**: batches write models per partition and applies bulk
//!   writes with per-document error classification
//!
//! ## Data Flow
//!
//! ```text
//! change notification → updater task → enforcement flow → write model
//!                            ▲                                │
//!                            │                              differ
//!                       acknowledgement ←─ bulk writer ←──────┘
//! ```
//!
//! ## Guarantees
//!
//! - Per twin id, writes are observed, persisted, and acknowledged in
//!   revision order; at most one persistence round-trip is in flight
//! - Replaying an event sequence is idempotent (revision gating)
//! - Partial failures never poison other twins in the same batch

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod bulk;
pub mod cache;
pub mod config;
pub mod differ;
pub mod enforcement;
pub mod enrichment;
pub mod error;
pub mod metrics;
pub mod notification;
pub mod observer;
pub mod partition;
pub mod registry;
pub mod retry;
pub mod service;
pub mod store;
pub mod updater;
pub mod write_model;

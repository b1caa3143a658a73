//! # twindex-core
//!
//! Core domain model for the twindex search-index update pipeline.
//!
//! This crate provides the foundational types shared across all twindex
//! components:
//!
//! - **Identifiers**: Namespaced twin and policy ids with strict validation
//! - **Twin Model**: The authoritative JSON representation of a device
//! - **Events**: Revision-ordered twin change events and their application
//! - **Policies**: Authorization documents and the trie-based enforcer
//! - **Error Types**: Shared error definitions and result types
//!
//! ## Crate Boundary
//!
//! `twindex-core` is the **only** crate allowed to define shared domain
//! primitives. The update pipeline in `twindex-search` builds on these
//! contracts and never re-defines them.
//!
//! ## Example
//!
//! ```rust
//! use twindex_core::prelude::*;
//!
//! let twin_id: TwinId = "org.acme:sensor-1".parse().unwrap();
//! assert_eq!(twin_id.namespace(), "org.acme");
//! assert_eq!(twin_id.name(), "sensor-1");
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod event;
pub mod id;
pub mod observability;
pub mod pointer;
pub mod policy;
pub mod twin;

/// Prelude module for convenient imports.
///
/// # Example
///
/// ```rust
/// use twindex_core::prelude::*;
/// ```
pub mod prelude {
    pub use crate::error::{Error, Result};
    pub use crate::event::{TwinEvent, TwinEventKind, TwinEventPayload};
    pub use crate::id::{NamespacedId, PolicyId, TwinId};
    pub use crate::pointer::JsonPointer;
    pub use crate::policy::trie::{Enforcer, PolicyEnforcer};
    pub use crate::policy::{Permission, Policy, PolicyEntry, PolicyResource};
    pub use crate::twin::{Feature, Twin};
}

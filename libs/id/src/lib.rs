//! # sked-id
//!
//! Identifiers shared by the scheduler commit path.
//!
//! Two families live here:
//!
//! - **Typed IDs** (`CallId`, `CycleId`): ULID-backed, prefixed,
//!   generated by the scheduler itself. `call_01HV4Z2WQXKJNM8GPQY6VBKC3D`.
//! - **Object keys** (`ObjectKey`): the address of a remote object, built
//!   from kind, optional namespace and name. All ordering and coalescing of
//!   API calls is scoped to one key.
//!
//! Both have a canonical string form with strict parsing, so they survive a
//! round trip through logs and serialized payloads.

mod error;
mod key;
mod macros;
mod types;

pub use error::IdError;
pub use key::{ObjectKey, ObjectKind};
pub use types::*;

/// Re-export ulid for consumers that need raw ULID operations
pub use ulid::Ulid;

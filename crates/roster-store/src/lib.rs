//! roster-store — SQLite registry of registered users.
//!
//! One row per user: profile fields, a single reference embedding (optionally
//! AES-256-GCM sealed) and the last attendance timestamp.

pub mod cipher;
pub mod error;
pub mod schema;
pub mod store;

pub use cipher::EmbeddingCipher;
pub use error::{Result, StoreError};
pub use store::{AttendanceRecord, NewUser, RegisteredUser, Store, UserUpdate};

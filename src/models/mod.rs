//! Data models shared by the rotation engine, the transfer pipeline and the
//! object store implementations.
//!
//! `bucket` and `object` map to the local store's SQLite tables via
//! `sqlx::FromRow`; the rest are plain values passed between layers.

pub mod bucket;
pub mod entry;
pub mod multipart;
pub mod object;
pub mod policy;
pub mod request;

pub use entry::{BucketEntry, ObjectInfo};
pub use multipart::{CompletedPart, MultipartSession};
pub use policy::{RotationPolicy, Tier};
pub use request::TransferRequest;

//! Low-level primitives shared by the quota engine.
//!
//! Includes byte codecs for persisted records and the concurrency controls
//! used to drain in-flight operations and signal rescan completion.

/// Byte-level utilities and encoding/decoding.
///
/// Order-preserving integer encoders and a checked read cursor.
pub mod bytes;

/// Concurrency primitives and synchronization.
///
/// Operation drain gate and a completion latch.
pub mod concurrency;

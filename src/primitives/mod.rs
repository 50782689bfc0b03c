//! Low-level building blocks under the cachetable.
//!
//! Includes the positioned file I/O abstraction handed to page owners and the
//! worker pool plus job tracking used for background fetch and writeback.

/// Worker pool and background job tracking.
pub mod concurrency;

/// Positioned file I/O for cachefiles.
pub mod io;

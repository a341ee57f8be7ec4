//! Small reusable building blocks shared by the worker.

/// Bounded retries with a fatal fallback.
pub mod retry;

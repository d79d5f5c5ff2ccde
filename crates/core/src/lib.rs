//! Relay core library.
//!
//! Domain logic shared by the broker and the worker: the job model and its
//! lease state machine, the file-transfer subsystem, the retry/backoff
//! helper, processing-timeout estimation and the wire protocol types.
//! Nothing here depends on the HTTP stack.

pub mod backoff;
pub mod error;
pub mod estimation;
pub mod job;
pub mod protocol;
pub mod store;
pub mod transfer;
pub mod types;

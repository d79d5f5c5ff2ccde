//! Shared response envelope types for API handlers.
//!
//! All API responses use a `{ "data": ... }` envelope. The envelope type
//! lives in `relay_core::protocol` so the worker decodes exactly what the
//! broker encodes; it is re-exported here for handler imports.

pub use relay_core::protocol::DataResponse;

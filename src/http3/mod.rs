//! HTTP/3 framing and the upstream proxy driver.

pub mod settings;
mod stats;
pub mod upstream;

pub use self::stats::H3AuditStats;

//! Durable secret backends for AccessGuard.

pub mod file;

pub use file::FileSecretStore;

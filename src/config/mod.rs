//! Configuration loading.
//!
//! All runtime configuration is environment-driven; `Settings::from_env()`
//! is called once at startup and the resulting value is shared read-only.

mod settings;

pub use settings::{HttpSettings, LlmSettings, Settings, StorageSettings};

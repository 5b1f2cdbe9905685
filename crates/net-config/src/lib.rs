//! Layered network configuration store
//!
//! Priority-ordered file store, netplan rendering, store backups and engine
//! settings.

pub mod backup;
pub mod layered;
pub mod netplan;
pub mod settings;


pub use backup::{BackupFile, RestoreSummary, StoreBackup};
pub use layered::{ConfigFileHandle, LayeredConfigWriter};
pub use netplan::{ensure_renderer, render_construct, render_to_string, validate_document};
pub use settings::{EngineSettings, SettingsError};

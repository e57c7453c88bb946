//! # hearth-settings
//!
//! Configuration for the Hearth storage core.
//!
//! Settings are loaded from three layers (in priority order):
//! 1. **Compiled defaults**: [`HearthSettings::default()`]
//! 2. **Settings file**: `$HEARTH_CONFIG` or `./hearth.json` (deep-merged)
//! 3. **Environment variables**: `HEARTH_*` overrides (highest priority)
//!
//! There is no global instance: the loaded [`HearthSettings`] is passed
//! explicitly to whatever needs it.
//!
//! # Usage
//!
//! ```no_run
//! use hearth_settings::load_settings;
//!
//! let settings = load_settings().unwrap_or_default();
//! println!("pool size: {}", settings.database.pool_size);
//! ```

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;
pub mod units;

pub use errors::{Result, SettingsError};
pub use loader::{deep_merge, load_settings, load_settings_from_path, settings_path};
pub use types::*;
pub use units::{Capacity, Millis, parse_duration_ms, parse_size};

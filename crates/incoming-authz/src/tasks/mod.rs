//! Background tasks.
//!
//! # Tasks
//!
//! - `config_reload` - Recompiles and republishes when declarative files change
//! - `key_refresh` - One JWKS refresh loop per referenced provider, plus the
//!   supervisor that starts and stops them

pub mod config_reload;
pub mod key_refresh;

pub use config_reload::{ConfigReloader, ReloadError, ReloadOutcome};
pub use key_refresh::{run_key_refresh, KeyRefreshSupervisor};

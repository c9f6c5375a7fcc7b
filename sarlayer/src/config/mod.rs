//! Configuration for sarlayer components.
//!
//! [`ConfigFile`] is the user-facing INI file. The typed configs
//! ([`MatchConfig`], [`StoreConfig`], [`DispatchConfig`]) are what the
//! library components take; each can be derived from a loaded file or built
//! directly with `with_*` methods.
//!
//! ```
//! use sarlayer::config::{ConfigFile, DispatchConfig};
//!
//! let file = ConfigFile::default();
//! assert_eq!(file.dispatch_config(), DispatchConfig::default());
//! ```

mod defaults;
mod dispatch;
pub mod file;
mod matching;
mod parser;
mod settings;
mod store;
mod writer;

pub use dispatch::{DispatchConfig, StageRetry};
pub use file::{config_directory, config_file_path, ConfigFile, ConfigFileError};
pub use matching::MatchConfig;
pub use settings::{
    CollaboratorSettings, DispatchSettings, LoggingSettings, MatchingSettings, PathsSettings,
    RasterSettings, RegistrySettings,
};
pub use store::StoreConfig;

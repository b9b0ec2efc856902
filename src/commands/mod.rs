pub mod guardian;
pub mod session;
pub mod usage;
pub mod utils;

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use focus_guard::focus::config::get_settings_path;
use focus_guard::focus::{EngineSettings, FocusService};

/// Settings and data location shared by every command
pub struct Workspace {
    pub settings: EngineSettings,
    pub data_dir: PathBuf,
}

impl Workspace {
    /// Load settings (defaults if the file is missing) and resolve the data directory.
    /// Explicit paths win over the settings file, which wins over platform defaults.
    pub fn load(settings_path: Option<&Path>, data_dir: Option<&Path>) -> Result<Self> {
        let settings = match settings_path {
            Some(path) => EngineSettings::load(path)?,
            None => EngineSettings::load_or_default(&get_settings_path()?)?,
        };

        let data_dir = match data_dir {
            Some(dir) => dir.to_path_buf(),
            None => settings.data_dir()?,
        };

        Ok(Self { settings, data_dir })
    }

    pub fn open_service(&self) -> Result<FocusService> {
        FocusService::open(&self.data_dir, self.settings.clone())
            .with_context(|| format!("Failed to open state in {}", self.data_dir.display()))
    }
}

use color_eyre::{eyre::eyre, Result};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

const CONFIG_DIR: &str = ".config/roverlink";
const SETTINGS_FILE: &str = "settings.toml";

/// Key/value settings persisted as a TOML table.
///
/// The shell uses this to retain the last endpoint ("host"/"port") across
/// sessions; the link core itself never reads it. A missing file degrades to
/// an empty store so the application always starts.
#[derive(Clone, Debug)]
pub struct SettingsStore {
    values: Arc<RwLock<HashMap<String, String>>>,
    path: PathBuf,
}

impl SettingsStore {
    /// Loads the store from the default location under the home directory.
    pub async fn load() -> Result<Self> {
        let mut path = get_home_dir();
        path.push(CONFIG_DIR);
        path.push(SETTINGS_FILE);
        Self::load_from(path).await
    }

    /// Loads the store from an explicit file path.
    pub async fn load_from(path: PathBuf) -> Result<Self> {
        let values = if tokio::fs::try_exists(&path)
            .await
            .map_err(|e| eyre!("Failed to check if settings file exists: {}", e))?
        {
            let content = tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| eyre!("Failed to read settings file: {}", e))?;

            match toml::from_str(&content) {
                Ok(values) => values,
                Err(e) => {
                    warn!("Settings file is not valid TOML, starting empty: {}", e);
                    HashMap::new()
                }
            }
        } else {
            debug!("Settings file does not exist yet, starting empty");
            HashMap::new()
        };

        Ok(Self {
            values: Arc::new(RwLock::new(values)),
            path,
        })
    }

    /// Returns the stored value for `key`, if any.
    pub fn get(&self, key: &str) -> Option<String> {
        match self.values.try_read() {
            Ok(guard) => guard.get(key).cloned(),
            Err(e) => {
                warn!("Unable to read settings: {}", e);
                None
            }
        }
    }

    /// Stores `value` under `key` and persists the table to disk.
    pub async fn set(&self, key: &str, value: &str) -> Result<()> {
        {
            let mut guard = self.values.write().await;
            guard.insert(key.to_string(), value.to_string());
        }
        self.save().await
    }

    /// Writes the current table to the settings file.
    pub async fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !tokio::fs::try_exists(parent)
                .await
                .map_err(|e| eyre!("Failed to check if settings directory exists: {}", e))?
            {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| eyre!("Failed to create settings directory: {}", e))?;
            }
        }

        let snapshot = self.values.read().await.clone();
        let content = toml::to_string_pretty(&snapshot)
            .map_err(|e| eyre!("Failed to serialize settings: {}", e))?;

        tokio::fs::write(&self.path, content)
            .await
            .map_err(|e| eyre!("Failed to write settings file: {}", e))?;

        info!("Settings saved to {}", self.path.display());
        Ok(())
    }
}

fn get_home_dir() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| {
        warn!("Could not determine home directory, using current directory");
        PathBuf::from(".")
    })
}

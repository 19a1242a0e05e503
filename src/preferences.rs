use std::{
    path::{Path, PathBuf},
    sync::RwLock,
};

use serde::{Deserialize, Serialize};

use crate::{Currency, Result};

/// A visitor's persisted currency choice.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CurrencyPreference {
    pub manual_currency: Option<Currency>,
    pub is_manual: bool,
}

impl CurrencyPreference {
    /// A manual choice of `currency`.
    pub fn manual(currency: Currency) -> CurrencyPreference {
        CurrencyPreference {
            manual_currency: Some(currency),
            is_manual: true,
        }
    }

    /// The manually chosen currency, if the preference is an active manual choice.
    pub fn active_currency(&self) -> Option<Currency> {
        self.manual_currency.filter(|_| self.is_manual)
    }
}

/// Storage for [`CurrencyPreference`]. Read once when a session starts, written on every manual
/// override.
pub trait PreferenceStore: Send + Sync {
    /// Load the stored preference. `Ok(None)` if nothing has been stored.
    fn load(&self) -> Result<Option<CurrencyPreference>>;
    fn save(&self, preference: &CurrencyPreference) -> Result<()>;
    fn clear(&self) -> Result<()>;
}

/// `MemoryPreferenceStore` keeps the preference in process memory, allowing concurrent access for
/// readers and writers.
#[derive(Debug, Default)]
pub struct MemoryPreferenceStore {
    preference: RwLock<Option<CurrencyPreference>>,
}

impl MemoryPreferenceStore {
    pub fn new() -> MemoryPreferenceStore {
        MemoryPreferenceStore::default()
    }

    /// Create a store that already holds `preference`.
    pub fn with_preference(preference: CurrencyPreference) -> MemoryPreferenceStore {
        MemoryPreferenceStore {
            preference: RwLock::new(Some(preference)),
        }
    }
}

impl PreferenceStore for MemoryPreferenceStore {
    fn load(&self) -> Result<Option<CurrencyPreference>> {
        // Err() is possible only if the lock is poisoned (writer panicked while holding the lock).
        // Treating that as "nothing stored" rather than crashing the app.
        Ok(self.preference.read().ok().and_then(|slot| *slot))
    }

    fn save(&self, preference: &CurrencyPreference) -> Result<()> {
        if let Ok(mut slot) = self.preference.write() {
            *slot = Some(*preference);
        }
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        if let Ok(mut slot) = self.preference.write() {
            *slot = None;
        }
        Ok(())
    }
}

/// Stores the preference as a JSON document at a fixed path.
#[derive(Debug, Clone)]
pub struct JsonFilePreferenceStore {
    path: PathBuf,
}

impl JsonFilePreferenceStore {
    pub fn new(path: impl Into<PathBuf>) -> JsonFilePreferenceStore {
        JsonFilePreferenceStore { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl PreferenceStore for JsonFilePreferenceStore {
    fn load(&self) -> Result<Option<CurrencyPreference>> {
        let contents = match std::fs::read(&self.path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let preference = serde_json::from_slice(&contents)?;
        Ok(Some(preference))
    }

    fn save(&self, preference: &CurrencyPreference) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_vec_pretty(preference)?;
        std::fs::write(&self.path, contents)?;
        log::debug!(target: "personalize", path:? = self.path; "saved currency preference");
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

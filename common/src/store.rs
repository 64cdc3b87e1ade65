use std::{
    fs::{self, File},
    io::{self, ErrorKind, Write},
    path::{Path, PathBuf},
};

use log::{info, warn};
use thiserror::Error;

use crate::config::DeviceConfig;

/// Well-known file name of the persisted record.
pub const CONFIG_FILE_NAME: &str = "amv_config.json";

/// Byte-level access to the medium holding the config record.
///
/// Each call opens, fully reads or writes, and releases the medium; nothing
/// is held open between calls.
pub trait ConfigBackend {
    fn mount(&mut self) -> io::Result<()>;

    /// `Ok(None)` when no record has been written yet.
    fn read(&mut self) -> io::Result<Option<Vec<u8>>>;

    /// Replaces the record so that a reader sees either the old or the new
    /// bytes, never a prefix of the new ones.
    fn write_atomic(&mut self, bytes: &[u8]) -> io::Result<()>;
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("config store unavailable")]
    Unavailable(#[source] io::Error),
    #[error("failed to write config record")]
    WriteFailed(#[source] io::Error),
    #[error("malformed config record")]
    Parse(#[from] serde_json::Error),
}

pub struct ConfigStore<B> {
    backend: B,
    last_good: Option<DeviceConfig>,
    unsaved: Option<DeviceConfig>,
}

impl<B: ConfigBackend> ConfigStore<B> {
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            last_good: None,
            unsaved: None,
        }
    }

    /// Reads the record, creating a default one when none exists.
    ///
    /// A config whose save failed earlier shadows the durable record until a
    /// retried write succeeds.
    pub fn load(&mut self) -> Result<DeviceConfig, StoreError> {
        self.backend.mount().map_err(StoreError::Unavailable)?;

        if let Some(pending) = self.unsaved.take() {
            match self.write(&pending) {
                Ok(()) => info!("previously unsaved config persisted"),
                Err(err) => {
                    warn!("config still not durable: {err:#}");
                    self.unsaved = Some(pending.clone());
                }
            }
            self.last_good = Some(pending.clone());
            return Ok(pending);
        }

        let config = match self.backend.read().map_err(StoreError::Unavailable)? {
            Some(raw) => serde_json::from_slice::<DeviceConfig>(&raw)?,
            None => {
                info!("config record missing; creating defaults");
                let config = DeviceConfig::default();
                if let Err(err) = self.write(&config) {
                    warn!("failed to create default config record: {err:#}");
                }
                config
            }
        };

        self.last_good = Some(config.clone());
        Ok(config)
    }

    pub fn save(&mut self, config: &DeviceConfig) -> Result<(), StoreError> {
        let result = self
            .backend
            .mount()
            .map_err(StoreError::WriteFailed)
            .and_then(|()| self.write(config));

        match result {
            Ok(()) => {
                self.unsaved = None;
                self.last_good = Some(config.clone());
                Ok(())
            }
            Err(err) => {
                self.unsaved = Some(config.clone());
                self.last_good = Some(config.clone());
                Err(err)
            }
        }
    }

    /// Config to run with when `load` failed.
    pub fn fallback(&self) -> DeviceConfig {
        self.last_good.clone().unwrap_or_default()
    }

    pub fn last_known_good(&self) -> Option<&DeviceConfig> {
        self.last_good.as_ref()
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    fn write(&mut self, config: &DeviceConfig) -> Result<(), StoreError> {
        let payload = serde_json::to_vec_pretty(config)
            .map_err(|err| StoreError::WriteFailed(io::Error::other(err)))?;
        self.backend
            .write_atomic(&payload)
            .map_err(StoreError::WriteFailed)
    }
}

/// Record kept as a single file on a mounted filesystem.
#[derive(Debug, Clone)]
pub struct FsBackend {
    path: PathBuf,
}

impl FsBackend {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn in_dir(dir: impl AsRef<Path>) -> Self {
        Self::new(dir.as_ref().join(CONFIG_FILE_NAME))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|name| name.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

impl ConfigBackend for FsBackend {
    fn mount(&mut self) -> io::Result<()> {
        match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => fs::create_dir_all(parent),
            _ => Ok(()),
        }
    }

    fn read(&mut self) -> io::Result<Option<Vec<u8>>> {
        match fs::read(&self.path) {
            Ok(raw) => Ok(Some(raw)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err),
        }
    }

    fn write_atomic(&mut self, bytes: &[u8]) -> io::Result<()> {
        let temp = self.temp_path();
        {
            let mut file = File::create(&temp)?;
            file.write_all(bytes)?;
            file.sync_all()?;
        }
        fs::rename(&temp, &self.path)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::testing::MemoryBackend;

    fn sample_config() -> DeviceConfig {
        DeviceConfig {
            device_id: "dev-1".into(),
            server_address: "192.168.254.150".into(),
            server_port: "3000".into(),
            temp_calibration: 1.5,
            humid_calibration: -2.25,
            airqual_calibration: 12.0,
            ..Default::default()
        }
    }

    fn scratch_dir() -> PathBuf {
        static NEXT: AtomicU32 = AtomicU32::new(0);
        let dir = std::env::temp_dir().join(format!(
            "amv-store-{}-{}",
            std::process::id(),
            NEXT.fetch_add(1, Ordering::Relaxed)
        ));
        let _ = fs::remove_dir_all(&dir);
        dir
    }

    #[test]
    fn missing_record_is_created_with_defaults() {
        let mut store = ConfigStore::new(MemoryBackend::default());

        let config = store.load().unwrap();

        assert_eq!(config, DeviceConfig::default());
        let written: DeviceConfig =
            serde_json::from_slice(store.backend().data.as_ref().unwrap()).unwrap();
        assert_eq!(written, DeviceConfig::default());
    }

    #[test]
    fn save_then_load_round_trips() {
        let mut store = ConfigStore::new(MemoryBackend::default());
        let config = sample_config();

        store.save(&config).unwrap();

        assert_eq!(store.load().unwrap(), config);
    }

    #[test]
    fn unmountable_medium_is_unavailable() {
        let mut store = ConfigStore::new(MemoryBackend {
            mountable: false,
            ..Default::default()
        });

        assert!(matches!(store.load(), Err(StoreError::Unavailable(_))));
    }

    #[test]
    fn parse_error_falls_back_to_last_known_good() {
        let mut store = ConfigStore::new(MemoryBackend::default());
        assert_eq!(store.fallback(), DeviceConfig::default());

        store.save(&sample_config()).unwrap();
        store.load().unwrap();

        store.backend_mut().data = Some(b"{ \"device_id\": ".to_vec());

        assert!(matches!(store.load(), Err(StoreError::Parse(_))));
        assert_eq!(store.fallback(), sample_config());
    }

    #[test]
    fn failed_save_keeps_config_in_memory_until_durable() {
        let mut store = ConfigStore::new(MemoryBackend::default());
        store.load().unwrap();

        store.backend_mut().fail_writes = true;
        let config = sample_config();
        assert!(matches!(
            store.save(&config),
            Err(StoreError::WriteFailed(_))
        ));

        // Durable record is still the default one, but the node keeps running
        // with the submitted values.
        assert_eq!(store.load().unwrap(), config);

        store.backend_mut().fail_writes = false;
        assert_eq!(store.load().unwrap(), config);
        let durable: DeviceConfig =
            serde_json::from_slice(store.backend().data.as_ref().unwrap()).unwrap();
        assert_eq!(durable, config);
    }

    #[test]
    fn fs_backend_replaces_record_atomically() {
        let dir = scratch_dir();
        let mut store = ConfigStore::new(FsBackend::in_dir(&dir));

        assert_eq!(store.load().unwrap(), DeviceConfig::default());
        assert!(dir.join(CONFIG_FILE_NAME).exists());

        store.save(&sample_config()).unwrap();
        assert!(!dir.join(format!("{CONFIG_FILE_NAME}.tmp")).exists());

        let mut reopened = ConfigStore::new(FsBackend::in_dir(&dir));
        assert_eq!(reopened.load().unwrap(), sample_config());

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn fs_backend_reads_records_written_by_older_firmware() {
        let dir = scratch_dir();
        fs::create_dir_all(&dir).unwrap();
        fs::write(
            dir.join(CONFIG_FILE_NAME),
            r#" { "device_id" : "", "server_IP" : "", "server_Port" : "", "temp_calibration" : 0, "humid_calibration" : 0, "airQual_calibration" : 0   } "#,
        )
        .unwrap();

        let mut store = ConfigStore::new(FsBackend::in_dir(&dir));
        assert_eq!(store.load().unwrap(), DeviceConfig::default());

        let _ = fs::remove_dir_all(&dir);
    }
}

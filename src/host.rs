//! Editor host integration points.
//!
//! The installer only talks to the host through these traits: a path-based
//! storage facility without nested mkdir, a plugin lifecycle (mount/unmount),
//! and a toast notifier. `FsStorage`, `LocalRuntime` and `LogNotifier` are
//! the implementations used when running against the local filesystem.

use async_trait::async_trait;
use dashmap::DashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::error::{Error, Result};

#[async_trait]
pub trait PluginStorage: Send + Sync {
    async fn exists(&self, path: &Path) -> Result<bool>;
    async fn read(&self, path: &Path) -> Result<Vec<u8>>;
    /// Write bytes to an existing or new file, replacing its content.
    async fn write(&self, path: &Path, data: &[u8]) -> Result<()>;
    /// Create one directory `name` inside `parent`. An existing directory is
    /// not an error. `parent` must exist.
    async fn create_directory(&self, parent: &Path, name: &str) -> Result<()>;
    /// Create an empty file `name` inside `parent` if it does not exist.
    async fn create_file(&self, parent: &Path, name: &str) -> Result<()>;
}

/// Extra context handed to a plugin when it is mounted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountOptions {
    pub cache_file: PathBuf,
    /// True right after a first-time install.
    pub first_init: bool,
}

#[async_trait]
pub trait PluginLifecycle: Send + Sync {
    async fn mount(&self, id: &str, base_url: &str, options: MountOptions) -> Result<()>;
    /// Tear down a live instance. Errors if `id` is not mounted.
    fn unmount(&self, id: &str) -> Result<()>;
}

pub trait Notifier: Send + Sync {
    fn toast(&self, message: &str, duration: Duration);
}

/// Where plugins and their cache files live in host storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageLayout {
    pub data_root: PathBuf,
    pub plugins_root: PathBuf,
    pub cache_root: PathBuf,
}

impl StorageLayout {
    pub const PLUGINS_DIR: &'static str = "plugins";
    pub const CACHE_DIR: &'static str = "cache";

    pub fn new(data_root: impl Into<PathBuf>) -> Self {
        let data_root = data_root.into();
        Self {
            plugins_root: data_root.join(Self::PLUGINS_DIR),
            cache_root: data_root.join(Self::CACHE_DIR),
            data_root,
        }
    }

    pub fn plugin_dir(&self, id: &str) -> PathBuf {
        self.plugins_root.join(id)
    }

    pub fn cache_file(&self, id: &str) -> PathBuf {
        self.cache_root.join(id)
    }
}

/// Everything the installer needs from the host, as typed handles.
#[derive(Clone)]
pub struct Host {
    pub storage: Arc<dyn PluginStorage>,
    pub lifecycle: Arc<dyn PluginLifecycle>,
    pub notifier: Arc<dyn Notifier>,
    pub layout: StorageLayout,
}

impl Host {
    /// A host backed by the local filesystem rooted at `data_root`.
    pub fn local(data_root: impl Into<PathBuf>) -> Self {
        Self {
            storage: Arc::new(FsStorage),
            lifecycle: Arc::new(LocalRuntime::default()),
            notifier: Arc::new(LogNotifier),
            layout: StorageLayout::new(data_root),
        }
    }
}

// ---------------------------------------------------------------------------
// Local filesystem implementations
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Clone, Copy)]
pub struct FsStorage;

#[async_trait]
impl PluginStorage for FsStorage {
    async fn exists(&self, path: &Path) -> Result<bool> {
        Ok(tokio::fs::try_exists(path).await?)
    }

    async fn read(&self, path: &Path) -> Result<Vec<u8>> {
        Ok(tokio::fs::read(path).await?)
    }

    async fn write(&self, path: &Path, data: &[u8]) -> Result<()> {
        Ok(tokio::fs::write(path, data).await?)
    }

    async fn create_directory(&self, parent: &Path, name: &str) -> Result<()> {
        match tokio::fs::create_dir(parent.join(name)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn create_file(&self, parent: &Path, name: &str) -> Result<()> {
        tokio::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(parent.join(name))
            .await?;
        Ok(())
    }
}

/// Tracks which plugins are live. Stands in for the editor's plugin registry.
#[derive(Debug, Default)]
pub struct LocalRuntime {
    mounted: DashMap<String, String>,
}

impl LocalRuntime {
    pub fn is_mounted(&self, id: &str) -> bool {
        self.mounted.contains_key(id)
    }

    pub fn base_url(&self, id: &str) -> Option<String> {
        self.mounted.get(id).map(|entry| entry.value().clone())
    }
}

#[async_trait]
impl PluginLifecycle for LocalRuntime {
    async fn mount(&self, id: &str, base_url: &str, options: MountOptions) -> Result<()> {
        tracing::info!(
            "Mounted plugin {id} from {base_url} (first init: {})",
            options.first_init
        );
        self.mounted.insert(id.to_string(), base_url.to_string());
        Ok(())
    }

    fn unmount(&self, id: &str) -> Result<()> {
        match self.mounted.remove(id) {
            Some(_) => {
                tracing::info!("Unmounted plugin {id}");
                Ok(())
            }
            None => Err(Error::Io(io::Error::new(
                io::ErrorKind::NotFound,
                format!("plugin {id} is not mounted"),
            ))),
        }
    }
}

/// Routes toasts to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn toast(&self, message: &str, _duration: Duration) {
        tracing::info!("[toast] {message}");
    }
}

/// `file://` URL of a plugin directory, with a trailing slash so relative
/// joins stay inside it.
pub fn directory_url(dir: &Path) -> String {
    url::Url::from_directory_path(dir)
        .map(|u| u.to_string())
        .unwrap_or_else(|_| format!("{}/", dir.display()))
}

//! Remote installer: expands a received plugin archive over the installed
//! plugin tree and cycles the plugin through the host lifecycle.
//!
//! Every check on the archive happens before storage is touched, so a bad
//! payload never leaves a half-written plugin behind.

use std::io::{Cursor, Read};
use std::path::{Component, Path};

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use futures_util::future::try_join_all;
use serde_json::Value;
use zip::ZipArchive;

use crate::builder::{BUNDLE_NAME, MANIFEST_NAME};
use crate::error::{Error, Result};
use crate::host::{Host, MountOptions, PluginStorage, StorageLayout, directory_url};

/// One archive member, fully read into memory.
#[derive(Debug)]
struct Member {
    /// Forward-slash relative path.
    name: String,
    is_dir: bool,
    data: Vec<u8>,
}

#[derive(Debug)]
struct ValidatedArchive {
    id: String,
    members: Vec<Member>,
}

pub struct Installer {
    host: Host,
}

impl Installer {
    pub fn new(host: Host) -> Self {
        Self { host }
    }

    pub fn host(&self) -> &Host {
        &self.host
    }

    /// Install a base64-encoded plugin archive and reload the plugin.
    /// Returns the plugin id.
    ///
    /// The plugin is mounted with `first_init` set only when this install
    /// created its directory; updates to an installed plugin mount with
    /// `first_init: false`, as a plain reload does.
    pub async fn install_plugin_zip(&self, encoded: &str) -> Result<String> {
        let archive = read_archive(encoded)?;
        let storage = self.host.storage.as_ref();
        let layout = &self.host.layout;
        let plugin_dir = layout.plugin_dir(&archive.id);

        if !storage.exists(&layout.plugins_root).await? {
            storage
                .create_directory(&layout.data_root, StorageLayout::PLUGINS_DIR)
                .await?;
        }
        let first_install = !storage.exists(&plugin_dir).await?;
        if first_install {
            storage.create_directory(&layout.plugins_root, &archive.id).await?;
        }

        let writes = archive
            .members
            .iter()
            .map(|member| write_member(storage, &plugin_dir, member));
        try_join_all(writes).await?;
        tracing::info!(
            "Wrote {} entries for plugin {} to {}",
            archive.members.len(),
            archive.id,
            plugin_dir.display()
        );

        if let Err(e) = self.host.lifecycle.unmount(&archive.id) {
            tracing::warn!("Failed to unmount plugin {} (might not be loaded): {e}", archive.id);
        }
        self.load_plugin(&archive.id, first_install).await?;
        Ok(archive.id)
    }

    /// Mount an installed plugin, making sure its cache file exists first.
    /// `first_init` is passed through to the host untouched.
    pub async fn load_plugin(&self, id: &str, first_init: bool) -> Result<()> {
        let storage = self.host.storage.as_ref();
        let layout = &self.host.layout;

        if !storage.exists(&layout.cache_root).await? {
            storage
                .create_directory(&layout.data_root, StorageLayout::CACHE_DIR)
                .await?;
        }
        let cache_file = layout.cache_file(id);
        if !storage.exists(&cache_file).await? {
            storage.create_file(&layout.cache_root, id).await?;
        }

        let base_url = directory_url(&layout.plugin_dir(id));
        self.host
            .lifecycle
            .mount(id, &base_url, MountOptions { cache_file, first_init })
            .await
    }
}

async fn write_member(storage: &dyn PluginStorage, plugin_dir: &Path, member: &Member) -> Result<()> {
    let dest = plugin_dir.join(&member.name);
    if !storage.exists(&dest).await? {
        create_recursive(storage, plugin_dir, &member.name).await?;
    }
    if member.is_dir {
        return Ok(());
    }
    storage.write(&dest, &member.data).await
}

/// Create `relative` under `root` one segment at a time, since host storage
/// has no nested mkdir. Intermediate segments and a trailing-`/` path become
/// directories; the final segment of a file path becomes an empty file.
pub(crate) async fn create_recursive(storage: &dyn PluginStorage, root: &Path, relative: &str) -> Result<()> {
    let is_dir = relative.ends_with('/');
    let segments: Vec<&str> = relative.split('/').filter(|s| !s.is_empty()).collect();
    let mut parent = root.to_path_buf();

    for (index, segment) in segments.iter().enumerate() {
        let last = index + 1 == segments.len();
        if last && !is_dir {
            storage.create_file(&parent, segment).await?;
        } else {
            storage.create_directory(&parent, segment).await?;
            parent.push(segment);
        }
    }
    Ok(())
}

/// Returns true if an archive path would land outside the plugin directory.
fn is_path_escape(relative: &str) -> bool {
    let path = Path::new(relative);
    if path.is_absolute() || relative.starts_with('/') {
        return true;
    }
    path.components()
        .any(|c| matches!(c, Component::ParentDir | Component::RootDir | Component::Prefix(_)))
}

fn is_valid_id(id: &str) -> bool {
    !id.is_empty() && id != "." && id != ".." && !id.contains(['/', '\\'])
}

/// Decode and validate the whole archive up front.
fn read_archive(encoded: &str) -> Result<ValidatedArchive> {
    let bytes = BASE64
        .decode(encoded.trim())
        .map_err(|e| Error::InvalidArchive(format!("payload is not base64: {e}")))?;
    let mut archive =
        ZipArchive::new(Cursor::new(bytes)).map_err(|e| Error::InvalidArchive(format!("not a zip archive: {e}")))?;

    let mut members = Vec::with_capacity(archive.len());
    for index in 0..archive.len() {
        let mut file = archive
            .by_index(index)
            .map_err(|e| Error::InvalidArchive(format!("unreadable entry #{index}: {e}")))?;
        let name = file.name().replace('\\', "/");
        if name.is_empty() {
            continue;
        }
        if is_path_escape(&name) {
            return Err(Error::InvalidArchive(format!("entry \"{name}\" escapes the plugin directory")));
        }
        let is_dir = name.ends_with('/');
        let mut data = Vec::new();
        if !is_dir {
            file.read_to_end(&mut data)
                .map_err(|e| Error::InvalidArchive(format!("corrupt entry \"{name}\": {e}")))?;
        }
        members.push(Member { name, is_dir, data });
    }

    if !members.iter().any(|m| m.name == BUNDLE_NAME) {
        return Err(Error::InvalidArchive(format!("missing {BUNDLE_NAME}")));
    }
    let manifest_member = members
        .iter_mut()
        .find(|m| m.name == MANIFEST_NAME)
        .ok_or_else(|| Error::InvalidArchive(format!("missing {MANIFEST_NAME}")))?;
    let manifest: Value = serde_json::from_slice(&manifest_member.data)
        .map_err(|e| Error::InvalidArchive(format!("{MANIFEST_NAME} is not valid JSON: {e}")))?;

    let id = manifest
        .get("id")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    if !is_valid_id(&id) {
        return Err(Error::InvalidArchive(format!("invalid plugin id \"{id}\"")));
    }
    manifest_member.data =
        serde_json::to_vec(&manifest).map_err(|e| Error::InvalidArchive(format!("{MANIFEST_NAME}: {e}")))?;

    Ok(ValidatedArchive { id, members })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::tests::{CopyBundler, write_plugin};
    use crate::builder::build_plugin;
    use crate::config::HotReloadConfig;
    use crate::error::Error;
    use crate::host::{FsStorage, LocalRuntime, LogNotifier, PluginLifecycle};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::io::Write;
    use std::path::PathBuf;
    use std::sync::Arc;
    use zip::ZipWriter;
    use zip::write::SimpleFileOptions;

    /// Storage that records every mutation and performs it on disk.
    #[derive(Default)]
    struct RecordingStorage {
        mutations: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl PluginStorage for RecordingStorage {
        async fn exists(&self, path: &Path) -> Result<bool> {
            FsStorage.exists(path).await
        }
        async fn read(&self, path: &Path) -> Result<Vec<u8>> {
            FsStorage.read(path).await
        }
        async fn write(&self, path: &Path, data: &[u8]) -> Result<()> {
            self.mutations.lock().push(format!("write {}", path.display()));
            FsStorage.write(path, data).await
        }
        async fn create_directory(&self, parent: &Path, name: &str) -> Result<()> {
            self.mutations.lock().push(format!("mkdir {name}"));
            FsStorage.create_directory(parent, name).await
        }
        async fn create_file(&self, parent: &Path, name: &str) -> Result<()> {
            self.mutations.lock().push(format!("touch {name}"));
            FsStorage.create_file(parent, name).await
        }
    }

    /// Lifecycle whose unmount always fails and which records mounts.
    #[derive(Default)]
    struct StrictLifecycle {
        mounts: Mutex<Vec<(String, MountOptions)>>,
    }

    #[async_trait]
    impl PluginLifecycle for StrictLifecycle {
        async fn mount(&self, id: &str, _base_url: &str, options: MountOptions) -> Result<()> {
            self.mounts.lock().push((id.to_string(), options));
            Ok(())
        }
        fn unmount(&self, id: &str) -> Result<()> {
            Err(Error::Configuration(format!("{id} was never loaded")))
        }
    }

    fn zip_base64(entries: &[(&str, &[u8])]) -> String {
        let mut buf = Cursor::new(Vec::new());
        {
            let mut zip = ZipWriter::new(&mut buf);
            for (name, data) in entries {
                if name.ends_with('/') {
                    zip.add_directory(*name, SimpleFileOptions::default()).unwrap();
                } else {
                    zip.start_file(*name, SimpleFileOptions::default()).unwrap();
                    zip.write_all(data).unwrap();
                }
            }
            zip.finish().unwrap();
        }
        BASE64.encode(buf.into_inner())
    }

    fn recording_host(root: &Path) -> (Host, Arc<RecordingStorage>, Arc<StrictLifecycle>) {
        let storage = Arc::new(RecordingStorage::default());
        let lifecycle = Arc::new(StrictLifecycle::default());
        let host = Host {
            storage: storage.clone(),
            lifecycle: lifecycle.clone(),
            notifier: Arc::new(LogNotifier),
            layout: StorageLayout::new(root),
        };
        (host, storage, lifecycle)
    }

    const MANIFEST: &[u8] = br#"{"id":"demo","name":"Demo"}"#;

    #[tokio::test]
    async fn missing_bundle_is_rejected_without_writes() {
        let dir = tempfile::tempdir().unwrap();
        let (host, storage, lifecycle) = recording_host(dir.path());
        let installer = Installer::new(host);

        let encoded = zip_base64(&[("plugin.json", MANIFEST), ("icon.png", b"png")]);
        let result = installer.install_plugin_zip(&encoded).await;

        assert!(matches!(result, Err(Error::InvalidArchive(_))));
        assert!(storage.mutations.lock().is_empty());
        assert!(lifecycle.mounts.lock().is_empty());
        assert!(!dir.path().join("plugins").exists());
    }

    #[tokio::test]
    async fn missing_manifest_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let installer = Installer::new(Host::local(dir.path()));
        let encoded = zip_base64(&[("main.js", b"x")]);
        assert!(matches!(
            installer.install_plugin_zip(&encoded).await,
            Err(Error::InvalidArchive(msg)) if msg.contains("plugin.json")
        ));
    }

    #[tokio::test]
    async fn garbage_payloads_are_invalid_archives() {
        let dir = tempfile::tempdir().unwrap();
        let installer = Installer::new(Host::local(dir.path()));
        assert!(matches!(
            installer.install_plugin_zip("***not base64***").await,
            Err(Error::InvalidArchive(_))
        ));
        assert!(matches!(
            installer.install_plugin_zip(&BASE64.encode(b"plain text")).await,
            Err(Error::InvalidArchive(_))
        ));
    }

    #[tokio::test]
    async fn traversal_entries_are_rejected_before_writing() {
        let dir = tempfile::tempdir().unwrap();
        let (host, storage, _) = recording_host(dir.path());
        let installer = Installer::new(host);

        let encoded = zip_base64(&[
            ("plugin.json", MANIFEST),
            ("main.js", b"x"),
            ("../../evil.js", b"boom"),
        ]);
        let result = installer.install_plugin_zip(&encoded).await;
        assert!(matches!(result, Err(Error::InvalidArchive(msg)) if msg.contains("escapes")));
        assert!(storage.mutations.lock().is_empty());
    }

    #[tokio::test]
    async fn escaping_ids_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let installer = Installer::new(Host::local(dir.path()));
        for manifest in [r#"{"id":"../x"}"#, r#"{"id":""}"#, r#"{"name":"no id"}"#, r#"{"id":"a/b"}"#] {
            let encoded = zip_base64(&[("plugin.json", manifest.as_bytes()), ("main.js", b"x")]);
            assert!(
                matches!(installer.install_plugin_zip(&encoded).await, Err(Error::InvalidArchive(_))),
                "{manifest} should be rejected"
            );
        }
    }

    #[tokio::test]
    async fn installs_nested_entries_and_normalizes_backslashes() {
        let dir = tempfile::tempdir().unwrap();
        let installer = Installer::new(Host::local(dir.path()));
        let encoded = zip_base64(&[
            ("plugin.json", MANIFEST),
            ("main.js", b"console.log(1)"),
            ("assets/", b""),
            ("assets\\img\\logo.svg", b"<svg/>"),
            ("lang/en/strings.json", b"{}"),
        ]);

        let id = installer.install_plugin_zip(&encoded).await.unwrap();
        assert_eq!(id, "demo");

        let root = dir.path().join("plugins").join("demo");
        assert!(root.join("assets").is_dir());
        assert_eq!(std::fs::read(root.join("assets/img/logo.svg")).unwrap(), b"<svg/>");
        assert_eq!(std::fs::read(root.join("lang/en/strings.json")).unwrap(), b"{}");
        assert_eq!(std::fs::read(root.join("main.js")).unwrap(), b"console.log(1)");
    }

    #[tokio::test]
    async fn overwrites_existing_files_and_tolerates_unmount_failure() {
        let dir = tempfile::tempdir().unwrap();
        let (host, _, lifecycle) = recording_host(dir.path());
        let installer = Installer::new(host);

        let v1 = zip_base64(&[("plugin.json", MANIFEST), ("main.js", b"version one, longer")]);
        let v2 = zip_base64(&[("plugin.json", MANIFEST), ("main.js", b"v2")]);
        installer.install_plugin_zip(&v1).await.unwrap();
        installer.install_plugin_zip(&v2).await.unwrap();

        let main = dir.path().join("plugins/demo/main.js");
        assert_eq!(std::fs::read(main).unwrap(), b"v2");

        let mounts = lifecycle.mounts.lock();
        assert_eq!(mounts.len(), 2);
        assert!(mounts[0].1.first_init);
        assert!(!mounts[1].1.first_init);
        assert_eq!(mounts[1].1.cache_file, dir.path().join("cache").join("demo"));
    }

    #[tokio::test]
    async fn load_creates_cache_file_and_mounts() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = Arc::new(LocalRuntime::default());
        let host = Host {
            storage: Arc::new(FsStorage),
            lifecycle: runtime.clone(),
            notifier: Arc::new(LogNotifier),
            layout: StorageLayout::new(dir.path()),
        };
        let installer = Installer::new(host);
        installer.load_plugin("demo", false).await.unwrap();

        assert!(dir.path().join("cache").join("demo").is_file());
        assert!(runtime.is_mounted("demo"));
        let base_url = runtime.base_url("demo").unwrap();
        assert!(base_url.starts_with("file://"));
        assert!(base_url.ends_with("/plugins/demo/"));
    }

    #[tokio::test]
    async fn segment_walk_creates_each_level() {
        let dir = tempfile::tempdir().unwrap();
        let storage = RecordingStorage::default();
        create_recursive(&storage, dir.path(), "a/b/c.txt").await.unwrap();
        create_recursive(&storage, dir.path(), "a/d/").await.unwrap();

        assert_eq!(
            *storage.mutations.lock(),
            vec!["mkdir a", "mkdir b", "touch c.txt", "mkdir a", "mkdir d"]
        );
        assert!(dir.path().join("a/b/c.txt").is_file());
        assert!(dir.path().join("a/d").is_dir());
    }

    #[tokio::test]
    async fn round_trip_from_build_output() {
        let src = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        let data = tempfile::tempdir().unwrap();
        write_plugin(src.path(), "com.example.demo");

        let archive = build_plugin(src.path(), out.path(), &HotReloadConfig::default(), &CopyBundler)
            .await
            .unwrap();
        let bundle = std::fs::read(out.path().join("main.js")).unwrap();
        let encoded = BASE64.encode(std::fs::read(&archive).unwrap());

        let installer = Installer::new(Host::local(data.path()));
        let id = installer.install_plugin_zip(&encoded).await.unwrap();
        assert_eq!(id, "com.example.demo");

        let installed: PathBuf = data.path().join("plugins").join(&id);
        let manifest: Value =
            serde_json::from_slice(&std::fs::read(installed.join("plugin.json")).unwrap()).unwrap();
        assert_eq!(manifest["id"], "com.example.demo");
        assert_eq!(std::fs::read(installed.join("main.js")).unwrap(), bundle);
    }

    #[test]
    fn path_escape_detection() {
        assert!(!is_path_escape("main.js"));
        assert!(!is_path_escape("assets/icon.png"));
        assert!(!is_path_escape("assets/"));
        assert!(is_path_escape("../main.js"));
        assert!(is_path_escape("a/../../b"));
        assert!(is_path_escape("/etc/passwd"));
    }
}

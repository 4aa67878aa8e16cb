//! Plugin build pipeline: entry resolution, bundling, and archive packaging.

use async_trait::async_trait;
use std::collections::HashSet;
use std::ffi::OsString;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::config::HotReloadConfig;
use crate::error::{Error, Result};
use crate::toolchain;

/// Archive written on every build, always at `<out_dir>/dist.zip`.
pub const ARCHIVE_NAME: &str = "dist.zip";
/// Name of the compiled bundle, both on disk and inside the archive.
pub const BUNDLE_NAME: &str = "main.js";
pub const MANIFEST_NAME: &str = "plugin.json";

/// Probed in this order when no `mainEntry` is configured.
const ENTRY_CANDIDATES: [&str; 3] = ["main.ts", "main.js", "main.tsx"];

/// Shipped from the plugin root whenever they exist.
const ROOT_ASSETS: [&str; 3] = ["icon.png", MANIFEST_NAME, "readme.md"];

/// Turns an entry point into one self-contained script.
#[async_trait]
pub trait Bundler: Send + Sync {
    async fn bundle(&self, project_dir: &Path, entry: &Path, out_file: &Path) -> Result<()>;
}

/// Runs the `esbuild` executable: minified ESM output, CSS imported as text,
/// WASM imported as binary.
#[derive(Debug, Default, Clone)]
pub struct EsbuildBundler;

impl EsbuildBundler {
    fn args(entry: &Path, out_file: &Path) -> Vec<OsString> {
        let mut outfile = OsString::from("--outfile=");
        outfile.push(out_file);
        vec![
            entry.as_os_str().to_owned(),
            "--bundle".into(),
            "--minify".into(),
            "--format=esm".into(),
            "--loader:.css=text".into(),
            "--loader:.wasm=binary".into(),
            "--conditions=style".into(),
            "--global-name=plugin".into(),
            "--log-level=error".into(),
            outfile,
        ]
    }
}

#[async_trait]
impl Bundler for EsbuildBundler {
    async fn bundle(&self, project_dir: &Path, entry: &Path, out_file: &Path) -> Result<()> {
        let exe = toolchain::resolve_tool(project_dir, "esbuild");
        let output = tokio::process::Command::new(&exe)
            .args(Self::args(entry, out_file))
            .current_dir(project_dir)
            .output()
            .await
            .map_err(|e| Error::Build(format!("failed to run {}: {e}", exe.display())))?;

        if output.status.success() {
            Ok(())
        } else {
            let diagnostic = String::from_utf8_lossy(&output.stderr).trim().to_string();
            Err(Error::Build(if diagnostic.is_empty() {
                format!("esbuild exited with {}", output.status)
            } else {
                diagnostic
            }))
        }
    }
}

/// Pick the entry point: the configured one (which must exist), otherwise
/// the first of `main.ts`, `main.js`, `main.tsx` found.
pub fn resolve_entry_point(source_dir: &Path, main_entry: Option<&str>) -> Result<PathBuf> {
    if let Some(configured) = main_entry {
        let path = source_dir.join(configured);
        if path.is_file() {
            return Ok(path);
        }
        return Err(Error::Configuration(format!(
            "configured entry point {} does not exist",
            path.display()
        )));
    }

    ENTRY_CANDIDATES
        .iter()
        .map(|name| source_dir.join(name))
        .find(|path| path.is_file())
        .ok_or_else(|| {
            Error::Configuration(format!(
                "no entry point found in {} (checked {})",
                source_dir.display(),
                ENTRY_CANDIDATES.join(", ")
            ))
        })
}

/// One file going into the archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ArchiveEntry {
    pub name: String,
    pub source: PathBuf,
}

/// Everything shipped besides the bundle: root assets, then extra files
/// flattened to their base names. Missing files are skipped; a name already
/// taken is skipped with a warning.
pub(crate) fn collect_entries(
    source_dir: &Path,
    bundle: &Path,
    extra_files: &[String],
) -> Vec<ArchiveEntry> {
    let mut entries = vec![ArchiveEntry {
        name: BUNDLE_NAME.to_string(),
        source: bundle.to_path_buf(),
    }];
    let mut taken: HashSet<String> = HashSet::from([BUNDLE_NAME.to_string()]);

    for asset in ROOT_ASSETS {
        let path = source_dir.join(asset);
        if path.is_file() {
            taken.insert(asset.to_string());
            entries.push(ArchiveEntry {
                name: asset.to_string(),
                source: path,
            });
        }
    }

    for extra in extra_files {
        let path = source_dir.join(extra);
        if !path.is_file() {
            tracing::debug!("Skipping missing extra file {}", path.display());
            continue;
        }
        let Some(name) = path.file_name().map(|n| n.to_string_lossy().into_owned()) else {
            continue;
        };
        if !taken.insert(name.clone()) {
            tracing::warn!("Skipping extra file {extra}: archive already has {name}");
            continue;
        }
        entries.push(ArchiveEntry { name, source: path });
    }

    entries
}

fn zip_error(err: zip::result::ZipError) -> Error {
    Error::Io(io::Error::other(err))
}

/// Write the archive synchronously. Runs on the blocking pool.
pub(crate) fn write_archive(path: &Path, entries: &[ArchiveEntry]) -> Result<()> {
    let file = File::create(path)?;
    let mut zip = ZipWriter::new(file);
    let options = SimpleFileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .compression_level(Some(9));

    for entry in entries {
        zip.start_file(entry.name.as_str(), options).map_err(zip_error)?;
        let mut source = File::open(&entry.source)?;
        io::copy(&mut source, &mut zip)?;
    }

    zip.finish().map_err(zip_error)?;
    Ok(())
}

/// Build a plugin and package it. Returns the archive path.
///
/// Builds are not serialized here: two concurrent calls with the same
/// `out_dir` race on the same files. Callers must run one at a time.
pub async fn build_plugin(
    source_dir: &Path,
    out_dir: &Path,
    config: &HotReloadConfig,
    bundler: &dyn Bundler,
) -> Result<PathBuf> {
    if !source_dir.is_dir() {
        return Err(Error::Configuration(format!(
            "plugin directory not found at {}",
            source_dir.display()
        )));
    }

    let entry = resolve_entry_point(source_dir, config.main_entry.as_deref())?;

    if !source_dir.join(MANIFEST_NAME).is_file() {
        return Err(Error::Configuration(format!(
            "{MANIFEST_NAME} not found in {}",
            source_dir.display()
        )));
    }

    tokio::fs::create_dir_all(out_dir).await?;

    let bundle = out_dir.join(BUNDLE_NAME);
    tracing::debug!("Bundling {} -> {}", entry.display(), bundle.display());
    bundler.bundle(source_dir, &entry, &bundle).await?;

    let archive = out_dir.join(ARCHIVE_NAME);
    let entries = collect_entries(source_dir, &bundle, &config.extra_files);
    let target = archive.clone();
    tokio::task::spawn_blocking(move || write_archive(&target, &entries))
        .await
        .map_err(io::Error::other)??;

    Ok(archive)
}

//! Bundler executable resolution with caching.
//!
//! Plugin projects usually install esbuild locally, so the project's
//! `node_modules/.bin` is probed first. After that come directories where
//! global npm/yarn/pnpm installs land (often missing from PATH when launched
//! from an IDE task runner), and finally the bare name for a PATH lookup.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

/// Global install locations for node tooling, computed once.
fn extra_bin_dirs() -> &'static [PathBuf] {
    static DIRS: OnceLock<Vec<PathBuf>> = OnceLock::new();
    DIRS.get_or_init(|| {
        let home = dirs::home_dir().unwrap_or_default();
        let mut dirs = Vec::new();

        #[cfg(not(target_os = "windows"))]
        {
            dirs.extend([
                PathBuf::from("/usr/local/bin"),
                PathBuf::from("/usr/bin"),
                home.join(".npm-global/bin"),
                home.join(".local/share/pnpm"),
                home.join(".yarn/bin"),
            ]);
        }

        #[cfg(target_os = "macos")]
        {
            dirs.push(PathBuf::from("/opt/homebrew/bin"));
        }

        #[cfg(target_os = "windows")]
        {
            dirs.push(home.join("AppData").join("Roaming").join("npm"));
        }

        dirs
    })
}

fn executable_name(name: &str) -> String {
    if cfg!(target_os = "windows") {
        format!("{name}.cmd")
    } else {
        name.to_string()
    }
}

/// Resolve a node tool for a given project directory.
///
/// Found installs are cached per (project, tool) pair. The bare-name `PATH`
/// fallback is never cached, so a tool installed into the project while a
/// watch session runs is picked up on the next build.
pub fn resolve_tool(project_dir: &Path, name: &str) -> PathBuf {
    static CACHE: OnceLock<parking_lot::Mutex<HashMap<(PathBuf, String), PathBuf>>> = OnceLock::new();
    let cache = CACHE.get_or_init(|| parking_lot::Mutex::new(HashMap::new()));
    let key = (project_dir.to_path_buf(), name.to_string());

    if let Some(cached) = cache.lock().get(&key).filter(|path| path.exists()) {
        return cached.clone();
    }

    match find_tool(project_dir, name) {
        Some(found) => {
            cache.lock().insert(key, found.clone());
            found
        }
        None => {
            cache.lock().remove(&key);
            PathBuf::from(executable_name(name))
        }
    }
}

/// Look for an installed copy of the tool, without touching the cache.
fn find_tool(project_dir: &Path, name: &str) -> Option<PathBuf> {
    let exe = executable_name(name);

    let local = project_dir.join("node_modules").join(".bin").join(&exe);
    if local.exists() {
        return Some(local);
    }

    extra_bin_dirs()
        .iter()
        .map(|dir| dir.join(&exe))
        .find(|candidate| candidate.exists())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extra_bin_dirs_has_no_duplicates() {
        let mut seen = std::collections::HashSet::new();
        for dir in extra_bin_dirs() {
            assert!(seen.insert(dir), "Duplicate directory in extra_bin_dirs: {}", dir.display());
        }
    }

    #[test]
    fn prefers_project_local_install() {
        let dir = tempfile::tempdir().unwrap();
        let bin = dir.path().join("node_modules").join(".bin");
        std::fs::create_dir_all(&bin).unwrap();
        let exe = bin.join(executable_name("esbuild"));
        std::fs::write(&exe, "#!/bin/sh\n").unwrap();

        assert_eq!(find_tool(dir.path(), "esbuild"), Some(exe));
    }

    #[test]
    fn falls_back_to_bare_name() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(find_tool(dir.path(), "nonexistent_bundler_xyz_123"), None);
        assert_eq!(
            resolve_tool(dir.path(), "nonexistent_bundler_xyz_123"),
            PathBuf::from(executable_name("nonexistent_bundler_xyz_123"))
        );
    }

    #[test]
    fn picks_up_tool_installed_after_first_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let tool = "late_installed_bundler_xyz";
        assert_eq!(resolve_tool(dir.path(), tool), PathBuf::from(executable_name(tool)));

        let bin = dir.path().join("node_modules").join(".bin");
        std::fs::create_dir_all(&bin).unwrap();
        let exe = bin.join(executable_name(tool));
        std::fs::write(&exe, "#!/bin/sh\n").unwrap();

        assert_eq!(resolve_tool(dir.path(), tool), exe);
        assert_eq!(resolve_tool(dir.path(), tool), exe);
    }

    #[test]
    fn forgets_cached_install_once_removed() {
        let dir = tempfile::tempdir().unwrap();
        let tool = "removed_bundler_xyz";
        let bin = dir.path().join("node_modules").join(".bin");
        std::fs::create_dir_all(&bin).unwrap();
        let exe = bin.join(executable_name(tool));
        std::fs::write(&exe, "#!/bin/sh\n").unwrap();
        assert_eq!(resolve_tool(dir.path(), tool), exe);

        std::fs::remove_file(&exe).unwrap();
        assert_eq!(resolve_tool(dir.path(), tool), PathBuf::from(executable_name(tool)));
    }
}

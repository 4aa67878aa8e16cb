//! Hot reload for mobile editor plugins.
//!
//! The server side watches a plugin project, rebuilds and packages it on
//! change, and pushes the archive to connected editors. The client side
//! receives archives and installs them over the live plugin.

pub mod activity_log;
pub mod builder;
pub mod client;
pub mod config;
pub mod dev_server;
pub mod error;
pub mod host;
pub mod installer;
pub mod protocol;
pub mod socket;
pub mod toolchain;
pub mod watcher;

pub use builder::{Bundler, EsbuildBundler, build_plugin};
pub use client::SocketClient;
pub use config::HotReloadConfig;
pub use dev_server::{Command, DevServer};
pub use error::{Error, Result};
pub use host::Host;
pub use installer::Installer;
pub use socket::{ServerEvent, SocketServer};
pub use watcher::{ChangeEvent, ChangeKind, WatchEvent, Watcher};

/// Default `RUST_LOG` directive for both binaries.
pub const DEFAULT_LOG_FILTER: &str = "hot_reload_lib=info,hot_reload=info,hot_reload_client=info";

/// Install the fmt subscriber, honouring `RUST_LOG` when set.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(DEFAULT_LOG_FILTER));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

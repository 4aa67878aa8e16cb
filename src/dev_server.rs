//! Dev server orchestration: watcher → build → broadcast.
//!
//! One `select!` loop owns every moving part. Builds run inline on that loop,
//! so a second change arriving mid-build waits for the first build to finish.

use chrono::{DateTime, Local};
use std::fmt;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;

use crate::activity_log::{ActivityEntry, ActivityLog, LevelFilter};
use crate::builder::{Bundler, build_plugin};
use crate::config::HotReloadConfig;
use crate::error::Result;
use crate::protocol::DONE;
use crate::socket::{ServerEvent, SocketServer};
use crate::watcher::{WatchEvent, Watcher};

/// User commands fed into the loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Rebuild,
    TogglePause,
    /// Print the activity log with the given filter.
    ShowLog(LevelFilter),
    Quit,
}

impl Command {
    /// Map a line of keyboard input to a command. Log filters are accepted
    /// both as `1`-`5` shortcuts and by name (`all`, `info`, `error`, ...).
    pub fn from_input(line: &str) -> Option<Self> {
        match line.trim() {
            "r" => Some(Self::Rebuild),
            "p" => Some(Self::TogglePause),
            "q" => Some(Self::Quit),
            other => LevelFilter::from_shortcut(other)
                .or_else(|| other.parse().ok())
                .map(Self::ShowLog),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildStatus {
    Idle,
    Building,
    Error,
}

impl fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Idle => "Idle",
            Self::Building => "Building",
            Self::Error => "Error",
        })
    }
}

pub struct DevServer {
    plugin_dir: PathBuf,
    out_dir: PathBuf,
    config: Arc<HotReloadConfig>,
    bundler: Arc<dyn Bundler>,
    watcher: Watcher,
    watch_events: UnboundedReceiver<WatchEvent>,
    server: SocketServer,
    server_events: UnboundedReceiver<ServerEvent>,
    log: ActivityLog,
    status: BuildStatus,
    paused: bool,
    clients: usize,
    last_build: Option<DateTime<Local>>,
}

impl DevServer {
    pub fn new(
        plugin_dir: impl Into<PathBuf>,
        out_dir: impl Into<PathBuf>,
        port: u16,
        config: Arc<HotReloadConfig>,
        bundler: Arc<dyn Bundler>,
    ) -> Self {
        let plugin_dir = plugin_dir.into();
        let (watcher, watch_events) = Watcher::new(plugin_dir.clone(), config.debounce());
        let (server, server_events) = SocketServer::new(port);
        Self {
            plugin_dir,
            out_dir: out_dir.into(),
            config,
            bundler,
            watcher,
            watch_events,
            server,
            server_events,
            log: ActivityLog::default(),
            status: BuildStatus::Idle,
            paused: false,
            clients: 0,
            last_build: None,
        }
    }

    /// Start the socket server and the watcher.
    pub async fn start(&mut self) -> Result<SocketAddr> {
        let addr = self.server.start().await?;
        self.log.info(format!("Server started on port {}", addr.port()));
        if let Err(e) = self.watcher.start() {
            self.server.shutdown();
            return Err(e);
        }
        Ok(addr)
    }

    /// Drive the loop until `Quit` arrives or the command channel closes.
    pub async fn run(&mut self, mut commands: UnboundedReceiver<Command>) {
        loop {
            tokio::select! {
                Some(event) = self.watch_events.recv() => self.on_watch_event(event).await,
                Some(event) = self.server_events.recv() => self.on_server_event(event),
                command = commands.recv() => match command {
                    Some(Command::Quit) | None => break,
                    Some(command) => self.on_command(command).await,
                },
            }
        }
        self.shutdown();
    }

    pub fn shutdown(&mut self) {
        self.watcher.stop();
        self.server.shutdown();
        tracing::info!("Hot reload server stopped");
    }

    async fn on_watch_event(&mut self, event: WatchEvent) {
        match event {
            WatchEvent::Ready => {
                let message = format!("Watching {}", self.plugin_dir.display());
                self.log.info(message);
            }
            WatchEvent::Change(change) => {
                self.log
                    .info(format!("File {}: {}", change.kind, change.path.display()));
                self.rebuild(false).await;
            }
            WatchEvent::Error(message) => {
                self.log.error(format!("Watcher error: {message}"));
            }
        }
    }

    fn on_server_event(&mut self, event: ServerEvent) {
        match event {
            ServerEvent::Listening(addr) => tracing::debug!("Listening on {addr}"),
            ServerEvent::Connection(count) => {
                self.clients = count;
                self.log.info(format!("Client connected. Total: {count}"));
            }
            ServerEvent::Disconnection(count) => {
                self.clients = count;
                self.log.warning(format!("Client disconnected. Total: {count}"));
            }
            ServerEvent::Message { envelope, .. } if envelope.kind == DONE => {
                self.log.success("Client installed update successfully");
            }
            ServerEvent::Message { client, envelope } => {
                tracing::debug!("Ignoring {} message from {client}", envelope.kind);
            }
        }
    }

    async fn on_command(&mut self, command: Command) {
        match command {
            Command::Rebuild => {
                self.log.info("Manual rebuild triggered.");
                self.rebuild(true).await;
            }
            Command::TogglePause => self.toggle_pause(),
            Command::ShowLog(filter) => {
                println!("{}", self.status_line());
                for entry in self.log.entries(filter) {
                    println!("{entry}");
                }
            }
            Command::Quit => {}
        }
    }

    /// Build, package and broadcast once. Returns the number of clients the
    /// update reached, or `None` if the build failed.
    pub async fn rebuild(&mut self, manual: bool) -> Option<usize> {
        let prefix = if manual { "Manual build" } else { "Build" };
        self.status = BuildStatus::Building;

        match build_plugin(&self.plugin_dir, &self.out_dir, &self.config, self.bundler.as_ref()).await {
            Ok(archive) => {
                self.log
                    .success(format!("{prefix} successful: {}", archive.display()));
                self.last_build = Some(Local::now());
                let reached = self.server.broadcast_file(&archive).await;
                self.log.info(format!("Update sent to {reached} clients"));
                self.status = BuildStatus::Idle;
                Some(reached)
            }
            Err(e) => {
                self.log.error(format!("{prefix} failed: {e}"));
                self.status = BuildStatus::Error;
                None
            }
        }
    }

    pub fn toggle_pause(&mut self) {
        if self.paused {
            match self.watcher.start() {
                Ok(()) => {
                    self.paused = false;
                    self.log.info("Watcher resumed.");
                }
                Err(e) => {
                    self.log.error(format!("Failed to resume watcher: {e}"));
                }
            }
        } else {
            self.watcher.stop();
            self.paused = true;
            self.log.warning("Watcher paused.");
        }
    }

    pub fn status(&self) -> BuildStatus {
        self.status
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn clients(&self) -> usize {
        self.clients
    }

    pub fn last_build(&self) -> Option<DateTime<Local>> {
        self.last_build
    }

    pub fn plugin_dir(&self) -> &Path {
        &self.plugin_dir
    }

    pub fn config(&self) -> &HotReloadConfig {
        &self.config
    }

    pub fn entries(&self, filter: LevelFilter) -> Vec<ActivityEntry> {
        self.log.entries(filter)
    }

    /// One-line summary for the terminal.
    pub fn status_line(&self) -> String {
        let last = self
            .last_build
            .map(|t| t.format("%H:%M:%S").to_string())
            .unwrap_or_else(|| "never".into());
        format!(
            "Status: {} | Clients: {} | Watcher: {} | Last build: {last}",
            self.status,
            self.clients,
            if self.paused { "paused" } else { "active" },
        )
    }
}

use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc::{UnboundedSender, unbounded_channel};

use hot_reload_lib::config::{ConfigOverrides, config_file_path, load_config};
use hot_reload_lib::{Command, DevServer, EsbuildBundler};

/// Watch a plugin project and push rebuilt archives to connected editors.
#[derive(Debug, Parser)]
#[command(name = "hot-reload", version, about)]
struct Args {
    /// Plugin project directory.
    #[arg(default_value = ".")]
    plugin_dir: PathBuf,

    /// WebSocket port.
    #[arg(short, long, default_value_t = 3000, env = "HOT_RELOAD_PORT")]
    port: u16,

    /// Config file (defaults to <PLUGIN_DIR>/hot.reload.json).
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Entry file, relative to the plugin directory.
    #[arg(long)]
    main_entry: Option<String>,

    /// Extra files to ship at the archive root.
    #[arg(long, num_args = 1..)]
    extra_files: Option<Vec<String>>,

    /// Debounce window in milliseconds.
    #[arg(long)]
    debounce: Option<u64>,

    /// Where the bundle and archive are written.
    #[arg(long, default_value = "./dist")]
    out_dir: PathBuf,
}

fn spawn_stdin_commands(commands: UnboundedSender<Command>) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            match Command::from_input(&line) {
                Some(command) => {
                    if commands.send(command).is_err() {
                        break;
                    }
                }
                None if line.trim().is_empty() => {}
                None => println!("Unknown command {:?}. Keys: r rebuild, p pause, q quit, 1-5 or all/info/success/warning/error log filter", line.trim()),
            }
        }
    });
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    hot_reload_lib::init_tracing();
    let args = Args::parse();

    let cwd = std::env::current_dir().context("current directory is not accessible")?;
    let plugin_dir = if args.plugin_dir.is_absolute() {
        args.plugin_dir.clone()
    } else {
        cwd.join(&args.plugin_dir)
    };
    let out_dir = if args.out_dir.is_absolute() {
        args.out_dir.clone()
    } else {
        cwd.join(&args.out_dir)
    };

    let config_path = config_file_path(&plugin_dir, args.config.as_deref(), &cwd);
    let config = load_config(
        &config_path,
        ConfigOverrides {
            main_entry: args.main_entry,
            extra_files: args.extra_files,
            debounce: args.debounce,
        },
    );

    println!("Plugin: {}", plugin_dir.display());
    println!("Config: {}", config_path.display());
    for (key, value) in config.display_rows() {
        println!("  {key}: {value}");
    }

    let mut server = DevServer::new(
        &plugin_dir,
        &out_dir,
        args.port,
        Arc::new(config),
        Arc::new(EsbuildBundler),
    );
    let addr = server
        .start()
        .await
        .with_context(|| format!("failed to start hot reload for {}", plugin_dir.display()))?;
    println!("Listening on ws://{addr}  (r rebuild, p pause, q quit, 1-5 log filter)");

    let (commands, rx) = unbounded_channel();
    spawn_stdin_commands(commands.clone());
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = commands.send(Command::Quit);
        }
    });

    server.run(rx).await;
    Ok(())
}

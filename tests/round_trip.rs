use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

use hot_reload_lib::host::{FsStorage, LocalRuntime, LogNotifier, StorageLayout};
use hot_reload_lib::protocol::DONE;
use hot_reload_lib::{Bundler, Host, HotReloadConfig, Installer, ServerEvent, SocketClient, SocketServer, build_plugin};

struct CopyBundler;

#[async_trait]
impl Bundler for CopyBundler {
    async fn bundle(&self, _project_dir: &Path, entry: &Path, out_file: &Path) -> hot_reload_lib::Result<()> {
        tokio::fs::copy(entry, out_file).await?;
        Ok(())
    }
}

#[tokio::test]
async fn build_broadcast_install() {
    let src = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    let data = tempfile::tempdir().unwrap();

    std::fs::write(
        src.path().join("plugin.json"),
        r#"{"id":"acode.demo","name":"Demo","version":"1.2.0"}"#,
    )
    .unwrap();
    std::fs::write(src.path().join("main.ts"), "export default 42;").unwrap();
    std::fs::write(src.path().join("LICENSE"), "MIT").unwrap();
    let config: HotReloadConfig = serde_json::from_str(r#"{"extraFiles":["LICENSE"],"color":"blue"}"#).unwrap();

    let archive = build_plugin(src.path(), out.path(), &config, &CopyBundler).await.unwrap();
    let bundle = std::fs::read(out.path().join("main.js")).unwrap();

    let (server, mut events) = SocketServer::new(0);
    let addr = server.start().await.unwrap();

    let runtime = Arc::new(LocalRuntime::default());
    let host = Host {
        storage: Arc::new(FsStorage),
        lifecycle: runtime.clone(),
        notifier: Arc::new(LogNotifier),
        layout: StorageLayout::new(data.path()),
    };
    let client = SocketClient::new(Installer::new(host));
    client.connect(&format!("ws://127.0.0.1:{}", addr.port())).await;
    assert!(client.is_connected());

    let done = timeout(Duration::from_secs(10), async {
        let mut sent = false;
        loop {
            match events.recv().await.expect("server events open") {
                ServerEvent::Connection(_) if !sent => {
                    assert_eq!(server.broadcast_file(&archive).await, 1);
                    sent = true;
                }
                ServerEvent::Message { envelope, .. } => return envelope,
                _ => {}
            }
        }
    })
    .await
    .expect("client answered");
    assert_eq!(done.kind, DONE);

    let installed = data.path().join("plugins").join("acode.demo");
    let manifest: serde_json::Value =
        serde_json::from_slice(&std::fs::read(installed.join("plugin.json")).unwrap()).unwrap();
    assert_eq!(manifest["id"], "acode.demo");
    assert_eq!(std::fs::read(installed.join("main.js")).unwrap(), bundle);
    assert_eq!(std::fs::read_to_string(installed.join("LICENSE")).unwrap(), "MIT");
    assert!(data.path().join("cache").join("acode.demo").is_file());
    assert!(runtime.is_mounted("acode.demo"));

    client.disconnect();
    server.shutdown();
}

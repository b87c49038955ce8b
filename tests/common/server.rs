//! Test server management.
//!
//! Spawns and manages rendezvousd instances for integration testing.

use std::process::{Child, Command};
use std::time::Duration;
use tempfile::TempDir;
use tokio::time::sleep;

/// A test broker instance.
pub struct TestServer {
    child: Child,
    port: u16,
    _data_dir: TempDir,
}

impl TestServer {
    /// Spawn a standalone broker with the in-memory waiting slot.
    pub async fn spawn(port: u16) -> anyhow::Result<Self> {
        Self::spawn_with(port, "").await
    }

    /// Spawn a broker, appending `extra` TOML sections to the base config.
    pub async fn spawn_with(port: u16, extra: &str) -> anyhow::Result<Self> {
        Self::spawn_named(port, "rendezvous.test", extra).await
    }

    /// Spawn a broker that shares the waiting slot stored at `db_path`.
    pub async fn spawn_shared(
        port: u16,
        instance: &str,
        db_path: &str,
        store_overrides: &str,
    ) -> anyhow::Result<Self> {
        let extra = format!(
            r#"
[store]
backend = "shared"
path = "{db_path}"
poll_interval_ms = 50
{store_overrides}
"#
        );
        Self::spawn_named_instance(port, "rendezvous.test", Some(instance), &extra).await
    }

    async fn spawn_named(port: u16, name: &str, extra: &str) -> anyhow::Result<Self> {
        Self::spawn_named_instance(port, name, None, extra).await
    }

    async fn spawn_named_instance(
        port: u16,
        name: &str,
        instance: Option<&str>,
        extra: &str,
    ) -> anyhow::Result<Self> {
        let data_dir = TempDir::new()?;
        let config_path = data_dir.path().join("config.toml");

        let instance_line = instance
            .map(|i| format!("instance = \"{i}\""))
            .unwrap_or_default();
        let has_limits = extra.contains("[limits]");
        let limits = if has_limits {
            ""
        } else {
            r#"
[limits]
message_rate_per_second = 1000
connection_burst_per_ip = 1000
"#
        };

        let config_content = format!(
            r#"
[server]
name = "{name}"
metrics_port = 0
{instance_line}

[listen]
address = "127.0.0.1:{port}"
{limits}
{extra}
"#
        );
        std::fs::write(&config_path, config_content)?;

        let child = Command::new(env!("CARGO_BIN_EXE_rendezvousd"))
            .arg(&config_path)
            .env("RUST_LOG", "warn")
            .spawn()?;

        let server = Self {
            child,
            port,
            _data_dir: data_dir,
        };

        // Wait for server to start listening
        server.wait_until_ready().await?;

        Ok(server)
    }

    /// Wait until the server is accepting connections.
    async fn wait_until_ready(&self) -> anyhow::Result<()> {
        for _ in 0..50 {
            if tokio::net::TcpStream::connect(("127.0.0.1", self.port))
                .await
                .is_ok()
            {
                return Ok(());
            }
            sleep(Duration::from_millis(100)).await;
        }
        anyhow::bail!("Server failed to start within 5 seconds")
    }

    /// Get the server address.
    pub fn address(&self) -> String {
        format!("127.0.0.1:{}", self.port)
    }

    /// Create a new test client connected to this server.
    pub async fn connect(&self) -> anyhow::Result<super::client::TestClient> {
        super::client::TestClient::connect(&self.address()).await
    }

    /// Kill the process without letting it clean up.
    #[allow(dead_code)]
    pub fn kill(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.kill();
    }
}

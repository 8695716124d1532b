pub mod config;
pub mod gateway;
pub mod mcp_client;
pub mod server;

#[cfg(test)]
pub(crate) mod testing;

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::Context;

use config::GatewayConfig;
use gateway::Gateway;
use mcp_client::{McpTransportFactory, TransportFactory};

/// Return the platform-standard data directory for the gateway.
///
/// - macOS: `~/Library/Application Support/mcp-gateway/`
/// - Windows: `{FOLDERID_RoamingAppData}\mcp-gateway\`
/// - Linux: `$XDG_DATA_HOME/mcp-gateway/` (fallback `~/.local/share/...`)
///
/// Falls back to `~/.mcp-gateway/` only if none of the above can be resolved.
pub fn data_dir() -> PathBuf {
    if let Some(dir) = dirs::data_dir() {
        return dir.join("mcp-gateway");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".mcp-gateway")
}

fn default_filter(debug: bool) -> &'static str {
    if debug {
        "mcp_gateway=debug,info"
    } else {
        "mcp_gateway=info,warn"
    }
}

/// Initialize the tracing subscriber.
///
/// stdout carries the MCP protocol, so logs go to `gateway.log` in the data
/// directory, rotated on every start (last 3 kept). If that file cannot be
/// opened, logs go to stderr.
fn init_tracing(verbose: bool) {
    use tracing_subscriber::fmt;
    use tracing_subscriber::EnvFilter;

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter(verbose)));

    let log_dir = data_dir();
    let log_path = log_dir.join("gateway.log");
    let opened = std::fs::create_dir_all(&log_dir).and_then(|()| {
        rotate_log_file(&log_path, 3);
        std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
    });

    match opened {
        Ok(file) => {
            let _ = fmt::fmt()
                .with_env_filter(filter)
                .with_writer(FlushingWriter::new(file))
                .with_ansi(false)
                .with_target(true)
                .try_init();
        }
        Err(e) => {
            let _ = fmt::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .with_ansi(false)
                .try_init();
            tracing::warn!(path = %log_path.display(), error = %e, "cannot open log file, logging to stderr");
        }
    }

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        log_file = %log_path.display(),
        pid = std::process::id(),
        verbose,
        "=== mcp-gateway starting ==="
    );
}

/// Shift `gateway.log` to `gateway.log.1` and so on, dropping generation `keep`.
fn rotate_log_file(base_path: &Path, keep: u32) {
    let generation = |n: u32| -> PathBuf {
        if n == 0 {
            base_path.to_path_buf()
        } else {
            PathBuf::from(format!("{}.{n}", base_path.display()))
        }
    };
    let _ = std::fs::remove_file(generation(keep));
    for n in (0..keep).rev() {
        let _ = std::fs::rename(generation(n), generation(n + 1));
    }
}

/// Log sink shared by every tracing event; each write is flushed so the file
/// is complete even if the client kills the process.
#[derive(Clone)]
struct FlushingWriter(Arc<Mutex<std::fs::File>>);

impl FlushingWriter {
    fn new(file: std::fs::File) -> Self {
        Self(Arc::new(Mutex::new(file)))
    }

    fn with_file<T>(
        &self,
        op: impl FnOnce(&mut std::fs::File) -> std::io::Result<T>,
    ) -> std::io::Result<T> {
        match self.0.lock() {
            Ok(mut file) => op(&mut file),
            Err(_) => Err(std::io::Error::other("log file mutex poisoned")),
        }
    }
}

impl Write for FlushingWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.with_file(|file| {
            file.write_all(buf)?;
            file.flush()?;
            Ok(buf.len())
        })
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.with_file(|file| file.flush())
    }
}

impl tracing_subscriber::fmt::MakeWriter<'_> for FlushingWriter {
    type Writer = Self;

    fn make_writer(&self) -> Self {
        self.clone()
    }
}

/// Run the gateway on stdin/stdout until the client disconnects or the
/// process is interrupted, then close every downstream session.
pub async fn run() -> anyhow::Result<()> {
    let config = GatewayConfig::from_env().context("failed to resolve gateway configuration")?;
    init_tracing(config.debug);

    let factory: Arc<dyn TransportFactory> =
        Arc::new(McpTransportFactory::new(config.timeouts.shutdown()));
    let gateway = Gateway::new(&config, factory).with_context(|| {
        format!(
            "failed to load server registry from {}",
            config.registry_path.display()
        )
    })?;
    let gateway = Arc::new(gateway);
    tracing::info!(
        registry = %gateway.registry_path().display(),
        admin_gated = config.admin_token.is_some(),
        "gateway configured"
    );

    let report = gateway.start().await;
    for (id, e) in &report.failed {
        tracing::warn!(server = %id, error = %e, "server unavailable (non-fatal)");
    }

    let served = tokio::select! {
        result = server::serve(Arc::clone(&gateway), tokio::io::stdin(), tokio::io::stdout()) => result,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("interrupted");
            Ok(())
        }
    };

    let shutdown = gateway.shutdown().await;
    tracing::info!(
        closed = shutdown.closed.len(),
        failed = shutdown.failures.len(),
        "=== mcp-gateway stopped ==="
    );
    served
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_filter_follows_debug_toggle() {
        assert_eq!(default_filter(true), "mcp_gateway=debug,info");
        assert_eq!(default_filter(false), "mcp_gateway=info,warn");
    }

    #[test]
    fn test_rotate_keeps_last_three() {
        let dir = tempfile::TempDir::new().unwrap();
        let base = dir.path().join("gateway.log");
        for generation in 0..5 {
            rotate_log_file(&base, 3);
            std::fs::write(&base, format!("run {generation}")).unwrap();
        }

        assert_eq!(std::fs::read_to_string(&base).unwrap(), "run 4");
        for (suffix, expected) in [(1, "run 3"), (2, "run 2"), (3, "run 1")] {
            let path = dir.path().join(format!("gateway.log.{suffix}"));
            assert_eq!(std::fs::read_to_string(path).unwrap(), expected);
        }
        assert!(!dir.path().join("gateway.log.4").exists());
    }

    #[test]
    fn test_flushing_writer_writes_through() {
        use std::io::Write;

        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("out.log");
        let file = std::fs::File::create(&path).unwrap();
        let mut writer = FlushingWriter::new(file);
        writer.write_all(b"line\n").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "line\n");
    }
}

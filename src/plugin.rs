//! Uniform plugin lifecycle (`Config -> Init -> Run`) and the runner that
//! drives a set of plugins concurrently until shutdown.
//!
//! Grounded in `application/plugin.go`'s `Plugin` interface and
//! `NewPluginConfig`'s no-op `basicPlugin` defaults, and in
//! `application/app.go`'s `App` (`Use`, `Hook`, `listenSigns`, the
//! `errgroup`-driven `RunE`). The cobra/viper file-and-env config loader
//! that calls `Config`/`Init` in the Go source is an outer concern the core
//! does not implement (spec §1 non-goal); `PluginConfigOptions` still
//! carries the hints a surrounding loader would read.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::Result;

/// File name, file type and env-var prefix hints for an outer config
/// loader. The core never reads these itself.
#[derive(Debug, Clone, Default)]
pub struct PluginConfigOptions {
    pub config_file: String,
    pub config_name: String,
    pub config_type: String,
    pub env_prefix: String,
}

/// Shared context handed to every lifecycle stage.
#[derive(Clone)]
pub struct Context {
    pub cancellation: CancellationToken,
}

impl Context {
    pub fn new() -> Self {
        Self {
            cancellation: CancellationToken::new(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

/// The uniform contract every runtime component implements (spec §4.6).
#[async_trait]
pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;

    fn config_options(&self) -> PluginConfigOptions {
        PluginConfigOptions::default()
    }

    /// Parses this plugin's own config from raw bytes. Default: no-op,
    /// matching `basicPlugin.Config`.
    async fn config(&self, _ctx: &Context, _bytes: &[u8]) -> Result<()> {
        Ok(())
    }

    /// Acquires resources. Must not block indefinitely. Default: no-op.
    async fn init(&self, _ctx: &Context) -> Result<()> {
        Ok(())
    }

    /// Serves until `ctx.cancellation` fires; returns the first error.
    async fn run(&self, ctx: &Context) -> Result<()>;
}

pub type HookFn = Arc<dyn Fn(&Context) -> Result<()> + Send + Sync>;

/// Drives a set of plugins through `Config -> Init` sequentially, then runs
/// them concurrently until one exits, the process receives a shutdown
/// signal, or the caller cancels the context directly.
///
/// The Rust-native replacement for `application.App`'s cobra command tree:
/// no CLI/flag parsing here (out of scope, spec §1), just the
/// register/hook/run sequencing and signal-driven cancellation.
#[derive(Default)]
pub struct Lifecycle {
    plugins: Vec<(Arc<dyn Plugin>, Vec<u8>)>,
    hooks: Vec<HookFn>,
}

impl Lifecycle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a plugin to run after startup (`App.Use`), with no raw
    /// config bytes (the plugin's default no-op `Config` applies). The
    /// file/env loader that would normally produce these bytes is an outer
    /// concern (spec §1 non-goal); use [`Lifecycle::use_plugin_with_config`]
    /// when the caller already has the bytes in hand.
    pub fn use_plugin(&mut self, plugin: Arc<dyn Plugin>) -> &mut Self {
        self.plugins.push((plugin, Vec::new()));
        self
    }

    /// Registers a plugin along with the raw config bytes its `Config`
    /// step should parse, mirroring `app.initPlugin` reading a config file
    /// into memory before calling the plugin's config hook.
    pub fn use_plugin_with_config(&mut self, plugin: Arc<dyn Plugin>, config: Vec<u8>) -> &mut Self {
        self.plugins.push((plugin, config));
        self
    }

    /// Registers a hook to run once before any plugin starts (`App.Hook`).
    pub fn hook(&mut self, hook: HookFn) -> &mut Self {
        self.hooks.push(hook);
        self
    }

    /// Runs `Init` for every plugin, then every hook, then every plugin's
    /// `Run` concurrently; returns the first error encountered, cancelling
    /// every other plugin's context. Also cancels on `SIGTERM`/`SIGINT`.
    pub async fn run(&self) -> Result<()> {
        let ctx = Context::new();

        for (plugin, config) in &self.plugins {
            if let Err(err) = plugin.config(&ctx, config).await {
                error!(component = "lifecycle", event = "config_failed", plugin = plugin.name(), error = %err);
                return Err(err);
            }
            if let Err(err) = plugin.init(&ctx).await {
                error!(component = "lifecycle", event = "init_failed", plugin = plugin.name(), error = %err);
                return Err(err);
            }
        }

        for hook in &self.hooks {
            hook(&ctx)?;
        }

        let signal_cancel = ctx.cancellation.clone();
        tokio::spawn(async move {
            listen_for_shutdown_signal().await;
            info!(component = "lifecycle", event = "shutdown_signal_received");
            signal_cancel.cancel();
        });

        let mut tasks = JoinSet::new();
        for (plugin, _) in self.plugins.clone() {
            let ctx = ctx.clone();
            let name = plugin.name().to_string();
            tasks.spawn(async move {
                let result = plugin.run(&ctx).await;
                (name, result)
            });
        }

        let mut first_err = None;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((name, Ok(()))) => {
                    info!(component = "lifecycle", event = "plugin_exited", plugin = %name);
                }
                Ok((name, Err(err))) => {
                    warn!(component = "lifecycle", event = "plugin_failed", plugin = %name, error = %err);
                    ctx.cancellation.cancel();
                    if first_err.is_none() {
                        first_err = Some(err);
                    }
                }
                Err(join_err) => {
                    warn!(component = "lifecycle", event = "plugin_panicked", error = %join_err);
                    ctx.cancellation.cancel();
                }
            }
        }

        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

async fn listen_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(_) => return,
        };
        let mut sigint = match signal(SignalKind::interrupt()) {
            Ok(s) => s,
            Err(_) => return,
        };
        tokio::select! {
            _ = sigterm.recv() => {}
            _ = sigint.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct EchoPlugin {
        ran: Arc<AtomicBool>,
    }

    #[async_trait]
    impl Plugin for EchoPlugin {
        fn name(&self) -> &str {
            "echo"
        }

        async fn run(&self, ctx: &Context) -> Result<()> {
            self.ran.store(true, Ordering::SeqCst);
            ctx.cancellation.cancelled().await;
            Ok(())
        }
    }

    struct FailingPlugin;

    #[async_trait]
    impl Plugin for FailingPlugin {
        fn name(&self) -> &str {
            "failing"
        }

        async fn run(&self, _ctx: &Context) -> Result<()> {
            Err(crate::Error::Config("boom".into()))
        }
    }

    #[tokio::test]
    async fn lifecycle_cancels_all_plugins_when_one_fails() {
        let ran = Arc::new(AtomicBool::new(false));
        let mut lifecycle = Lifecycle::new();
        lifecycle.use_plugin(Arc::new(EchoPlugin { ran: ran.clone() }));
        lifecycle.use_plugin(Arc::new(FailingPlugin));

        let result = lifecycle.run().await;
        assert!(result.is_err());
        assert!(ran.load(Ordering::SeqCst));
    }
}

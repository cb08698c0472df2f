//! Bridge runner for lifecycle management.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use tokio::task::JoinHandle;

use edgelink_common::{LoggingConfig, init_tracing};

use crate::BridgeArgs;
use crate::config::BridgeConfig;
use crate::error::{BridgeError, Result};
use crate::shutdown::{Shutdown, ShutdownTrigger, shutdown_channel};

type Teardown = Pin<Box<dyn Future<Output = ()> + Send>>;

/// How long teardown hooks get before remaining tasks are aborted.
const TEARDOWN_GRACE: Duration = Duration::from_secs(5);

/// Bridge runner that manages the lifecycle of a bridge process.
///
/// Handles:
/// - Logging initialization
/// - Task spawning and management
/// - Graceful shutdown on Ctrl+C or SIGTERM
/// - Teardown of external sessions before exit
///
/// # Example
///
/// ```ignore
/// use edgelink_bridge_framework::{BridgeArgs, BridgeConfig, BridgeRunner};
///
/// #[tokio::main]
/// async fn main() -> anyhow::Result<()> {
///     let args = BridgeArgs::parse_with_default("mybridge.json5");
///     let config = MyBridgeConfig::load(&args.config)?;
///
///     let mut runner = BridgeRunner::new_with_args("mybridge", config, Some(&args))?;
///     let shutdown = runner.shutdown();
///     runner.spawn(async move {
///         // Worker logic here, exit when `shutdown` fires
///     });
///
///     runner.run().await
/// }
/// ```
pub struct BridgeRunner<C: BridgeConfig> {
    /// Bridge name for logging.
    name: String,
    /// Bridge version.
    version: String,
    /// The loaded configuration.
    config: C,
    /// Shutdown signal shared with workers.
    trigger: ShutdownTrigger,
    /// Spawned tasks.
    tasks: Vec<JoinHandle<()>>,
    /// Hooks run after the shutdown signal, before tasks are aborted.
    teardown: Vec<(String, Teardown)>,
}

impl<C: BridgeConfig> BridgeRunner<C> {
    /// Create a new bridge runner and initialize logging from the config.
    pub fn new(name: impl Into<String>, config: C) -> Result<Self> {
        Self::new_with_args(name, config, None)
    }

    /// Create a new bridge runner with CLI args for log level override.
    pub fn new_with_args(
        name: impl Into<String>,
        config: C,
        args: Option<&BridgeArgs>,
    ) -> Result<Self> {
        let log_config = match args.and_then(|a| a.log_level.as_ref()) {
            Some(level) => LoggingConfig {
                level: level.clone(),
                format: config.logging().format,
            },
            None => config.logging().clone(),
        };

        init_tracing(&log_config).map_err(|e| BridgeError::config(e.to_string()))?;

        let runner = Self::without_logging(name, config);
        tracing::info!(bridge = %runner.name, version = %runner.version, "Starting bridge");
        Ok(runner)
    }

    /// Create a runner without touching the global tracing subscriber.
    pub fn without_logging(name: impl Into<String>, config: C) -> Self {
        let (trigger, _) = shutdown_channel();
        Self {
            name: name.into(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            config,
            trigger,
            tasks: Vec::new(),
            teardown: Vec::new(),
        }
    }

    /// Get the bridge name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the bridge version.
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Get a reference to the configuration.
    pub fn config(&self) -> &C {
        &self.config
    }

    /// Get a shutdown listener for a worker.
    pub fn shutdown(&self) -> Shutdown {
        self.trigger.subscribe()
    }

    /// Spawn a worker task.
    ///
    /// The task will be tracked and aborted on shutdown if still running.
    pub fn spawn<F>(&mut self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(future);
        self.tasks.push(handle);
    }

    /// Register a teardown hook, run once shutdown is signalled.
    ///
    /// Hooks run in registration order.
    pub fn on_shutdown<F>(&mut self, name: impl Into<String>, hook: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.teardown.push((name.into(), Box::pin(hook)));
    }

    /// Run the bridge until Ctrl+C or SIGTERM is received.
    pub async fn run(self) -> Result<()> {
        let name = self.name.clone();
        self.run_until(async move {
            wait_for_termination().await;
            tracing::info!(bridge = %name, "Received shutdown signal");
        })
        .await
    }

    /// Run the bridge until `signal` resolves.
    ///
    /// This will:
    /// 1. Wait for the signal
    /// 2. Notify every [`Shutdown`] listener
    /// 3. Run teardown hooks (bounded by a grace period)
    /// 4. Abort tasks that are still running
    pub async fn run_until<S>(self, signal: S) -> Result<()>
    where
        S: Future<Output = ()>,
    {
        tracing::info!(
            bridge = %self.name,
            tasks = self.tasks.len(),
            "Bridge running. Press Ctrl+C to stop."
        );

        signal.await;
        self.trigger.trigger();

        let hooks = async {
            for (hook, fut) in self.teardown {
                tracing::debug!(hook = %hook, "Running teardown");
                fut.await;
            }
        };
        if tokio::time::timeout(TEARDOWN_GRACE, hooks).await.is_err() {
            tracing::warn!(bridge = %self.name, "Teardown did not finish in time");
        }

        for task in &self.tasks {
            task.abort();
        }

        tracing::info!(bridge = %self.name, "Goodbye!");

        Ok(())
    }
}

/// Resolve on Ctrl+C, or on SIGTERM where available.
async fn wait_for_termination() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    result = tokio::signal::ctrl_c() => {
                        if let Err(e) = result {
                            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
                        }
                    }
                    _ = term.recv() => {}
                }
                return;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
            }
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for Ctrl+C");
    }
}

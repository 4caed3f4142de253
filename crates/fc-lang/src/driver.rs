//! Composition root.
//!
//! The [`Driver`] owns the handle table, the listening socket, the router
//! and the optional reverse channel. Both front doors (socket connections
//! and [`ForeignCallBridge`]) share its single table.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::net::UnixListener;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::bridge::transport;
use crate::foreign::ForeignCallBridge;
use crate::handle::HandleTable;
use crate::model::{Behaviors, ModelEnv};
use crate::notify::DEFAULT_QUEUE_DEPTH;
use crate::reverse::{DEFAULT_FORWARD_TIMEOUT, ReverseChannel};
use crate::server::serve_connection;
use crate::service::Router;

#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error("failed to bind {}: {source}", path.display())]
    Bind {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to reach foreign endpoint {}: {source}", path.display())]
    Dial {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("driver is already serving")]
    AlreadyServing,
}

#[derive(Clone)]
pub struct DriverConfig {
    pub socket_path: PathBuf,
    /// `None` runs standalone: anything needing the foreign side fails.
    pub foreign_socket_path: Option<PathBuf>,
    pub forward_timeout: Duration,
    pub queue_depth: usize,
    pub behaviors: Arc<Behaviors>,
}

impl DriverConfig {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            foreign_socket_path: None,
            forward_timeout: DEFAULT_FORWARD_TIMEOUT,
            queue_depth: DEFAULT_QUEUE_DEPTH,
            behaviors: Arc::new(Behaviors::new()),
        }
    }

    /// An empty path means standalone.
    pub fn with_foreign_socket(mut self, path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        self.foreign_socket_path = (!path.as_os_str().is_empty()).then_some(path);
        self
    }

    pub fn with_forward_timeout(mut self, timeout: Duration) -> Self {
        self.forward_timeout = timeout;
        self
    }

    pub fn with_queue_depth(mut self, depth: usize) -> Self {
        self.queue_depth = depth;
        self
    }

    pub fn with_behaviors(mut self, behaviors: Arc<Behaviors>) -> Self {
        self.behaviors = behaviors;
        self
    }

    /// Apply `FC_FORWARD_TIMEOUT_MS` and `FC_QUEUE_DEPTH` from the process
    /// environment.
    pub fn with_env_overrides(self) -> Result<Self, DriverError> {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    fn with_overrides(
        mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, DriverError> {
        if let Some(ms) = lookup("FC_FORWARD_TIMEOUT_MS") {
            let ms: u64 = ms
                .trim()
                .parse()
                .map_err(|_| DriverError::Config(format!("FC_FORWARD_TIMEOUT_MS={ms}")))?;
            self.forward_timeout = Duration::from_millis(ms);
        }
        if let Some(depth) = lookup("FC_QUEUE_DEPTH") {
            self.queue_depth = depth
                .trim()
                .parse()
                .ok()
                .filter(|d| *d > 0)
                .ok_or_else(|| DriverError::Config(format!("FC_QUEUE_DEPTH={depth}")))?;
        }
        Ok(self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DriverStats {
    pub handles: usize,
    pub open_subscriptions: usize,
}

pub struct Driver {
    router: Arc<Router>,
    listener: Mutex<Option<UnixListener>>,
    socket_path: PathBuf,
    reverse: Option<Arc<ReverseChannel>>,
    shutdown: CancellationToken,
}

impl Driver {
    /// Dial the foreign endpoint (if configured), then bind the socket.
    /// Either failing is fatal.
    pub async fn start(config: DriverConfig) -> Result<Self, DriverError> {
        let reverse = match &config.foreign_socket_path {
            Some(path) => {
                let channel = ReverseChannel::connect(path, config.forward_timeout)
                    .await
                    .map_err(|source| DriverError::Dial {
                        path: path.clone(),
                        source,
                    })?;
                Some(Arc::new(channel))
            }
            None => {
                tracing::info!("No foreign endpoint configured, running standalone");
                None
            }
        };

        let listener = transport::bind(&config.socket_path).map_err(|source| DriverError::Bind {
            path: config.socket_path.clone(),
            source,
        })?;

        let env = ModelEnv {
            behaviors: config.behaviors,
            reverse: reverse.clone(),
        };
        let router = Router::new(Arc::new(HandleTable::new()), env, config.queue_depth);
        tracing::info!(
            socket = %config.socket_path.display(),
            queue_depth = config.queue_depth,
            "Driver started"
        );

        Ok(Self {
            router: Arc::new(router),
            listener: Mutex::new(Some(listener)),
            socket_path: config.socket_path,
            reverse,
            shutdown: CancellationToken::new(),
        })
    }

    /// Accept connections until [`Driver::stop`] is called. On the way out,
    /// every connection is torn down (releasing its handles), the socket file
    /// is removed and the reverse channel is closed.
    pub async fn serve(&self) -> Result<(), DriverError> {
        let listener = self
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(DriverError::AlreadyServing)?;
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.cancelled() => break,

                Some(_) = connections.join_next(), if !connections.is_empty() => {}

                accepted = listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        connections.spawn(serve_connection(
                            stream,
                            self.router.clone(),
                            self.shutdown.child_token(),
                        ));
                    }
                    Err(e) => tracing::warn!(error = %e, "Accept failed"),
                },
            }
        }

        drop(listener);
        if let Err(e) = std::fs::remove_file(&self.socket_path)
            && e.kind() != io::ErrorKind::NotFound
        {
            tracing::warn!(error = %e, "Could not remove socket file");
        }
        while connections.join_next().await.is_some() {}
        if let Some(reverse) = &self.reverse {
            reverse.shutdown();
        }
        tracing::info!(handles = self.router.table().len(), "Driver stopped");
        Ok(())
    }

    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    pub fn table(&self) -> &Arc<HandleTable> {
        self.router.table()
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    pub fn foreign_bridge(&self) -> ForeignCallBridge {
        ForeignCallBridge::new(self.router.table().clone())
    }

    pub fn stats(&self) -> DriverStats {
        DriverStats {
            handles: self.router.table().len(),
            open_subscriptions: self.router.hub().open(),
        }
    }
}

impl Drop for Driver {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

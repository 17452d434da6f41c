//! Single-instance coordination for one application.
//!
//! [`SingleInstance::start`] runs the election and, depending on the outcome,
//! either starts the primary's listener thread or prepares a connector to
//! the primary. Everything the listener observes arrives on
//! [`SingleInstance::events`].

mod error;

pub use error::EngineError;
pub use sole_ipc::InstanceEvent;

use sole_config::{Scope, SoleConfig};
use sole_core::{AppIdentity, Identifier, OsPlatform, Platform};
use sole_ipc::{ConnectionKind, Connector, HandshakePolicy, Listener, ListenerWaker, SocketAccess};
use sole_shm::{Election, Elector, Role};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Builds the hash inputs for `config`, honouring its exclusion switches.
pub fn app_identity(config: &SoleConfig, platform: &dyn Platform) -> AppIdentity {
    let version = if config.exclude_app_version {
        None
    } else {
        config.version.clone()
    };

    let executable_path = if config.exclude_app_path {
        None
    } else {
        match std::env::current_exe() {
            Ok(path) => Some(path),
            Err(e) => {
                warn!(error = %e, "executable path unavailable, leaving it out of the identifier");
                None
            }
        }
    };

    let user_name = match config.scope {
        Scope::User => Some(platform.current_os_user()),
        Scope::System => None,
    };

    AppIdentity {
        app_name: config.app_name.clone(),
        org_name: config.org_name.clone(),
        org_domain: config.org_domain.clone(),
        extra_tokens: config.app_data.clone(),
        version,
        executable_path,
        user_name,
    }
}

struct ListenerThread {
    waker: ListenerWaker,
    handle: Option<JoinHandle<()>>,
}

impl ListenerThread {
    fn spawn(mut listener: Listener, sink: Sender<InstanceEvent>) -> Result<Self, EngineError> {
        let waker = listener.waker();
        let handle = std::thread::Builder::new()
            .name("sole-listener".into())
            .spawn(move || {
                let mut sink = sink;
                if let Err(e) = listener.run(&mut sink) {
                    error!(error = %e, "listener stopped");
                }
            })
            .map_err(EngineError::Spawn)?;

        Ok(Self {
            waker,
            handle: Some(handle),
        })
    }
}

impl Drop for ListenerThread {
    fn drop(&mut self) {
        self.waker.wake();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("listener thread panicked");
            }
        }
    }
}

/// This process's place among all instances of the application.
///
/// Dropping a primary stops its listener and resets the coordination block
/// so the next process to start becomes primary.
pub struct SingleInstance {
    identifier: Identifier,
    runtime_dir: PathBuf,
    role: Role,
    listener: Option<ListenerThread>,
    events: Receiver<InstanceEvent>,
    connector: Option<Connector>,
    election: Mutex<Election>,
}

impl SingleInstance {
    pub fn start(config: &SoleConfig) -> Result<Self, EngineError> {
        Self::start_with_platform(config, &OsPlatform)
    }

    pub fn start_with_platform(config: &SoleConfig, platform: &dyn Platform) -> Result<Self, EngineError> {
        let identifier = Identifier::derive(&app_identity(config, platform));
        let runtime_dir = config.runtime_dir();

        let election = Elector::new(runtime_dir.clone(), identifier.clone(), platform)
            .with_inconsistency_timeout(config.inconsistency_timeout())
            .try_become_primary()?;
        let role = election.role();
        let (tx, events) = mpsc::channel();

        let mut instance = Self {
            identifier: identifier.clone(),
            runtime_dir: runtime_dir.clone(),
            role,
            listener: None,
            events,
            connector: None,
            election: Mutex::new(election),
        };

        match role {
            Role::Primary => {
                let mut policy = HandshakePolicy::new(identifier);
                policy.notify_secondary = config.secondary_notification;
                policy.max_message_len = config.max_message_len;
                let access = match config.scope {
                    Scope::User => SocketAccess::User,
                    Scope::System => SocketAccess::World,
                };
                let listener = Listener::bind(&runtime_dir, policy, access)?;
                instance.listener = Some(ListenerThread::spawn(listener, tx)?);
                info!(identifier = %instance.identifier, "running as primary instance");
            }
            Role::Secondary { instance_id } => {
                let mut connector = Connector::new(&runtime_dir, identifier, instance_id);
                let announce = if !config.allow_secondary {
                    Some(ConnectionKind::NewInstance)
                } else if config.secondary_notification {
                    Some(ConnectionKind::SecondaryInstance)
                } else {
                    None
                };
                if let Some(kind) = announce {
                    if let Err(e) = connector.connect(config.timeout(), kind) {
                        warn!(error = %e, ?kind, "could not announce this instance to the primary");
                    }
                }
                instance.connector = Some(connector);
                info!(identifier = %instance.identifier, instance_id, "running as secondary instance");
            }
        }

        Ok(instance)
    }

    pub fn is_primary(&self) -> bool {
        self.role.is_primary()
    }

    pub fn is_secondary(&self) -> bool {
        !self.role.is_primary()
    }

    /// `0` on the primary.
    pub fn instance_id(&self) -> u32 {
        self.role.instance_id()
    }

    pub fn identifier(&self) -> &Identifier {
        &self.identifier
    }

    pub fn runtime_dir(&self) -> &Path {
        &self.runtime_dir
    }

    /// Process id recorded by the current primary, `-1` if there is none.
    pub fn primary_pid(&self) -> i64 {
        let mut election = self.election.lock().unwrap_or_else(PoisonError::into_inner);
        election.primary_process_id().unwrap_or_else(|e| {
            warn!(error = %e, "failed to read primary process id");
            -1
        })
    }

    /// User the current primary runs as, empty if unknown.
    pub fn primary_user(&self) -> String {
        let mut election = self.election.lock().unwrap_or_else(PoisonError::into_inner);
        election.primary_user_name().unwrap_or_else(|e| {
            warn!(error = %e, "failed to read primary user name");
            String::new()
        })
    }

    /// Delivers `payload` to the primary within `timeout`.
    ///
    /// Connects first if needed. Always `false` on the primary itself.
    pub fn send_message(&mut self, payload: &[u8], timeout: Duration) -> bool {
        let Some(connector) = self.connector.as_mut() else {
            return false;
        };

        let deadline = Instant::now() + timeout;
        if let Err(e) = connector.connect(timeout, ConnectionKind::Reconnect) {
            debug!(error = %e, "could not reach primary");
            return false;
        }

        match connector.send_message(payload, deadline.saturating_duration_since(Instant::now())) {
            Ok(()) => true,
            Err(e) => {
                debug!(error = %e, len = payload.len(), "message not delivered");
                false
            }
        }
    }

    /// Events seen by the primary's listener. Never yields on a secondary.
    pub fn events(&self) -> &Receiver<InstanceEvent> {
        &self.events
    }
}

impl Drop for SingleInstance {
    fn drop(&mut self) {
        // The listener must be gone before the block says there is no primary.
        self.listener.take();
        self.connector.take();
    }
}

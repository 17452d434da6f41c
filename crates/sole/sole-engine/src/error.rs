use sole_ipc::IpcError;
use sole_shm::ElectionError;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("primary election failed")]
    Election(#[from] ElectionError),

    #[error("failed to start listening for secondary instances")]
    Listener(#[from] IpcError),

    #[error("failed to spawn the listener thread")]
    Spawn(#[source] std::io::Error),
}

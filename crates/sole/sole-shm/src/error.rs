use std::io;

#[derive(Debug, thiserror::Error)]
pub enum BlockError {
    #[error("coordination block '{path}' already exists")]
    AlreadyExists { path: String },

    #[error("coordination block '{path}' not found")]
    NotFound { path: String },

    #[error("coordination block checksum mismatch")]
    Corrupt,

    #[error("failed to access '{path}'")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },
}

impl BlockError {
    pub(crate) fn io(path: &std::path::Path, source: io::Error) -> Self {
        let path = path.display().to_string();
        match source.kind() {
            io::ErrorKind::AlreadyExists => BlockError::AlreadyExists { path },
            io::ErrorKind::NotFound => BlockError::NotFound { path },
            _ => BlockError::Io { path, source },
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ElectionError {
    #[error("coordination block disappeared between create and attach")]
    Vanished,

    #[error(transparent)]
    Block(#[from] BlockError),
}

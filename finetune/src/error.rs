use std::{error::Error, fmt, io, path::PathBuf};

use machine_learning::MlErr;

/// The fine-tuning driver's result type.
pub type Result<T> = std::result::Result<T, FinetuneErr>;

/// Fine-tuning driver failures.
#[derive(Debug)]
pub enum FinetuneErr {
    /// Invalid configuration, caught before any work starts.
    InvalidConfig(String),
    /// A manifest or volume could not be read.
    Dataset { path: PathBuf, msg: String },
    Ml(MlErr),
    /// The process group could not be formed or a collective failed.
    Dist(String),
    Io(io::Error),
}

impl FinetuneErr {
    pub fn dataset(path: impl Into<PathBuf>, msg: impl Into<String>) -> Self {
        Self::Dataset {
            path: path.into(),
            msg: msg.into(),
        }
    }
}

impl fmt::Display for FinetuneErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FinetuneErr::InvalidConfig(msg) => write!(f, "invalid configuration: {msg}"),
            FinetuneErr::Dataset { path, msg } => {
                write!(f, "dataset error in {}: {msg}", path.display())
            }
            FinetuneErr::Ml(e) => write!(f, "{e}"),
            FinetuneErr::Dist(msg) => write!(f, "distributed error: {msg}"),
            FinetuneErr::Io(e) => write!(f, "io error: {e}"),
        }
    }
}

impl Error for FinetuneErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            FinetuneErr::Ml(e) => Some(e),
            FinetuneErr::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for FinetuneErr {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<MlErr> for FinetuneErr {
    fn from(value: MlErr) -> Self {
        match value {
            MlErr::Io(e) => Self::Io(e),
            other => Self::Ml(other),
        }
    }
}

impl From<serde_json::Error> for FinetuneErr {
    fn from(value: serde_json::Error) -> Self {
        Self::Io(value.into())
    }
}

/// Boundary conversion for the binary.
impl From<FinetuneErr> for io::Error {
    fn from(value: FinetuneErr) -> Self {
        match value {
            FinetuneErr::Io(e) => e,
            FinetuneErr::InvalidConfig(_) => io::Error::new(io::ErrorKind::InvalidInput, value),
            other => io::Error::new(io::ErrorKind::InvalidData, other),
        }
    }
}

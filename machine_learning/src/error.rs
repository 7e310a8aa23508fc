use std::{
    error::Error,
    fmt::{self, Display},
    io,
    path::PathBuf,
};

/// The result type used in the entire machine learning module.
pub type Result<T> = std::result::Result<T, MlErr>;

/// The machine learning module's error type.
#[derive(Debug)]
pub enum MlErr {
    SizeMismatch {
        what: &'static str,
        got: usize,
        expected: usize,
    },
    ShapeMismatch {
        name: String,
        got: Vec<usize>,
        expected: Vec<usize>,
    },
    DuplicateParam(String),
    UnknownParam(String),
    UnknownModel(String),
    InvalidHyperParam {
        name: &'static str,
        reason: String,
    },
    CheckpointNotFound(PathBuf),
    MalformedCheckpoint(String),
    Shape(ndarray::ShapeError),
    Io(io::Error),
}

impl Display for MlErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MlErr::SizeMismatch {
                what,
                got,
                expected,
            } => write!(
                f,
                "There's a size mismatch in {what}, got {got} and expected {expected}"
            ),
            MlErr::ShapeMismatch {
                name,
                got,
                expected,
            } => write!(
                f,
                "The tensor {name} has shape {got:?} but {expected:?} was expected"
            ),
            MlErr::DuplicateParam(name) => {
                write!(f, "The parameter {name} was registered twice")
            }
            MlErr::UnknownParam(name) => write!(f, "There's no parameter named {name}"),
            MlErr::UnknownModel(name) => write!(f, "Unknown model architecture {name}"),
            MlErr::InvalidHyperParam { name, reason } => {
                write!(f, "Invalid value for {name}: {reason}")
            }
            MlErr::CheckpointNotFound(path) => {
                write!(f, "Checkpoint {} does not exist", path.display())
            }
            MlErr::MalformedCheckpoint(reason) => write!(f, "Malformed checkpoint: {reason}"),
            MlErr::Shape(e) => write!(f, "Invalid array shape: {e}"),
            MlErr::Io(e) => write!(f, "I/O error: {e}"),
        }
    }
}

impl Error for MlErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            MlErr::Shape(e) => Some(e),
            MlErr::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for MlErr {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<ndarray::ShapeError> for MlErr {
    fn from(value: ndarray::ShapeError) -> Self {
        Self::Shape(value)
    }
}

impl From<safetensors::SafeTensorError> for MlErr {
    fn from(value: safetensors::SafeTensorError) -> Self {
        Self::MalformedCheckpoint(value.to_string())
    }
}

impl From<rand_distr::NormalError> for MlErr {
    fn from(value: rand_distr::NormalError) -> Self {
        Self::InvalidHyperParam {
            name: "std",
            reason: value.to_string(),
        }
    }
}

impl From<rand_distr::BetaError> for MlErr {
    fn from(value: rand_distr::BetaError) -> Self {
        Self::InvalidHyperParam {
            name: "alpha",
            reason: value.to_string(),
        }
    }
}

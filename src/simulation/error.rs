use thiserror::Error;

use crate::floating_type_mod::FT;

/// Rejected configuration scalars. A setter returning one of these has left the solver untouched.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("parameter `{name}` must be finite, got {value}")]
    NonFinite { name: &'static str, value: FT },

    #[error("parameter `{name}` must be positive, got {value}")]
    NonPositive { name: &'static str, value: FT },

    #[error("parameter `{name}` must lie in [{min}, {max}], got {value}")]
    OutOfRange {
        name: &'static str,
        value: FT,
        min: FT,
        max: FT,
    },

    #[error("parameter `{name}` must be at least {min}, got {value}")]
    TooSmall { name: &'static str, value: usize, min: usize },
}

impl ConfigError {
    pub fn check_finite(name: &'static str, value: FT) -> Result<FT, ConfigError> {
        if value.is_finite() {
            Ok(value)
        } else {
            Err(ConfigError::NonFinite { name, value })
        }
    }

    pub fn check_positive(name: &'static str, value: FT) -> Result<FT, ConfigError> {
        Self::check_finite(name, value)?;
        if value > 0. {
            Ok(value)
        } else {
            Err(ConfigError::NonPositive { name, value })
        }
    }

    pub fn check_range(name: &'static str, value: FT, min: FT, max: FT) -> Result<FT, ConfigError> {
        Self::check_finite(name, value)?;
        if value >= min && value <= max {
            Ok(value)
        } else {
            Err(ConfigError::OutOfRange { name, value, min, max })
        }
    }

    pub fn check_at_least(name: &'static str, value: usize, min: usize) -> Result<usize, ConfigError> {
        if value >= min {
            Ok(value)
        } else {
            Err(ConfigError::TooSmall { name, value, min })
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    #[error("no compute device available")]
    NoDevice,

    #[error("compute context has not been initialized")]
    ContextNotInitialized,

    #[error("kernel `{0}` does not exist in the loaded program")]
    UnknownKernel(String),

    #[error("buffer handle {0} is not valid")]
    InvalidBuffer(u32),

    #[error("kernel handle {0} is not valid")]
    InvalidKernel(u32),

    #[error("kernel `{kernel}` is missing argument {index}")]
    MissingArgument { kernel: String, index: usize },

    #[error("argument {index} of kernel `{kernel}` has the wrong kind")]
    ArgumentKind { kernel: String, index: usize },

    #[error("access of {len} bytes at offset {offset} exceeds buffer {buffer} of {size} bytes")]
    OutOfBounds {
        buffer: u32,
        offset: usize,
        len: usize,
        size: usize,
    },

    #[error("buffer {buffer} does not allow {operation}")]
    AccessViolation { buffer: u32, operation: &'static str },

    #[error("malformed device data: {0}")]
    Layout(String),
}

#[derive(Debug, Error)]
pub enum SimulationError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error("invalid time step {0}")]
    InvalidTimeStep(FT),

    #[error("no static collision object with id {0}")]
    UnknownCollisionObject(usize),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
}

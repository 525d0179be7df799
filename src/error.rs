use thiserror::Error;

/// Errors raised while loading, tracing, exporting or reading back a model
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error when reading or writing files
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// Protobuf decoding error
    #[error("Protobuf decode error: {0}")]
    Decode(#[from] prost::DecodeError),
    /// UTF-8 conversion error
    #[error("UTF-8 conversion error: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
    /// Model structure error
    #[error("Invalid model: {0}")]
    InvalidModel(String),
    /// Missing required field
    #[error("Missing required field: {0}")]
    MissingField(String),
    /// Operation, attribute or data type the exporter or runtime cannot handle
    #[error("Unsupported feature: {0}")]
    Unsupported(String),
    /// Architecture name not known to the model zoo
    #[error("unknown architecture '{0}'")]
    UnknownArchitecture(String),
    /// Weights identifier not known for the requested architecture
    #[error("unknown weights '{weights}' for architecture '{architecture}'")]
    UnknownWeights {
        architecture: String,
        weights: String,
    },
    /// Pretrained weights could not be located
    #[error("weights '{weights}' unavailable at {path}")]
    WeightsUnavailable { weights: String, path: String },
    /// A state dict does not match the model it is loaded into
    #[error("state dict mismatch: {0}")]
    StateDict(String),
    /// SafeTensors parse or serialise failure
    #[error("SafeTensors error: {0}")]
    SafeTensors(#[from] safetensors::SafeTensorError),
    /// Tensor shapes are incompatible with an operation
    #[error("shape error: {0}")]
    Shape(String),
    /// Export options are inconsistent with the traced graph
    #[error("invalid export: {0}")]
    InvalidExport(String),
    /// Configuration could not be read or parsed
    #[error("configuration error: {0}")]
    Config(String),
}

impl From<std::num::TryFromIntError> for Error {
    fn from(err: std::num::TryFromIntError) -> Self {
        Error::InvalidModel(format!("Integer conversion error: {}", err))
    }
}

impl From<ndarray::ShapeError> for Error {
    fn from(err: ndarray::ShapeError) -> Self {
        Error::Shape(err.to_string())
    }
}

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

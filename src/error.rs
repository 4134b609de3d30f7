//! Crate-wide error type.
//!
//! Mirrors the error categories in the design: invalid argument, not
//! supported, resource busy, transient I/O, fault, permission denied. Every
//! variant that crosses the wire back to the master maps to a negative
//! status code via [`WidgetError::wire_code`].

use thiserror::Error;

/// Negative status codes returned in reply frames, mirroring the original
/// `WIDGET_ERROR_*` constants.
pub mod wire_code {
    pub const OK: i32 = 0;
    pub const INVALID_PARAMETER: i32 = -1;
    pub const NOT_SUPPORTED: i32 = -2;
    pub const ALREADY_EXIST: i32 = -3;
    pub const RESOURCE_BUSY: i32 = -4;
    pub const IO_ERROR: i32 = -5;
    pub const FAULT: i32 = -6;
    pub const PERMISSION_DENIED: i32 = -7;
    pub const NOT_EXIST: i32 = -8;
    pub const OUT_OF_RANGE: i32 = -9;
}

#[derive(Debug, Error)]
pub enum WidgetError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("instance already exists: {0}/{1}")]
    AlreadyExists(String, String),

    #[error("instance not found: {0}/{1}")]
    NotFound(String, String),

    #[error("capability not supported: {0}")]
    NotSupported(String),

    #[error("resource busy: {0}")]
    ResourceBusy(String),

    #[error("index {index} out of range [0, {bound})")]
    OutOfRange { index: usize, bound: usize },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("fault: {0}")]
    Fault(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl WidgetError {
    pub fn wire_code(&self) -> i32 {
        match self {
            WidgetError::InvalidArgument(_) => wire_code::INVALID_PARAMETER,
            WidgetError::AlreadyExists(..) => wire_code::ALREADY_EXIST,
            WidgetError::NotFound(..) => wire_code::NOT_EXIST,
            WidgetError::NotSupported(_) => wire_code::NOT_SUPPORTED,
            WidgetError::ResourceBusy(_) => wire_code::RESOURCE_BUSY,
            WidgetError::OutOfRange { .. } => wire_code::OUT_OF_RANGE,
            WidgetError::Io(_) => wire_code::IO_ERROR,
            WidgetError::Fault(_) => wire_code::FAULT,
            WidgetError::PermissionDenied(_) => wire_code::PERMISSION_DENIED,
            WidgetError::Other(_) => wire_code::FAULT,
        }
    }
}

impl From<WidgetError> for i32 {
    fn from(err: WidgetError) -> Self {
        err.wire_code()
    }
}

pub type Result<T> = std::result::Result<T, WidgetError>;

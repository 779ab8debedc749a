//! Error types for shmkit
//!
//! Every fallible operation returns [`ShmResult`]. Variants carry the name of
//! the operation that failed plus a formatted message, so a caller several
//! layers up can still tell whether an allocation, a free or a backend call
//! went wrong.

use thiserror::Error;

/// Main error type for shared-memory operations
#[derive(Debug, Error)]
pub enum ShmError {
    /// The allocator cannot satisfy a request
    #[error("[{op}] out of memory: {message}")]
    OutOfMemory { op: &'static str, message: String },

    /// Freeing a page that is already free
    #[error("[{op}] double free: {message}")]
    DoubleFree { op: &'static str, message: String },

    /// Page allocator given a size exceeding its fixed page size
    #[error("[{op}] page size unsupported: {message}")]
    PageSizeUnsupported { op: &'static str, message: String },

    /// Allocator does not implement aligned allocation
    #[error("[{op}] aligned allocation unsupported: {message}")]
    AlignedAllocUnsupported { op: &'static str, message: String },

    /// Segment create/open failed
    #[error("[{op}] backend create failed: {message}")]
    BackendCreateFailed { op: &'static str, message: String },

    /// The backend cannot perform this operation
    #[error("[{op}] unsupported backend operation: {message}")]
    BackendUnsupportedOperation { op: &'static str, message: String },

    /// Allocator id (or other handle) unresolvable
    #[error("[{op}] not found: {message}")]
    NotFound { op: &'static str, message: String },

    /// Pointer does not belong to the allocator it was handed to
    #[error("[{op}] invalid pointer: {message}")]
    InvalidPointer { op: &'static str, message: String },

    /// An allocator with this id is already registered
    #[error("[{op}] allocator exists: {message}")]
    AllocatorExists { op: &'static str, message: String },

    /// Container index past the end
    #[error("[{op}] index {index} out of bounds (len {len})")]
    IndexOutOfBounds {
        op: &'static str,
        index: usize,
        len: usize,
    },

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors from the OS
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Convenience type alias for Results using ShmError
pub type ShmResult<T> = Result<T, ShmError>;

impl ShmError {
    pub fn out_of_memory(op: &'static str, message: impl Into<String>) -> Self {
        ShmError::OutOfMemory {
            op,
            message: message.into(),
        }
    }

    pub fn double_free(op: &'static str, message: impl Into<String>) -> Self {
        ShmError::DoubleFree {
            op,
            message: message.into(),
        }
    }

    pub fn page_size_unsupported(op: &'static str, message: impl Into<String>) -> Self {
        ShmError::PageSizeUnsupported {
            op,
            message: message.into(),
        }
    }

    pub fn aligned_alloc_unsupported(op: &'static str, message: impl Into<String>) -> Self {
        ShmError::AlignedAllocUnsupported {
            op,
            message: message.into(),
        }
    }

    pub fn backend_create_failed(op: &'static str, message: impl Into<String>) -> Self {
        ShmError::BackendCreateFailed {
            op,
            message: message.into(),
        }
    }

    pub fn backend_unsupported(op: &'static str, message: impl Into<String>) -> Self {
        ShmError::BackendUnsupportedOperation {
            op,
            message: message.into(),
        }
    }

    pub fn not_found(op: &'static str, message: impl Into<String>) -> Self {
        ShmError::NotFound {
            op,
            message: message.into(),
        }
    }

    pub fn invalid_pointer(op: &'static str, message: impl Into<String>) -> Self {
        ShmError::InvalidPointer {
            op,
            message: message.into(),
        }
    }

    pub fn allocator_exists(op: &'static str, message: impl Into<String>) -> Self {
        ShmError::AllocatorExists {
            op,
            message: message.into(),
        }
    }

    pub fn out_of_bounds(op: &'static str, index: usize, len: usize) -> Self {
        ShmError::IndexOutOfBounds { op, index, len }
    }

    pub fn config(message: impl Into<String>) -> Self {
        ShmError::Config(message.into())
    }

    /// Name of the operation that raised this error, if it carries one
    pub fn operation(&self) -> Option<&'static str> {
        match self {
            ShmError::OutOfMemory { op, .. }
            | ShmError::DoubleFree { op, .. }
            | ShmError::PageSizeUnsupported { op, .. }
            | ShmError::AlignedAllocUnsupported { op, .. }
            | ShmError::BackendCreateFailed { op, .. }
            | ShmError::BackendUnsupportedOperation { op, .. }
            | ShmError::NotFound { op, .. }
            | ShmError::InvalidPointer { op, .. }
            | ShmError::AllocatorExists { op, .. }
            | ShmError::IndexOutOfBounds { op, .. } => Some(op),
            ShmError::Config(_) | ShmError::Io(_) | ShmError::Internal(_) => None,
        }
    }
}

impl From<String> for ShmError {
    fn from(s: String) -> Self {
        ShmError::Internal(s)
    }
}

impl From<&str> for ShmError {
    fn from(s: &str) -> Self {
        ShmError::Internal(s.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_carries_operation() {
        let err = ShmError::double_free("StackAllocator::free", "page at offset 64");
        assert_eq!(err.operation(), Some("StackAllocator::free"));
        let msg = err.to_string();
        assert!(msg.contains("StackAllocator::free"));
        assert!(msg.contains("offset 64"));
    }

    #[test]
    fn test_string_conversion() {
        let err: ShmError = "boom".into();
        assert!(matches!(err, ShmError::Internal(_)));
        assert_eq!(err.operation(), None);
    }
}

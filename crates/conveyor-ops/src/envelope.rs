//! Uniform result envelope
//!
//! Every operation returns `OpResult<T>`: success flag, optional data,
//! optional `{code, message}` error, and paging for list operations.
//! Error codes are the stable strings from [`CoreError::code`].

use serde::{Deserialize, Serialize};

use conveyor_core::error::CoreError;
use conveyor_storage::{Page, Pagination};

/// Machine-readable error payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpError {
    pub code: String,
    pub message: String,
}

/// Paging block attached to list results.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Paging {
    pub total: u64,
    pub limit: u32,
    pub offset: u32,
    pub has_more: bool,
}

impl Paging {
    pub fn from_page<T>(page: &Page<T>, pagination: Pagination) -> Self {
        Self {
            total: page.total,
            limit: pagination.limit,
            offset: pagination.offset,
            has_more: page.has_more(&pagination),
        }
    }
}

/// Envelope returned by every operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpResult<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<OpError>,
    pub paging: Option<Paging>,
}

impl<T> OpResult<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            paging: None,
        }
    }

    pub fn ok_paged(data: T, paging: Paging) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            paging: Some(paging),
        }
    }

    pub fn err(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(OpError {
                code: code.into(),
                message: message.into(),
            }),
            paging: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.success
    }
}

impl<T> From<CoreError> for OpResult<T> {
    fn from(err: CoreError) -> Self {
        Self::err(err.code(), err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ok_envelope() {
        let result = OpResult::ok(42);
        assert!(result.is_success());
        assert_eq!(result.data, Some(42));
        assert!(result.error.is_none());
    }

    #[test]
    fn test_error_envelope_from_core_error() {
        let result: OpResult<()> = CoreError::not_found("run", "abc").into();
        assert!(!result.is_success());
        let error = result.error.unwrap();
        assert_eq!(error.code, "not_found");
        assert!(error.message.contains("abc"));
    }

    #[test]
    fn test_paging_from_page() {
        let page = Page {
            items: vec![1, 2, 3],
            total: 10,
        };
        let paging = Paging::from_page(&page, Pagination::new(3, 0));
        assert_eq!(paging.total, 10);
        assert!(paging.has_more);
    }
}

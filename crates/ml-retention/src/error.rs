//! Error types for the retention engine

use std::fmt;

#[derive(Debug)]
pub enum CacheError {
    /// Rejected before persistence: empty vector, missing source id, quality out of range
    InvalidFeature(String),
    InvalidPolicy(String),
    /// Storage timed out or is unreachable
    StorageUnavailable(String),
    /// Storage returned an error
    Database(Box<sqlx::Error>),
    NotFound(String),
    PolicyExecutionFailed { policy_id: String, reason: String },
    CascadeDeleteFailed { model_id: String, reason: String },
    /// Another engine instance holds the policy's lease
    PolicyBusy(String),
    Serialization(String),
}

impl CacheError {
    /// Whether the error came from the storage layer
    pub fn is_storage_failure(&self) -> bool {
        matches!(
            self,
            CacheError::StorageUnavailable(_) | CacheError::Database(_)
        )
    }
}

impl fmt::Display for CacheError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheError::InvalidFeature(msg) => write!(f, "Invalid feature: {}", msg),
            CacheError::InvalidPolicy(msg) => write!(f, "Invalid policy: {}", msg),
            CacheError::StorageUnavailable(msg) => write!(f, "Storage unavailable: {}", msg),
            CacheError::Database(err) => write!(f, "Database error: {}", err),
            CacheError::NotFound(what) => write!(f, "Not found: {}", what),
            CacheError::PolicyExecutionFailed { policy_id, reason } => {
                write!(f, "Policy {} failed: {}", policy_id, reason)
            }
            CacheError::CascadeDeleteFailed { model_id, reason } => {
                write!(f, "Cascade delete for model {} failed: {}", model_id, reason)
            }
            CacheError::PolicyBusy(policy_id) => {
                write!(f, "Policy {} is running elsewhere", policy_id)
            }
            CacheError::Serialization(msg) => write!(f, "Serialization error: {}", msg),
        }
    }
}

impl std::error::Error for CacheError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CacheError::Database(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}

impl From<sqlx::Error> for CacheError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                CacheError::StorageUnavailable(err.to_string())
            }
            other => CacheError::Database(Box::new(other)),
        }
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(err: serde_json::Error) -> Self {
        CacheError::Serialization(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CacheError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_feature_display() {
        let err = CacheError::InvalidFeature("empty feature vector".to_string());
        assert_eq!(format!("{}", err), "Invalid feature: empty feature vector");
    }

    #[test]
    fn test_policy_execution_failed_display() {
        let err = CacheError::PolicyExecutionFailed {
            policy_id: "fs_low_quality".to_string(),
            reason: "timeout".to_string(),
        };
        assert_eq!(format!("{}", err), "Policy fs_low_quality failed: timeout");
    }

    #[test]
    fn test_cascade_delete_failed_display() {
        let err = CacheError::CascadeDeleteFailed {
            model_id: "sdm-v3".to_string(),
            reason: "connection reset".to_string(),
        };
        assert_eq!(
            format!("{}", err),
            "Cascade delete for model sdm-v3 failed: connection reset"
        );
    }

    #[test]
    fn test_pool_timeout_maps_to_storage_unavailable() {
        let err: CacheError = sqlx::Error::PoolTimedOut.into();
        assert!(matches!(err, CacheError::StorageUnavailable(_)));
        assert!(err.is_storage_failure());
    }

    #[test]
    fn test_row_not_found_is_database_error_with_source() {
        let err: CacheError = sqlx::Error::RowNotFound.into();
        assert!(matches!(err, CacheError::Database(_)));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_policy_busy_is_not_storage_failure() {
        let err = CacheError::PolicyBusy("ic_expired".to_string());
        assert!(!err.is_storage_failure());
        assert_eq!(format!("{}", err), "Policy ic_expired is running elsewhere");
    }
}

use std::fmt;

use bfr_types::BfrError;

/// Failure reply of an administrative command. `code` is stable across
/// releases; `message` is for humans.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorReply {
    pub code: &'static str,
    pub message: String,
    pub retryable: bool,
}

impl fmt::Display for ErrorReply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hint = if self.retryable { " (retryable)" } else { "" };
        write!(f, "ERROR {}: {}{hint}", self.code, self.message)
    }
}

pub fn error_code(err: &BfrError) -> &'static str {
    match err {
        BfrError::Conflict { .. } => "CONFLICT",
        BfrError::ReplicaBehind { .. } => "REPLICA_BEHIND",
        BfrError::QuorumNotReached { .. } => "QUORUM_NOT_REACHED",
        BfrError::DatabaseNotOnline { .. } => "DATABASE_NOT_ONLINE",
        BfrError::DuplicateDatabase(_) => "DUPLICATE_DATABASE",
        BfrError::DatabaseNotFound(_) => "DATABASE_NOT_FOUND",
        BfrError::NodeUnavailable(_) => "NODE_UNAVAILABLE",
        BfrError::NodeAlreadyOnline(_) => "NODE_ALREADY_ONLINE",
        BfrError::JoinRefused(_) => "JOIN_REFUSED",
        BfrError::IllegalTransition { .. } => "ILLEGAL_TRANSITION",
        BfrError::ResyncInProgress { .. } => "RESYNC_IN_PROGRESS",
        BfrError::DuplicateKey { .. } => "DUPLICATE_KEY",
        BfrError::NotFound(_) => "NOT_FOUND",
        BfrError::Timeout => "TIMEOUT",
        BfrError::Storage(_) => "STORAGE",
        BfrError::Config(_) => "CONFIG",
        BfrError::InvalidArgument(_) => "INVALID_ARGUMENT",
    }
}

pub fn bfr_to_reply(err: BfrError) -> ErrorReply {
    ErrorReply {
        code: error_code(&err),
        retryable: err.is_retryable(),
        message: err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bfr_types::RecordId;

    #[test]
    fn conflicts_are_final_and_quorum_failures_retryable() {
        let conflict = bfr_to_reply(BfrError::Conflict {
            record: RecordId::new("person", "k"),
            expected: 1,
            actual: 2,
        });
        assert_eq!(conflict.code, "CONFLICT");
        assert!(!conflict.retryable);

        let quorum = bfr_to_reply(BfrError::QuorumNotReached { required: 2, received: 1 });
        assert_eq!(quorum.code, "QUORUM_NOT_REACHED");
        assert!(quorum.retryable);
        assert_eq!(
            quorum.to_string(),
            "ERROR QUORUM_NOT_REACHED: quorum not reached: required 2, received 1 (retryable)"
        );
    }

    #[test]
    fn duplicate_database_reply() {
        let reply = bfr_to_reply(BfrError::DuplicateDatabase("shop".into()));
        assert_eq!(reply.to_string(), "ERROR DUPLICATE_DATABASE: database 'shop' already exists");
    }
}

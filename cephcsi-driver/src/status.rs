//! Engine-error to gRPC status mapping.

use cephcsi_engine::EngineError;
use tonic::{Code, Status};

/// Map an engine error onto the standardized gRPC code the orchestrator
/// keys its retry behavior on.
pub fn status_from(err: EngineError) -> Status {
    let code = match &err {
        EngineError::BadIdentifier(_) => Code::InvalidArgument,
        EngineError::NotFound(_) => Code::NotFound,
        EngineError::AlreadyExists(_) => Code::AlreadyExists,
        // Lock contention and CAS races both resolve by retrying.
        EngineError::Aborted(_) | EngineError::ObjectOutOfDate(_) => Code::Aborted,
        EngineError::StateInconsistent(_) => Code::Internal,
        EngineError::BackendTransient(_) => Code::Unavailable,
        EngineError::BackendPermanent(_) => Code::FailedPrecondition,
        EngineError::CredentialInvalid(_) => Code::InvalidArgument,
        EngineError::Cancelled(_) => Code::DeadlineExceeded,
        EngineError::InvalidArgument(_) => Code::InvalidArgument,
        EngineError::Internal(_) => Code::Internal,
    };
    Status::new(code, err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mapping() {
        let cases = [
            (
                EngineError::BadIdentifier("x".into()),
                Code::InvalidArgument,
            ),
            (EngineError::NotFound("x".into()), Code::NotFound),
            (EngineError::AlreadyExists("x".into()), Code::AlreadyExists),
            (EngineError::Aborted("x".into()), Code::Aborted),
            (EngineError::ObjectOutOfDate("x".into()), Code::Aborted),
            (EngineError::StateInconsistent("x".into()), Code::Internal),
            (EngineError::BackendTransient("x".into()), Code::Unavailable),
            (
                EngineError::BackendPermanent("x".into()),
                Code::FailedPrecondition,
            ),
            (
                EngineError::CredentialInvalid("x".into()),
                Code::InvalidArgument,
            ),
            (EngineError::Cancelled("x".into()), Code::DeadlineExceeded),
        ];
        for (err, code) in cases {
            assert_eq!(status_from(err).code(), code);
        }
    }
}

//! Error classification.
//!
//! [`classify`] maps a decoded ERROR body onto the closed [`ServerErrorKind`]
//! taxonomy; it is pure and total. [`decide`] combines a classified error
//! with the statement's retry policy and idempotency into the action the
//! executor takes next.

use cassie_proto::{error_codes, ErrorBody, ErrorDetail};

use crate::error::{Error, ServerError, ServerErrorKind};
use crate::retry::{RetryContext, RetryDecision, RetryPolicy};

/// Maps an ERROR body to a [`ServerError`].
///
/// A known code whose detail failed to parse still classifies by code; its
/// structured fields are then unavailable, so such errors fall back to the
/// field-less kinds or [`ServerErrorKind::Unknown`].
pub fn classify(body: ErrorBody) -> ServerError {
    use error_codes::*;

    let kind = match (body.code, body.detail) {
        (_, ErrorDetail::Unavailable {
            consistency,
            required,
            alive,
        }) => ServerErrorKind::Unavailable {
            consistency,
            required,
            alive,
        },
        (_, ErrorDetail::WriteTimeout {
            consistency,
            received,
            block_for,
            write_type,
        }) => ServerErrorKind::WriteTimeout {
            consistency,
            received,
            block_for,
            write_type,
        },
        (_, ErrorDetail::ReadTimeout {
            consistency,
            received,
            block_for,
            data_present,
        }) => ServerErrorKind::ReadTimeout {
            consistency,
            received,
            block_for,
            data_present,
        },
        (_, ErrorDetail::ReadFailure {
            consistency,
            received,
            block_for,
            num_failures,
            data_present,
        }) => ServerErrorKind::ReadFailure {
            consistency,
            received,
            block_for,
            num_failures,
            data_present,
        },
        (_, ErrorDetail::FunctionFailure {
            keyspace,
            function,
            arg_types,
        }) => ServerErrorKind::FunctionFailure {
            keyspace,
            function,
            arg_types,
        },
        (_, ErrorDetail::WriteFailure {
            consistency,
            received,
            block_for,
            num_failures,
            write_type,
        }) => ServerErrorKind::WriteFailure {
            consistency,
            received,
            block_for,
            num_failures,
            write_type,
        },
        (_, ErrorDetail::AlreadyExists { keyspace, table }) => {
            ServerErrorKind::AlreadyExists { keyspace, table }
        }
        (_, ErrorDetail::Unprepared { id }) => ServerErrorKind::Unprepared { id },
        (SERVER_ERROR, ErrorDetail::None) => ServerErrorKind::ServerError,
        (PROTOCOL_ERROR, ErrorDetail::None) => ServerErrorKind::ProtocolError,
        (BAD_CREDENTIALS, ErrorDetail::None) => ServerErrorKind::BadCredentials,
        (OVERLOADED, ErrorDetail::None) => ServerErrorKind::Overloaded,
        (IS_BOOTSTRAPPING, ErrorDetail::None) => ServerErrorKind::IsBootstrapping,
        (TRUNCATE_ERROR, ErrorDetail::None) => ServerErrorKind::Truncate,
        (SYNTAX_ERROR, ErrorDetail::None) => ServerErrorKind::Syntax,
        (UNAUTHORIZED, ErrorDetail::None) => ServerErrorKind::Unauthorized,
        (INVALID, ErrorDetail::None) => ServerErrorKind::Invalid,
        (CONFIG_ERROR, ErrorDetail::None) => ServerErrorKind::Config,
        (_, ErrorDetail::None) => ServerErrorKind::Unknown,
    };

    ServerError {
        kind,
        code: body.code,
        message: body.message,
    }
}

/// Whether the policy may be consulted at all for this error.
///
/// Encode/decode failures, corrupted frames, request errors and local
/// configuration problems are terminal whatever the policy says.
pub fn is_recoverable(error: &Error) -> bool {
    match error {
        Error::ConnectionLost { .. } | Error::Timeout(_) => true,
        Error::Server(e) => matches!(
            e.kind,
            ServerErrorKind::ServerError
                | ServerErrorKind::Unavailable { .. }
                | ServerErrorKind::Overloaded
                | ServerErrorKind::IsBootstrapping
                | ServerErrorKind::Truncate
                | ServerErrorKind::WriteTimeout { .. }
                | ServerErrorKind::ReadTimeout { .. }
                | ServerErrorKind::ReadFailure { .. }
                | ServerErrorKind::WriteFailure { .. }
        ),
        Error::TypeEncode(_)
        | Error::TypeDecode(_)
        | Error::FrameCorruption(_)
        | Error::NoConnectionsAvailable(_)
        | Error::Connection(_)
        | Error::Authentication(_)
        | Error::Protocol(_)
        | Error::InvalidArgument(_) => false,
    }
}

/// Decides what to do after a failed attempt.
///
/// A statement not marked idempotent is never resent after an error whose
/// outcome is ambiguous, no matter what the policy returns.
pub fn decide(policy: &dyn RetryPolicy, ctx: &RetryContext<'_>) -> RetryDecision {
    if !is_recoverable(ctx.error) {
        return RetryDecision::Rethrow;
    }
    if !ctx.idempotent && ctx.error.is_ambiguous_write() {
        return RetryDecision::Rethrow;
    }
    policy.decide(ctx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use cassie_proto::{Consistency, WriteType};
    use std::time::Duration;

    /// Retries everything on the next host.
    #[derive(Debug)]
    struct Always;

    impl RetryPolicy for Always {
        fn decide(&self, _ctx: &RetryContext<'_>) -> RetryDecision {
            RetryDecision::RetryNextHost(None)
        }
    }

    fn ctx(error: &Error, idempotent: bool) -> RetryContext<'_> {
        RetryContext {
            error,
            idempotent,
            attempt: 0,
            consistency: Consistency::Quorum,
        }
    }

    #[test]
    fn test_every_code_classifies() {
        let codes = [
            (error_codes::SERVER_ERROR, ServerErrorKind::ServerError),
            (error_codes::PROTOCOL_ERROR, ServerErrorKind::ProtocolError),
            (error_codes::BAD_CREDENTIALS, ServerErrorKind::BadCredentials),
            (error_codes::OVERLOADED, ServerErrorKind::Overloaded),
            (error_codes::IS_BOOTSTRAPPING, ServerErrorKind::IsBootstrapping),
            (error_codes::TRUNCATE_ERROR, ServerErrorKind::Truncate),
            (error_codes::SYNTAX_ERROR, ServerErrorKind::Syntax),
            (error_codes::UNAUTHORIZED, ServerErrorKind::Unauthorized),
            (error_codes::INVALID, ServerErrorKind::Invalid),
            (error_codes::CONFIG_ERROR, ServerErrorKind::Config),
        ];
        for (code, kind) in codes {
            let classified = classify(ErrorBody::new(code, "msg"));
            assert_eq!(classified.kind, kind);
            assert_eq!(classified.code, code);
        }
    }

    #[test]
    fn test_detail_is_carried() {
        let body = ErrorBody::new(error_codes::UNAVAILABLE, "not enough replicas").with_detail(
            ErrorDetail::Unavailable {
                consistency: Consistency::All,
                required: 3,
                alive: 2,
            },
        );
        let classified = classify(body);
        assert_eq!(
            classified.kind,
            ServerErrorKind::Unavailable {
                consistency: Consistency::All,
                required: 3,
                alive: 2
            }
        );
        assert_eq!(classified.message, "not enough replicas");
    }

    #[test]
    fn test_unknown_code_keeps_raw_code() {
        let classified = classify(ErrorBody::new(0x4242, "new server feature"));
        assert_eq!(classified.kind, ServerErrorKind::Unknown);
        assert_eq!(classified.code, 0x4242);
    }

    #[test]
    fn test_non_idempotent_never_retried_after_write_timeout() {
        let error = Error::Server(classify(
            ErrorBody::new(error_codes::WRITE_TIMEOUT, "timeout").with_detail(
                ErrorDetail::WriteTimeout {
                    consistency: Consistency::Quorum,
                    received: 0,
                    block_for: 2,
                    write_type: WriteType::Simple,
                },
            ),
        ));
        assert_eq!(decide(&Always, &ctx(&error, false)), RetryDecision::Rethrow);
        assert_eq!(
            decide(&Always, &ctx(&error, true)),
            RetryDecision::RetryNextHost(None)
        );
    }

    #[test]
    fn test_connection_lost_before_write_is_retryable() {
        let endpoint = "127.0.0.1:9042".parse().unwrap();
        let unwritten = Error::ConnectionLost {
            endpoint,
            reason: "closed".into(),
            request_written: false,
        };
        let written = Error::ConnectionLost {
            endpoint,
            reason: "reset".into(),
            request_written: true,
        };
        assert_eq!(
            decide(&Always, &ctx(&unwritten, false)),
            RetryDecision::RetryNextHost(None)
        );
        assert_eq!(decide(&Always, &ctx(&written, false)), RetryDecision::Rethrow);
        assert_eq!(
            decide(&Always, &ctx(&Error::Timeout(Duration::from_millis(5)), false)),
            RetryDecision::Rethrow
        );
    }

    #[test]
    fn test_terminal_errors_skip_policy() {
        let syntax = Error::Server(classify(ErrorBody::new(error_codes::SYNTAX_ERROR, "bad")));
        assert_eq!(decide(&Always, &ctx(&syntax, true)), RetryDecision::Rethrow);
        let encode = Error::TypeEncode("tinyint".into());
        assert_eq!(decide(&Always, &ctx(&encode, true)), RetryDecision::Rethrow);
    }
}

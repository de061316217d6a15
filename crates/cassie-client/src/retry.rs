//! Retry policies.
//!
//! A policy only sees errors the classifier deems recoverable, and its
//! decision is further overridden for non-idempotent statements whose
//! failure was ambiguous (see [`crate::classifier::decide`]).

use std::fmt::Debug;

use cassie_proto::{Consistency, WriteType};

use crate::error::{Error, ServerErrorKind};

/// What the executor knows about a failed attempt.
#[derive(Debug, Clone, Copy)]
pub struct RetryContext<'a> {
    pub error: &'a Error,
    pub idempotent: bool,
    /// Retries already performed for this execution.
    pub attempt: u32,
    /// Consistency the failed attempt ran at.
    pub consistency: Consistency,
}

/// Next step after a failed attempt. A consistency in a retry variant
/// replaces the statement's consistency for the new attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    RetrySameHost(Option<Consistency>),
    RetryNextHost(Option<Consistency>),
    Rethrow,
}

/// Decides whether and where a failed attempt is retried.
pub trait RetryPolicy: Send + Sync + Debug {
    fn decide(&self, ctx: &RetryContext<'_>) -> RetryDecision;
}

/// Standard policy.
///
/// - read timeout: retried once on the same host when enough replicas
///   answered but the data was not retrieved
/// - write timeout: retried once on the same host for batch log writes
/// - unavailable: retried once on the next host
/// - overloaded, bootstrapping, server errors, lost connections: retried on
///   the next host for idempotent statements, and for any statement when the
///   connection was lost before the request was written
/// - local timeouts: rethrown unless enabled with
///   [`DefaultRetryPolicy::with_retry_on_timeout`]
#[derive(Debug, Clone)]
pub struct DefaultRetryPolicy {
    max_retries: u32,
    retry_on_timeout: bool,
}

impl DefaultRetryPolicy {
    pub fn new() -> Self {
        Self {
            max_retries: 1,
            retry_on_timeout: false,
        }
    }

    /// Set the retry cap for connection-level and overload errors.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Retry idempotent statements on the next host after a local timeout.
    pub fn with_retry_on_timeout(mut self, enabled: bool) -> Self {
        self.retry_on_timeout = enabled;
        self
    }

    fn on_request_error(&self, ctx: &RetryContext<'_>) -> RetryDecision {
        if ctx.idempotent && ctx.attempt < self.max_retries {
            RetryDecision::RetryNextHost(None)
        } else {
            RetryDecision::Rethrow
        }
    }
}

impl Default for DefaultRetryPolicy {
    fn default() -> Self {
        Self::new()
    }
}

impl RetryPolicy for DefaultRetryPolicy {
    fn decide(&self, ctx: &RetryContext<'_>) -> RetryDecision {
        match ctx.error {
            Error::Server(e) => match &e.kind {
                ServerErrorKind::ReadTimeout {
                    received,
                    block_for,
                    data_present,
                    ..
                } => {
                    if ctx.attempt == 0 && received >= block_for && !data_present {
                        RetryDecision::RetrySameHost(None)
                    } else {
                        RetryDecision::Rethrow
                    }
                }
                ServerErrorKind::WriteTimeout { write_type, .. } => {
                    if ctx.attempt == 0 && *write_type == WriteType::BatchLog {
                        RetryDecision::RetrySameHost(None)
                    } else {
                        RetryDecision::Rethrow
                    }
                }
                ServerErrorKind::Unavailable { .. } => {
                    if ctx.attempt == 0 {
                        RetryDecision::RetryNextHost(None)
                    } else {
                        RetryDecision::Rethrow
                    }
                }
                ServerErrorKind::Overloaded
                | ServerErrorKind::IsBootstrapping
                | ServerErrorKind::ServerError
                | ServerErrorKind::Truncate => self.on_request_error(ctx),
                _ => RetryDecision::Rethrow,
            },
            Error::ConnectionLost {
                request_written: false,
                ..
            } if ctx.attempt < self.max_retries => RetryDecision::RetryNextHost(None),
            Error::ConnectionLost { .. } => self.on_request_error(ctx),
            Error::Timeout(_) if self.retry_on_timeout => self.on_request_error(ctx),
            _ => RetryDecision::Rethrow,
        }
    }
}

/// Never retries.
#[derive(Debug, Clone, Copy, Default)]
pub struct FallthroughRetryPolicy;

impl RetryPolicy for FallthroughRetryPolicy {
    fn decide(&self, _ctx: &RetryContext<'_>) -> RetryDecision {
        RetryDecision::Rethrow
    }
}

/// Retries at a lower consistency when not enough replicas responded.
///
/// Lowering consistency weakens guarantees silently, so this is only used
/// when configured explicitly.
#[derive(Debug, Clone, Default)]
pub struct DowngradingConsistencyRetryPolicy {
    fallback: DefaultRetryPolicy,
}

impl DowngradingConsistencyRetryPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Highest consistency likely to succeed with `replicas` live replicas.
    fn max_likely(replicas: i32) -> Option<Consistency> {
        match replicas {
            r if r >= 3 => Some(Consistency::Three),
            2 => Some(Consistency::Two),
            1 => Some(Consistency::One),
            _ => None,
        }
    }

    fn downgrade(replicas: i32, current: Consistency) -> RetryDecision {
        // Serial reads are never downgraded to a non-serial level.
        if current.is_serial() {
            return RetryDecision::Rethrow;
        }
        match Self::max_likely(replicas) {
            Some(cl) => RetryDecision::RetrySameHost(Some(cl)),
            None => RetryDecision::Rethrow,
        }
    }
}

impl RetryPolicy for DowngradingConsistencyRetryPolicy {
    fn decide(&self, ctx: &RetryContext<'_>) -> RetryDecision {
        let kind = match ctx.error {
            Error::Server(e) => &e.kind,
            _ => return self.fallback.decide(ctx),
        };
        if ctx.attempt > 0 {
            return match kind {
                ServerErrorKind::ReadTimeout { .. }
                | ServerErrorKind::WriteTimeout { .. }
                | ServerErrorKind::Unavailable { .. } => RetryDecision::Rethrow,
                _ => self.fallback.decide(ctx),
            };
        }
        match kind {
            ServerErrorKind::ReadTimeout {
                received,
                block_for,
                data_present,
                ..
            } => {
                if received < block_for {
                    Self::downgrade(*received, ctx.consistency)
                } else if !data_present {
                    RetryDecision::RetrySameHost(None)
                } else {
                    RetryDecision::Rethrow
                }
            }
            ServerErrorKind::WriteTimeout {
                received,
                write_type,
                ..
            } => match write_type {
                WriteType::UnloggedBatch => Self::downgrade(*received, ctx.consistency),
                WriteType::BatchLog => RetryDecision::RetrySameHost(None),
                _ => RetryDecision::Rethrow,
            },
            ServerErrorKind::Unavailable { alive, .. } => Self::downgrade(*alive, ctx.consistency),
            _ => self.fallback.decide(ctx),
        }
    }
}

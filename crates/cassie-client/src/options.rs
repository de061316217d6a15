//! Per-execution options.

use std::sync::Arc;
use std::time::Duration;

use cassie_proto::Consistency;

use crate::retry::{DefaultRetryPolicy, RetryPolicy};

/// Default page size for row-returning statements.
pub const DEFAULT_PAGE_SIZE: i32 = 5000;

/// Options snapshot for one execution.
///
/// Cloned into the executor when an execution starts; changing a copy never
/// affects executions already in flight.
#[derive(Debug, Clone)]
pub struct ExecutionOptions {
    pub consistency: Consistency,
    pub serial_consistency: Option<Consistency>,
    /// `None` lets the server choose.
    pub page_size: Option<i32>,
    /// Resume point returned by a previous page.
    pub paging_state: Option<Vec<u8>>,
    /// Deadline for the whole execution; `None` disables the local deadline.
    pub timeout: Option<Duration>,
    pub retry_policy: Arc<dyn RetryPolicy>,
    /// Whether the statement may safely be applied more than once.
    pub idempotent: bool,
    /// Client-side write timestamp in microseconds (protocol v3+).
    pub timestamp: Option<i64>,
    /// Ask the server to trace the request.
    pub tracing: bool,
}

impl ExecutionOptions {
    pub fn new() -> Self {
        Self {
            consistency: Consistency::default(),
            serial_consistency: None,
            page_size: Some(DEFAULT_PAGE_SIZE),
            paging_state: None,
            timeout: Some(Duration::from_secs(12)),
            retry_policy: Arc::new(DefaultRetryPolicy::default()),
            idempotent: false,
            timestamp: None,
            tracing: false,
        }
    }

    pub fn with_consistency(mut self, consistency: Consistency) -> Self {
        self.consistency = consistency;
        self
    }

    pub fn with_serial_consistency(mut self, consistency: Consistency) -> Self {
        self.serial_consistency = Some(consistency);
        self
    }

    /// Set the page size; `None` leaves it to the server.
    pub fn with_page_size(mut self, page_size: Option<i32>) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn with_paging_state(mut self, state: Option<Vec<u8>>) -> Self {
        self.paging_state = state;
        self
    }

    /// Set the execution timeout, shared by every attempt and re-prepare;
    /// `None` waits indefinitely.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retry_policy(mut self, policy: Arc<dyn RetryPolicy>) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn with_idempotent(mut self, idempotent: bool) -> Self {
        self.idempotent = idempotent;
        self
    }

    pub fn with_timestamp(mut self, micros: i64) -> Self {
        self.timestamp = Some(micros);
        self
    }

    pub fn with_tracing(mut self, enabled: bool) -> Self {
        self.tracing = enabled;
        self
    }
}

impl Default for ExecutionOptions {
    fn default() -> Self {
        Self::new()
    }
}

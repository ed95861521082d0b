//! RangeServer RPC surface as seen from the master's recovery operation (§6): only the handful
//! of operations and error codes the five-phase recovery state machine dispatches and
//! interprets. Wire framing is out of scope, same as `ht_rangeserver::rpc`.

use std::collections::HashMap;

use crate::range_spec::QualifiedRangeSpec;

/// The subset of §7's error taxonomy the recovery operation treats specially; everything else is
/// a generic retryable failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    Ok,
    PhantomRangeMapNotFound,
    Timeout,
    CommBrokenConnection,
    Other,
}

/// `(error_code, message)` as carried by every RPC response, per §7.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcError {
    pub code:    ErrorCode,
    pub message: String,
}

impl RpcError {
    #[must_use]
    pub fn other(message: impl Into<String>) -> Self {
        Self { code: ErrorCode::Other, message: message.into() }
    }
}

/// A batch RPC response keyed by the request element it concerns (`phantom_commit_ranges`,
/// `acknowledge_load`), per §7's "batch RPCs return a map keyed by the request element" rule.
pub type BatchResponse = HashMap<QualifiedRangeSpec, Result<(), RpcError>>;

/// Collects per-location results for one broadcast step (`RecoveryStepFuture` in the source): a
/// step is complete once every participant has reported, and failed if any of them returned an
/// error.
#[derive(Debug, Default)]
pub struct RecoveryStepFuture {
    results: HashMap<String, Result<(), RpcError>>,
}

impl RecoveryStepFuture {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, location: impl Into<String>, result: Result<(), RpcError>) {
        self.results.insert(location.into(), result);
    }

    #[must_use]
    pub fn all_ok(&self) -> bool {
        self.results.values().all(Result::is_ok)
    }

    /// Every location that reported an error, with its error.
    #[must_use]
    pub fn failures(&self) -> Vec<(&str, &RpcError)> {
        self.results.iter()
            .filter_map(|(location, result)| result.as_ref().err().map(|err| (location.as_str(), err)))
            .collect()
    }
}

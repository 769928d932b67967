//! Reconciliation metrics.
//!
//! Recorded through the `metrics` facade; nothing is exported unless the
//! binary installs a recorder.  The `address` label of the Consul counters
//! is always an agent address, or `unresolved` when no agent owns the
//! target address.

use std::time::Instant;

use metrics::{counter, histogram};

pub const CONSUL_SUCCESS: &str = "consul_success_total";
pub const CONSUL_FAILURE: &str = "consul_failure_total";
pub const FUNC_DURATION: &str = "reconcile_duration_seconds";
pub const UNRESOLVED: &str = "unresolved";

/// Count a successful call against a Consul agent.
pub fn consul_success(operation: &'static str, address: &str) {
    counter!(CONSUL_SUCCESS, "operation" => operation, "address" => address.to_string())
        .increment(1);
}

/// Count a failed call against a Consul agent.
pub fn consul_failure(operation: &'static str, address: &str) {
    counter!(CONSUL_FAILURE, "operation" => operation, "address" => address.to_string())
        .increment(1);
}

/// Count a call that never reached Consul because no agent owns the target.
pub fn consul_unresolved(operation: &'static str) {
    consul_failure(operation, UNRESOLVED);
}

/// Records the lifetime of a reconciliation function when dropped.
pub struct FuncTimer {
    function: &'static str,
    started: Instant,
}

impl FuncTimer {
    pub fn start(function: &'static str) -> Self {
        Self {
            function,
            started: Instant::now(),
        }
    }
}

impl Drop for FuncTimer {
    fn drop(&mut self) {
        histogram!(FUNC_DURATION, "function" => self.function)
            .record(self.started.elapsed().as_secs_f64());
    }
}

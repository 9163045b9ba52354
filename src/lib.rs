/*!
 * Pacekeeper - adaptive outbound-request governor
 *
 * Sits between a batch of work items and a rate-limited, unreliable
 * upstream and decides when to send each request, how many to run at once,
 * and how to recover when the upstream pushes back:
 * - learned pacing from latency, success and rate-limit signals
 * - circuit breaking with bounded, jittered retries
 * - short bursts when there is headroom
 * - a bounded worker pool whose size adapts to upstream health
 * - rolling-window analytics that feed tuning back into the loop
 */

pub mod analytics;
pub mod cli_style;
pub mod config;
pub mod error;
pub mod logging;
pub mod orchestrator;
pub mod pool;
pub mod simulate;
pub mod work;

// Re-export commonly used types
pub use config::GovernorConfig;
pub use error::{GovernorError, Result};
pub use orchestrator::{Governor, GovernorStatus, RequestContext, RequestPlan, Strategy};
pub use pool::{BatchReport, PoolStats};
pub use work::{work_fn, ItemResult, ResponseMeta, Work, WorkFailure, WorkItem, WorkSuccess};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert_eq!(VERSION, env!("CARGO_PKG_VERSION"));
    }
}

//! Orchestration layer: the Intent State Machine, Per-Chain Subscribers,
//! Catchup Coordinator, Polling Subscriber, and Supervisor (spec.md §4.4-§4.8).

mod apply;
mod catchup;
mod polling;
mod subscriber;
mod supervisor;
mod telemetry;

pub use apply::apply_decoded_event;
pub use catchup::{CatchupCoordinator, CatchupTarget};
pub use polling::{run_polling_subscriber, PollingTarget};
pub use subscriber::{run_subscriber, SubscriberTarget};
pub use supervisor::{ChainHealth, ChainHealthRegistry, HealthSnapshot, Supervisor, TaskHealth};
pub use telemetry::Telemetry;
pub use speedrun_types::{decide, Transition};

// -
// Lifecycle defaults

/// Budget for the init + after-init phases together.
pub(crate) const DEFAULT_MAX_STARTUP_TIME_MS: u64 = 15_000;

// -
// Datasync defaults

/// Bounded wait for a subscriber to take a resync event off its sink.
pub(crate) const DEFAULT_RESYNC_ACCEPT_TIMEOUT_MS: u64 = 1_000;

/// Bounded wait for a subscriber to acknowledge a resync event.
pub(crate) const DEFAULT_RESYNC_DONE_TIMEOUT_MS: u64 = 5_000;

/// Bounded wait for a change sink before the event is dropped.
pub(crate) const DEFAULT_CHANGE_SEND_TIMEOUT_MS: u64 = 1_000;

pub(crate) const DEFAULT_CHANGE_SINK_CAPACITY: usize = 64;

/// Watch reconnect backoff bounds.
pub(crate) const DEFAULT_RECONNECT_INITIAL_DELAY_MS: u64 = 500;
pub(crate) const DEFAULT_RECONNECT_MAX_DELAY_MS: u64 = 16_000;

// -
// Key namespaces

/// Root segment of every agent-scoped key in the external store.
pub(crate) const AGENT_KEY_ROOT: &str = "/vnf-agent";

/// Environment variable naming this agent instance.
pub const MICROSERVICE_LABEL_ENV: &str = "MICROSERVICE_LABEL";

/// Label used when `MICROSERVICE_LABEL` is unset.
pub const DEFAULT_MICROSERVICE_LABEL: &str = "vpp1";

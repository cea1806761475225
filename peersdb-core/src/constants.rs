use std::time::Duration;

/// Shared topic on which validation requests are broadcast.
pub const VALIDATION_TOPIC: &str = "validation";

/// How long a quorum round collects votes before deciding.
pub const QUORUM_WINDOW: Duration = Duration::from_secs(5);

/// Delay between forcing a log reload and listing it.
pub const SETTLE_WINDOW: Duration = Duration::from_secs(5);

/// Hardware sampling period of the benchmark recorder.
pub const SAMPLE_INTERVAL: Duration = Duration::from_secs(10);

/// Capacity of the request and response queues.
pub const COMMAND_QUEUE_CAPACITY: usize = 100;

/// Capacity of a single topic subscription buffer.
pub const TOPIC_BUFFER: usize = 64;

/// Capacity of log and connectedness broadcast channels.
pub const EVENT_BUFFER: usize = 256;

pub const DEFAULT_CONTRIBUTIONS_STORE: &str = "contributions";
pub const DEFAULT_VALIDATIONS_STORE: &str = "validations";

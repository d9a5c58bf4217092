//! Transport instrumentation.
//!
//! Recorded through the `metrics` facade; nothing is collected unless the
//! embedding binary installs a recorder.

use metrics::{counter, gauge};

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "statecast_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "statecast_connections_active";
    pub const MESSAGES_TOTAL: &str = "statecast_messages_total";
    pub const MESSAGES_BYTES: &str = "statecast_messages_bytes";
    pub const BROADCASTS_TOTAL: &str = "statecast_broadcasts_total";
    pub const ERRORS_TOTAL: &str = "statecast_errors_total";
}

/// Record a newly opened connection.
pub fn record_connection() {
    counter!(names::CONNECTIONS_TOTAL).increment(1);
    gauge!(names::CONNECTIONS_ACTIVE).increment(1.0);
}

/// Record a connection that reached `Closed`.
pub fn record_disconnection() {
    gauge!(names::CONNECTIONS_ACTIVE).decrement(1.0);
}

/// Record a message.
pub fn record_message(bytes: usize, direction: &'static str) {
    counter!(names::MESSAGES_TOTAL, "direction" => direction).increment(1);
    counter!(names::MESSAGES_BYTES, "direction" => direction).increment(bytes as u64);
}

/// Record a fan-out to `recipients` connections.
pub fn record_broadcast(recipients: usize) {
    counter!(names::BROADCASTS_TOTAL).increment(1);
    counter!(names::MESSAGES_TOTAL, "direction" => "broadcast").increment(recipients as u64);
}

/// Record an error.
pub fn record_error(error_type: &'static str) {
    counter!(names::ERRORS_TOTAL, "type" => error_type).increment(1);
}

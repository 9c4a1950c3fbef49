//! Canonical metric names and label keys
//!
//! Kept in one place so emitters and dashboards cannot drift apart.

pub const API_REQUESTS_TOTAL: &str = "api_requests_total";
pub const API_REQUEST_DURATION_SECONDS: &str = "api_request_duration_seconds";

pub const BUS_MESSAGES_RECEIVED_TOTAL: &str = "bus_messages_received_total";
pub const BUS_PUBLISH_TOTAL: &str = "bus_publish_total";
pub const BUS_DECODE_ERRORS_TOTAL: &str = "bus_decode_errors_total";
pub const BUS_CONNECTION_STATE: &str = "bus_connection_state";

pub const ADVISORY_REQUESTS_TOTAL: &str = "advisory_requests_total";
pub const ADVISORY_REQUEST_DURATION_SECONDS: &str = "advisory_request_duration_seconds";

pub const CACHE_HITS_TOTAL: &str = "cache_hits_total";
pub const CACHE_MISSES_TOTAL: &str = "cache_misses_total";
pub const CACHE_SIZE: &str = "cache_size";

pub const COMMANDS_DISPATCHED_TOTAL: &str = "commands_dispatched_total";

pub const DEVICES_ONLINE: &str = "devices_online";
pub const SYSTEM_SAFE: &str = "system_safe";

pub const SAMPLES_REJECTED_TOTAL: &str = "samples_rejected_total";
pub const WS_SESSIONS: &str = "ws_sessions";
pub const WS_MESSAGES_DROPPED_TOTAL: &str = "ws_messages_dropped_total";

/// Register human-readable descriptions with the installed recorder.
/// Safe to call once at startup; a no-op without a recorder.
pub fn describe() {
    metrics::describe_counter!(API_REQUESTS_TOTAL, "API requests by method, endpoint, status");
    metrics::describe_histogram!(
        API_REQUEST_DURATION_SECONDS,
        "API request latency in seconds"
    );
    metrics::describe_counter!(BUS_MESSAGES_RECEIVED_TOTAL, "Bus messages received by topic");
    metrics::describe_counter!(BUS_PUBLISH_TOTAL, "Bus publishes by topic and result");
    metrics::describe_counter!(BUS_DECODE_ERRORS_TOTAL, "Undecodable bus payloads by topic");
    metrics::describe_gauge!(
        BUS_CONNECTION_STATE,
        "Bus connection state (0 disconnected, 1 connecting, 2 connected, 3 reconnecting)"
    );
    metrics::describe_counter!(ADVISORY_REQUESTS_TOTAL, "Advisory calls by result class");
    metrics::describe_histogram!(
        ADVISORY_REQUEST_DURATION_SECONDS,
        "Advisory call latency in seconds"
    );
    metrics::describe_counter!(CACHE_HITS_TOTAL, "Cache hits by cache name");
    metrics::describe_counter!(CACHE_MISSES_TOTAL, "Cache misses by cache name");
    metrics::describe_gauge!(CACHE_SIZE, "Live cache entries by cache name");
    metrics::describe_counter!(COMMANDS_DISPATCHED_TOTAL, "Command dispatches by result");
    metrics::describe_gauge!(DEVICES_ONLINE, "Devices currently within the liveness TTL");
    metrics::describe_gauge!(SYSTEM_SAFE, "System-safe predicate (0 or 1)");
    metrics::describe_counter!(SAMPLES_REJECTED_TOTAL, "Sensor samples rejected by validation");
    metrics::describe_gauge!(WS_SESSIONS, "Open WebSocket sessions");
    metrics::describe_counter!(
        WS_MESSAGES_DROPPED_TOTAL,
        "WebSocket messages dropped by back-pressure"
    );
}

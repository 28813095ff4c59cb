use metrics::{describe_counter, describe_gauge, Counter, Gauge};

/// Frames handed to a relay connection
pub fn frames_sent() -> Counter {
    metrics::counter!("relay_frames_sent")
}

/// Frames decoded from a relay connection
pub fn frames_received() -> Counter {
    metrics::counter!("relay_frames_received")
}

/// Inbound frames that could not be decoded
pub fn protocol_errors() -> Counter {
    metrics::counter!("relay_protocol_errors")
}

/// Sockets currently registered in a pool
pub fn pool_sockets() -> Gauge {
    metrics::gauge!("pool_sockets")
}

/// Per-relay publish outcomes by status
pub fn publish_outcomes(status: &'static str) -> Counter {
    metrics::counter!("publish_outcomes", "status" => status)
}

/// Events received by requests, by classification
pub fn request_events(classification: &'static str) -> Counter {
    metrics::counter!("request_events", "classification" => classification)
}

/// Messages resent after an auth-required rejection
pub fn auth_retries() -> Counter {
    metrics::counter!("auth_retries")
}

/// Registers descriptions with whatever recorder the application installed.
pub fn describe_metrics() {
    describe_counter!("relay_frames_sent", "Frames handed to a relay connection");
    describe_counter!("relay_frames_received", "Frames decoded from a relay connection");
    describe_counter!("relay_protocol_errors", "Inbound frames that could not be decoded");
    describe_gauge!("pool_sockets", "Sockets currently registered in a pool");
    describe_counter!("publish_outcomes", "Per-relay publish outcomes by status");
    describe_counter!("request_events", "Events received by requests, by classification");
    describe_counter!("auth_retries", "Messages resent after an auth-required rejection");
}

/// Fire-and-forget counters and histograms. The `metrics` facade never
/// blocks and drops samples when no recorder is installed, so emission can
/// sit on the request path unconditionally.

pub fn record_request(endpoint: &'static str, status: u16) {
    metrics::counter!(
        "requests_total",
        "endpoint" => endpoint,
        "status" => status.to_string(),
    )
    .increment(1);
}

pub fn record_duration(endpoint: &'static str, seconds: f64) {
    metrics::histogram!("request_duration_seconds", "endpoint" => endpoint).record(seconds);
}

pub fn record_provider(provider: &str, model: &str, outcome: &str) {
    metrics::counter!(
        "provider_requests_total",
        "provider" => provider.to_string(),
        "model" => model.to_string(),
        "outcome" => outcome.to_string(),
    )
    .increment(1);
}

pub fn record_fallback(alias: &str, reason: &str) {
    metrics::counter!(
        "fallbacks_total",
        "alias" => alias.to_string(),
        "reason" => reason.to_string(),
    )
    .increment(1);
}

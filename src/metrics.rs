use tracing::trace;

// Counters and timings are emitted as trace events and aggregated from logs.

pub fn inc_requests(route: &'static str) {
    trace!(
        target = "catmatch.metrics",
        route = route,
        "requests_total_inc"
    );
}

pub fn chunk_elapsed(job_id: &str, chunk_index: usize, elapsed_ms: u128) {
    trace!(
        target = "catmatch.metrics",
        job_id = job_id,
        chunk_index = chunk_index as u64,
        elapsed_ms = elapsed_ms as u64,
        "chunk_elapsed"
    );
}

pub fn item_outcome(outcome: &'static str) {
    trace!(
        target = "catmatch.metrics",
        outcome = outcome,
        "item_outcomes_total_inc"
    );
}

pub fn completion_elapsed(ok: bool, elapsed_ms: u128) {
    trace!(
        target = "catmatch.metrics",
        ok = ok,
        elapsed_ms = elapsed_ms as u64,
        "completion_elapsed"
    );
}

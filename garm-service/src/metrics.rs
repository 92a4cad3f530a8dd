use lazy_static::lazy_static;
use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, Histogram, IntCounter,
    IntCounterVec, Registry,
};

lazy_static! {
    pub static ref WEBHOOK_EVENTS: IntCounterVec = register_int_counter_vec!(
        "garm_webhook_events_total",
        "Webhook deliveries accepted, by workflow job action",
        &["action"]
    )
    .unwrap();
    pub static ref WEBHOOK_REJECTED: IntCounterVec = register_int_counter_vec!(
        "garm_webhook_rejected_total",
        "Webhook deliveries rejected, by reason",
        &["reason"]
    )
    .unwrap();
    pub static ref PROVIDER_OPERATIONS: IntCounterVec = register_int_counter_vec!(
        "garm_provider_operations_total",
        "External provider invocations, by verb and outcome",
        &["verb", "outcome"]
    )
    .unwrap();
    pub static ref RUNNERS_CREATED: IntCounter = register_int_counter!(
        "garm_runners_created_total",
        "Instances successfully created by providers"
    )
    .unwrap();
    pub static ref RUNNERS_DELETED: IntCounter = register_int_counter!(
        "garm_runners_deleted_total",
        "Instances fully reaped"
    )
    .unwrap();
    pub static ref RECONCILE_RUNS: IntCounterVec = register_int_counter_vec!(
        "garm_reconcile_runs_total",
        "Reconciliation rounds, by outcome",
        &["outcome"]
    )
    .unwrap();
    pub static ref RECONCILE_DURATION: Histogram = register_histogram!(
        "garm_reconcile_duration_seconds",
        "Wall clock duration of reconciliation rounds"
    )
    .unwrap();
    pub static ref SCALE_SET_MESSAGES: IntCounterVec = register_int_counter_vec!(
        "garm_scale_set_messages_total",
        "Scale set messages processed, by kind",
        &["kind"]
    )
    .unwrap();
}

pub fn register_all() -> Registry {
    // the default registry already holds everything registered above
    prometheus::default_registry().clone()
}

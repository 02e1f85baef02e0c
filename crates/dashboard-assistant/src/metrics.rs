use prometheus::{Encoder, HistogramOpts, HistogramVec, IntCounterVec, Registry, TextEncoder};
use lazy_static::lazy_static;
use std::sync::OnceLock;

lazy_static! {
    static ref REGISTRY: Registry = Registry::new();
}
static QUESTIONS: OnceLock<IntCounterVec> = OnceLock::new();
static GUARD_REJECTIONS: OnceLock<IntCounterVec> = OnceLock::new();
static STAGE_LATENCY: OnceLock<HistogramVec> = OnceLock::new();

pub fn init_metrics() {
    let questions = QUESTIONS.get_or_init(|| {
        IntCounterVec::new(
            prometheus::opts!("assistant_questions_total", "Questions answered per outcome"),
            &["outcome"],
        )
        .unwrap()
    });

    let guard_rejections = GUARD_REJECTIONS.get_or_init(|| {
        IntCounterVec::new(
            prometheus::opts!("assistant_guard_rejections_total", "Generated queries refused by the SQL guard"),
            &["reason"],
        )
        .unwrap()
    });

    let stage_latency = STAGE_LATENCY.get_or_init(|| {
        HistogramVec::new(
            HistogramOpts::new("assistant_stage_seconds", "Time spent per pipeline stage")
                .buckets(vec![0.005, 0.025, 0.1, 0.5, 1.0, 2.5, 5.0, 15.0, 30.0]),
            &["stage"],
        )
        .unwrap()
    });

    REGISTRY.register(Box::new(questions.clone())).ok();
    REGISTRY.register(Box::new(guard_rejections.clone())).ok();
    REGISTRY.register(Box::new(stage_latency.clone())).ok();
}

pub fn inc_question(outcome: &str) {
    if let Some(counter) = QUESTIONS.get() {
        counter.with_label_values(&[outcome]).inc();
    }
}

pub fn inc_guard_rejection(reason: &str) {
    if let Some(counter) = GUARD_REJECTIONS.get() {
        counter.with_label_values(&[reason]).inc();
    }
}

pub fn observe_stage(stage: &str, seconds: f64) {
    if let Some(histogram) = STAGE_LATENCY.get() {
        histogram.with_label_values(&[stage]).observe(seconds);
    }
}

/// Text exposition of everything registered so far.
pub fn render() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = vec![];
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# failed to encode metrics: {}\n", e);
    }
    String::from_utf8_lossy(&buffer).into_owned()
}

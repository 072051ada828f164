//! Execution metrics and the session decorator that records them.
//!
//! | Metric                             | Type      | Labels            |
//! |------------------------------------|-----------|-------------------|
//! | `kernel_execution_total`           | counter   | kernel, outcome   |
//! | `kernel_execution_time_seconds`    | histogram | kernel            |
//! | `kernel_startup_time_seconds`      | histogram | kernel            |
//! | `kernel_active`                    | gauge     | kernel            |
//!
//! `outcome` is `success`, `error` (kernel-side error or client fault), or
//! `timeout`. Recording never changes what `execute` returns.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use prometheus::{Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder};
use serde::Serialize;

use kernelgate_types::{ExecutionResult, KernelIdentity, KernelSpec};

use crate::error::GatewayError;
use crate::gateway::KernelLifecycle;
use crate::session::{KernelSession, Session, SessionOptions, SessionState};

/// Outcome label for `kernel_execution_total`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display, strum::AsRefStr)]
#[strum(serialize_all = "lowercase")]
pub enum Outcome {
    Success,
    Error,
    Timeout,
}

impl Outcome {
    pub fn of(result: &Result<ExecutionResult, GatewayError>) -> Self {
        match result {
            Ok(r) if r.is_ok() => Outcome::Success,
            Ok(_) => Outcome::Error,
            Err(GatewayError::ExecutionTimeout(_)) => Outcome::Timeout,
            Err(_) => Outcome::Error,
        }
    }
}

/// Registered execution metrics. Share one instance across sessions.
pub struct ExecutionMetrics {
    registry: Registry,
    executions_total: IntCounterVec,
    execution_seconds: HistogramVec,
    startup_seconds: HistogramVec,
    active: IntGaugeVec,
}

impl ExecutionMetrics {
    /// Create the metrics and register them with `registry`.
    pub fn new(registry: &Registry) -> Result<Self, GatewayError> {
        let executions_total = IntCounterVec::new(
            Opts::new("kernel_execution_total", "Total number of code executions"),
            &["kernel", "outcome"],
        )
        .map_err(metric_error)?;

        let execution_seconds = HistogramVec::new(
            HistogramOpts::new("kernel_execution_time_seconds", "Time taken to execute code in a kernel")
                .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
            &["kernel"],
        )
        .map_err(metric_error)?;

        let startup_seconds = HistogramVec::new(
            HistogramOpts::new("kernel_startup_time_seconds", "Time taken to start a kernel")
                .buckets(vec![0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0]),
            &["kernel"],
        )
        .map_err(metric_error)?;

        let active = IntGaugeVec::new(
            Opts::new("kernel_active", "Number of currently active kernels"),
            &["kernel"],
        )
        .map_err(metric_error)?;

        registry.register(Box::new(executions_total.clone())).map_err(metric_error)?;
        registry.register(Box::new(execution_seconds.clone())).map_err(metric_error)?;
        registry.register(Box::new(startup_seconds.clone())).map_err(metric_error)?;
        registry.register(Box::new(active.clone())).map_err(metric_error)?;

        Ok(Self {
            registry: registry.clone(),
            executions_total,
            execution_seconds,
            startup_seconds,
            active,
        })
    }

    pub fn record_execution(&self, kernel: &str, outcome: Outcome, elapsed: Duration) {
        self.executions_total
            .with_label_values(&[kernel, outcome.as_ref()])
            .inc();
        self.execution_seconds
            .with_label_values(&[kernel])
            .observe(elapsed.as_secs_f64());
    }

    pub fn record_startup(&self, kernel: &str, elapsed: Duration) {
        self.startup_seconds
            .with_label_values(&[kernel])
            .observe(elapsed.as_secs_f64());
    }

    fn session_started(&self, kernel: &str) {
        self.active.with_label_values(&[kernel]).inc();
    }

    fn session_ended(&self, kernel: &str) {
        self.active.with_label_values(&[kernel]).dec();
    }

    /// Summary for one kernel name.
    pub fn snapshot(&self, kernel: &str) -> MetricsSnapshot {
        let count = |outcome: Outcome| {
            self.executions_total
                .with_label_values(&[kernel, outcome.as_ref()])
                .get()
        };
        let execution = self.execution_seconds.with_label_values(&[kernel]);
        let startup = self.startup_seconds.with_label_values(&[kernel]);
        MetricsSnapshot {
            kernel: kernel.to_string(),
            executions: ExecutionCounts {
                success: count(Outcome::Success),
                error: count(Outcome::Error),
                timeout: count(Outcome::Timeout),
            },
            execution_seconds_sum: execution.get_sample_sum(),
            startup_seconds_sum: startup.get_sample_sum(),
            startups: startup.get_sample_count(),
            active: self.active.with_label_values(&[kernel]).get(),
        }
    }

    /// Everything in the registry, in the Prometheus text format.
    pub fn render(&self) -> Result<String, GatewayError> {
        let mut buf = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buf)
            .map_err(metric_error)?;
        String::from_utf8(buf).map_err(|e| GatewayError::Protocol(e.to_string()))
    }
}

fn metric_error(e: prometheus::Error) -> GatewayError {
    GatewayError::Config(format!("metrics: {e}"))
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ExecutionCounts {
    pub success: u64,
    pub error: u64,
    pub timeout: u64,
}

/// Serializable per-kernel summary.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub kernel: String,
    pub executions: ExecutionCounts,
    pub execution_seconds_sum: f64,
    pub startup_seconds_sum: f64,
    pub startups: u64,
    pub active: i64,
}

/// Wraps a session and records every execute. Results pass through untouched.
pub struct MetricsSession<S> {
    inner: S,
    metrics: Arc<ExecutionMetrics>,
    kernel: String,
    active: bool,
}

impl<S: KernelSession> MetricsSession<S> {
    pub fn new(inner: S, metrics: Arc<ExecutionMetrics>) -> Self {
        let kernel = inner.kernel().name.clone();
        metrics.session_started(&kernel);
        Self {
            inner,
            metrics,
            kernel,
            active: true,
        }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    pub fn inner_mut(&mut self) -> &mut S {
        &mut self.inner
    }

    pub fn metrics(&self) -> &ExecutionMetrics {
        &self.metrics
    }

    fn mark_inactive(&mut self) {
        if self.active {
            self.active = false;
            self.metrics.session_ended(&self.kernel);
        }
    }
}

impl MetricsSession<Session> {
    /// Open a session and record how long the kernel took to become ready.
    pub async fn open(
        lifecycle: Arc<dyn KernelLifecycle>,
        spec: KernelSpec,
        options: SessionOptions,
        metrics: Arc<ExecutionMetrics>,
    ) -> Result<Self, GatewayError> {
        let kernel = spec.name.clone();
        let started = Instant::now();
        let session = Session::open(lifecycle, spec, options).await?;
        metrics.record_startup(&kernel, started.elapsed());
        Ok(Self::new(session, metrics))
    }
}

#[async_trait]
impl<S: KernelSession> KernelSession for MetricsSession<S> {
    fn kernel(&self) -> &KernelIdentity {
        self.inner.kernel()
    }

    fn state(&self) -> SessionState {
        self.inner.state()
    }

    async fn execute(&mut self, code: &str, timeout: Duration) -> Result<ExecutionResult, GatewayError> {
        let started = Instant::now();
        let result = self.inner.execute(code, timeout).await;
        self.metrics
            .record_execution(&self.kernel, Outcome::of(&result), started.elapsed());
        result
    }

    async fn close(&mut self) {
        self.inner.close().await;
        self.mark_inactive();
    }
}

impl<S> Drop for MetricsSession<S> {
    fn drop(&mut self) {
        if self.active {
            self.metrics.session_ended(&self.kernel);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockGateway;
    use crate::retry::RetryPolicy;

    fn options() -> SessionOptions {
        SessionOptions::default()
            .with_startup_timeout(Duration::from_secs(1))
            .with_retry(RetryPolicy::none())
    }

    async fn open(gateway: &MockGateway, metrics: &Arc<ExecutionMetrics>) -> MetricsSession<Session> {
        MetricsSession::open(gateway.lifecycle(), KernelSpec::new("python3"), options(), Arc::clone(metrics))
            .await
            .unwrap()
    }

    fn metrics() -> Arc<ExecutionMetrics> {
        Arc::new(ExecutionMetrics::new(&Registry::new()).unwrap())
    }

    #[tokio::test]
    async fn test_outcomes_are_counted_and_results_untouched() {
        let gateway = MockGateway::new();
        let metrics = metrics();
        let mut session = open(&gateway, &metrics).await;

        let ok = session.execute("2+2", Duration::from_secs(1)).await.unwrap();
        assert_eq!(ok.return_value, Some(serde_json::json!(4)));

        let failed = session.execute("raise 1/0", Duration::from_secs(1)).await.unwrap();
        assert_eq!(failed.error.as_ref().map(|e| e.name.as_str()), Some("ZeroDivisionError"));

        let snapshot = metrics.snapshot("python3");
        assert_eq!(snapshot.executions, ExecutionCounts { success: 1, error: 1, timeout: 0 });
        assert_eq!(snapshot.startups, 1);
        assert_eq!(snapshot.active, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_counted_and_still_surfaced() {
        let gateway = MockGateway::new();
        let metrics = metrics();
        let mut session = open(&gateway, &metrics).await;

        let err = session.execute("hang", Duration::from_secs(2)).await.unwrap_err();

        assert!(matches!(err, GatewayError::ExecutionTimeout(_)));
        assert_eq!(metrics.snapshot("python3").executions.timeout, 1);
        assert!(metrics.snapshot("python3").execution_seconds_sum >= 2.0);
    }

    #[tokio::test]
    async fn test_active_gauge_tracks_close() {
        let gateway = MockGateway::new();
        let metrics = metrics();
        let mut session = open(&gateway, &metrics).await;

        session.close().await;
        session.close().await;
        assert_eq!(metrics.snapshot("python3").active, 0);

        drop(session);
        assert_eq!(metrics.snapshot("python3").active, 0);
    }

    #[tokio::test]
    async fn test_render_uses_prometheus_names() {
        let gateway = MockGateway::new();
        let metrics = metrics();
        let mut session = open(&gateway, &metrics).await;
        session.execute("1", Duration::from_secs(1)).await.unwrap();

        let text = metrics.render().unwrap();
        assert!(text.contains("kernel_execution_total{kernel=\"python3\",outcome=\"success\"} 1"));
        assert!(text.contains("kernel_active{kernel=\"python3\"} 1"));
    }

    #[test]
    fn test_registering_twice_is_an_error() {
        let registry = Registry::new();
        ExecutionMetrics::new(&registry).unwrap();
        assert!(matches!(ExecutionMetrics::new(&registry), Err(GatewayError::Config(_))));
    }
}

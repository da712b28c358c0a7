use anyhow::{Context, Result};
use http::Response;
use log::{error, info};
use prometheus::{IntCounter, IntCounterVec, Opts, TextEncoder};
use prometheus::core::Collector;
use prometheus::Encoder;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use tokio::runtime::Runtime;
use warp::Filter;

/// Starts listening on an HTTP endpoint so that Prometheus can scrape metrics
/// from this instance. On success, returns a Runtime value that the caller
/// must keep live, or the task that handles Prometheus scrapes will not run.
/// Returns an error if something goes wrong setting up the endpoint.
pub fn start_metrics_scrape_endpoint(port: u16) -> Result<Runtime> {
    // The default, multi-threaded runtime should suffice for our needs
    let runtime = Runtime::new().context("failed to create runtime for metrics endpoint")?;

    // This task will run forever, so we intentionally drop the returned handle
    runtime.spawn(async move {
        let endpoint = warp::get().and(warp::path("metrics")).map(|| {
            match handle_scrape() {
                Ok(body) => {
                    Response::builder()
                        // https://github.com/prometheus/docs/blob/master/content/docs/instrumenting/exposition_formats.md
                        .header("Content-Type", "text/plain; version=0.0.4")
                        .body(body)
                }
                Err(err) => {
                    error!("unable to scrape Prometheus metrics: {}", err);
                    Response::builder().status(500).body(vec![])
                }
            }
        });

        info!("serving metrics scrapes on 0.0.0.0:{}", port);
        warp::serve(endpoint)
            .run(SocketAddr::new(IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)), port))
            .await;
    });

    Ok(runtime)
}

fn handle_scrape() -> Result<Vec<u8>> {
    let mut buffer = Vec::new();
    TextEncoder::new()
        .encode(&prometheus::gather(), &mut buffer)
        .context("failed to encode metrics")?;
    Ok(buffer)
}

/// Registers `collector` with the default registry, tolerating another
/// instance having registered the same collector already (which happens when
/// several managers share a metric namespace in one process).
fn register_tolerantly<C: Collector + Clone + 'static>(collector: &C) -> Result<()> {
    match prometheus::register(Box::new(collector.clone())) {
        Ok(()) | Err(prometheus::Error::AlreadyReg) => Ok(()),
        Err(e) => Err(e).context("failed to register metrics collector"),
    }
}

/// Every collector the provider stack needs, registered together so the
/// binary can wire managers with one handle.
#[derive(Clone, Debug)]
pub struct MetricsBundle {
    pub cli: CliMetricsCollector,
    pub transfer: TransferMetricsCollector,
    pub session: SessionMetricsCollector,
    pub observability: ObservabilityMetricsCollector,
}

impl MetricsBundle {
    pub fn new() -> Result<MetricsBundle> {
        Self::new_with_metric_name("multicloud")
    }

    pub fn new_with_metric_name(name: &str) -> Result<MetricsBundle> {
        Ok(MetricsBundle {
            cli: CliMetricsCollector::new_with_metric_name(name)?,
            transfer: TransferMetricsCollector::new_with_metric_name(name)?,
            session: SessionMetricsCollector::new_with_metric_name(name)?,
            observability: ObservabilityMetricsCollector::new_with_metric_name(name)?,
        })
    }
}

/// Counters for invocations of vendor CLIs, labeled by tool, operation and
/// outcome so dashboards can break down failures per provider call.
#[derive(Clone, Debug)]
pub struct CliMetricsCollector {
    pub invocations: IntCounterVec,
    pub retries: IntCounterVec,
}

impl CliMetricsCollector {
    pub fn new() -> Result<CliMetricsCollector> {
        Self::new_with_metric_name("multicloud")
    }

    /// Creates a collector whose metrics are prefixed with `name`. Tests use
    /// distinct names to avoid colliding registrations in the process-global
    /// registry.
    pub fn new_with_metric_name(name: &str) -> Result<CliMetricsCollector> {
        let invocations = IntCounterVec::new(
            Opts::new(
                format!("{name}_cli_invocations"),
                "Number of vendor CLI invocations",
            ),
            &["tool", "operation", "status"],
        )
        .context("failed to create CLI invocation counter")?;
        register_tolerantly(&invocations)?;

        let retries = IntCounterVec::new(
            Opts::new(
                format!("{name}_cli_retries"),
                "Number of retried vendor CLI invocations",
            ),
            &["tool", "operation"],
        )
        .context("failed to create CLI retry counter")?;
        register_tolerantly(&retries)?;

        Ok(CliMetricsCollector {
            invocations,
            retries,
        })
    }
}

/// Counters for S3 transfer activity.
#[derive(Clone, Debug)]
pub struct TransferMetricsCollector {
    pub transfer_operations: IntCounterVec,
    pub multipart_parts: IntCounter,
}

impl TransferMetricsCollector {
    pub fn new() -> Result<TransferMetricsCollector> {
        Self::new_with_metric_name("multicloud")
    }

    pub fn new_with_metric_name(name: &str) -> Result<TransferMetricsCollector> {
        let transfer_operations = IntCounterVec::new(
            Opts::new(
                format!("{name}_s3_transfer_operations"),
                "Number of S3 transfer operations",
            ),
            &["operation", "status"],
        )
        .context("failed to create transfer operation counter")?;
        register_tolerantly(&transfer_operations)?;

        let multipart_parts = IntCounter::with_opts(Opts::new(
            format!("{name}_s3_multipart_parts_uploaded"),
            "Number of multipart upload parts transferred",
        ))
        .context("failed to create multipart part counter")?;
        register_tolerantly(&multipart_parts)?;

        Ok(TransferMetricsCollector {
            transfer_operations,
            multipart_parts,
        })
    }
}

/// Counters for CloudWatch-side observability activity.
#[derive(Clone, Debug)]
pub struct ObservabilityMetricsCollector {
    pub custom_metrics_published: IntCounter,
    pub health_checks: IntCounterVec,
}

impl ObservabilityMetricsCollector {
    pub fn new() -> Result<ObservabilityMetricsCollector> {
        Self::new_with_metric_name("multicloud")
    }

    pub fn new_with_metric_name(name: &str) -> Result<ObservabilityMetricsCollector> {
        let custom_metrics_published = IntCounter::with_opts(Opts::new(
            format!("{name}_custom_metrics_published"),
            "Number of custom metric datapoints published to CloudWatch",
        ))
        .context("failed to create custom metric counter")?;
        register_tolerantly(&custom_metrics_published)?;

        let health_checks = IntCounterVec::new(
            Opts::new(
                format!("{name}_cloudwatch_health_checks"),
                "Number of CloudWatch health probes",
            ),
            &["status"],
        )
        .context("failed to create health check counter")?;
        register_tolerantly(&health_checks)?;

        Ok(ObservabilityMetricsCollector {
            custom_metrics_published,
            health_checks,
        })
    }
}

/// Counters for cross-account session lifecycle events.
#[derive(Clone, Debug)]
pub struct SessionMetricsCollector {
    pub sessions_minted: IntCounter,
    pub session_refreshes: IntCounterVec,
}

impl SessionMetricsCollector {
    pub fn new() -> Result<SessionMetricsCollector> {
        Self::new_with_metric_name("multicloud")
    }

    pub fn new_with_metric_name(name: &str) -> Result<SessionMetricsCollector> {
        let sessions_minted = IntCounter::with_opts(Opts::new(
            format!("{name}_cross_account_sessions_minted"),
            "Number of cross-account sessions created",
        ))
        .context("failed to create session mint counter")?;
        register_tolerantly(&sessions_minted)?;

        let session_refreshes = IntCounterVec::new(
            Opts::new(
                format!("{name}_cross_account_session_refreshes"),
                "Number of background session refreshes",
            ),
            &["status"],
        )
        .context("failed to create session refresh counter")?;
        register_tolerantly(&session_refreshes)?;

        Ok(SessionMetricsCollector {
            sessions_minted,
            session_refreshes,
        })
    }
}

//! Tracing setup for relba diagnostics.
//!
//! The engine and solver report through `tracing`: keyframe creation and
//! loop closures at INFO, per-iteration solver lines at DEBUG. The
//! subscriber installed here is tuned to those events: every line is
//! prefixed with the time elapsed since the subscriber was set up, so a
//! log can be read side by side with the per-call timings in
//! [`OptimizeReport`](crate::solver::OptimizeReport), followed by the
//! level and the emitting module:
//!
//! ```text
//! [   0.42ms  INFO relba::engine] defined keyframe 2: 1 edges, 4 observations
//! [   1.87ms DEBUG relba::solver::levenberg_marquardt] iteration 3: accepted, ...
//! ```
//!
//! The default level is overridable through `RUST_LOG`.

use std::sync::OnceLock;
use tracing::Level;
use web_time::{Duration, Instant};

/// When the subscriber was installed; log lines show time relative to
/// this.
static STARTED: OnceLock<Instant> = OnceLock::new();

/// Install relba's tracing subscriber with INFO as the default level.
///
/// # Example
/// ```no_run
/// relba::init_logger();
/// tracing::info!("engine ready");
/// ```
///
/// # Panics
/// Panics if a global tracing subscriber is already installed; use
/// [`init_test_logger`] where that may legitimately happen.
pub fn init_logger() {
    init_logger_with_level(Level::INFO)
}

/// Install relba's tracing subscriber with a custom default level.
///
/// # Example
/// ```no_run
/// use tracing::Level;
///
/// relba::init_logger_with_level(Level::DEBUG);
/// tracing::debug!("solver iteration tables enabled");
/// ```
pub fn init_logger_with_level(default_level: Level) {
    install(default_level).expect("a global tracing subscriber is already installed");
}

/// Idempotent setup for test binaries: the first caller installs the
/// subscriber (with a DEBUG default, so the solver iteration lines show
/// under `cargo test -- --nocapture`), later callers are no-ops.
pub fn init_test_logger() {
    let _ = install(Level::DEBUG);
}

fn install(default_level: Level) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    STARTED.get_or_init(Instant::now);
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(default_level.into())
                .from_env_lossy(),
        )
        .event_format(ElapsedFormatter)
        .try_init()
}

/// Compact elapsed time: sub-second values in milliseconds, longer runs
/// in seconds.
fn format_elapsed(elapsed: Duration) -> String {
    let secs = elapsed.as_secs_f64();
    if secs < 1.0 {
        format!("{:>7.2}ms", secs * 1000.0)
    } else {
        format!("{:>8.3}s", secs)
    }
}

/// Event formatter prefixing each line with the elapsed time, level and
/// module.
struct ElapsedFormatter;

impl<S, N> tracing_subscriber::fmt::FormatEvent<S, N> for ElapsedFormatter
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
    N: for<'a> tracing_subscriber::fmt::FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &tracing_subscriber::fmt::FmtContext<'_, S, N>,
        mut writer: tracing_subscriber::fmt::format::Writer<'_>,
        event: &tracing::Event<'_>,
    ) -> std::fmt::Result {
        let elapsed = STARTED.get().map(Instant::elapsed).unwrap_or_default();
        let metadata = event.metadata();
        write!(
            writer,
            "[{} {:>5} {}] ",
            format_elapsed(elapsed),
            metadata.level().to_string(),
            metadata.target()
        )?;
        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

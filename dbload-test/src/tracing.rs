use tracing_subscriber::EnvFilter;
use tracing_subscriber::filter::Directive;

/// Targets whose events are always shown in tests.
const TARGETS: &[&str] = &["dbload_cli", "dbload_engine"];

fn directive(target: &str, level: &str) -> Option<Directive> {
    format!("{target}={level}").parse().ok()
}

/// Installs a compact subscriber that writes through the test harness.
///
/// Events of the load generator's crates are captured down to `DEBUG`; everything else only from
/// `WARN`. `RUST_LOG` replaces these defaults if set. Safe to call from every test.
///
/// ```
/// dbload_test::tracing::init();
/// ```
pub fn init() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        TARGETS
            .iter()
            .filter_map(|target| directive(target, "debug"))
            .fold(EnvFilter::new("warn"), EnvFilter::add_directive)
    });

    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_test_writer()
        .without_time()
        .compact()
        .try_init();
}

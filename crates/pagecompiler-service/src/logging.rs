use tracing::level_filters::LevelFilter;
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::fmt::{MakeWriter, fmt};
use tracing_subscriber::prelude::*;
use tracing_subscriber::util::SubscriberInitExt;

/// Returns the `RUST_LOG` directives used when the environment does not provide any.
///
/// Only the pagecompiler crates get more verbose than `INFO`, dependencies stay quiet.
pub fn default_env_filter(level: LevelFilter) -> String {
    let verbose = match level {
        LevelFilter::OFF => return String::new(),
        LevelFilter::DEBUG => "DEBUG",
        LevelFilter::TRACE => "TRACE",
        _ => return level.to_string().to_uppercase(),
    };
    format!("INFO,pagecompiler_service={verbose},pagecompiler_stress={verbose}")
}

/// Installs a global subscriber writing one JSON object per event.
pub fn init_json_logging<W>(env_filter: &str, make_writer: W)
where
    W: for<'writer> MakeWriter<'writer> + Send + Sync + 'static,
{
    fmt()
        .with_timer(UtcTime::rfc_3339())
        .with_target(true)
        .with_env_filter(env_filter)
        .json()
        .flatten_event(true)
        .with_current_span(true)
        .with_span_list(true)
        .with_file(true)
        .with_line_number(true)
        .with_writer(make_writer)
        .finish()
        .with(sentry::integrations::tracing::layer())
        .init();
}

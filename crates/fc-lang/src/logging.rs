//! Tracing setup shared by the binary and the C library.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Install a stderr subscriber.
///
/// `RUST_LOG` wins when set. Otherwise the level comes from `FC_LOG`
/// (`trace`, `debug`, `info`, `warn`, `error`; default `info`), raised to
/// `trace` when `trace` is true. `LOG_FORMAT=json` switches to JSON lines.
/// Safe to call more than once; later calls are no-ops.
pub fn init_tracing(trace: bool) {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = if trace {
            "trace"
        } else {
            level_from(std::env::var("FC_LOG").ok().as_deref())
        };
        EnvFilter::new(format!("fc_lang={level},fclang={level}"))
    };

    let registry = tracing_subscriber::registry().with(filter);
    let _ = if std::env::var("LOG_FORMAT").as_deref() == Ok("json") {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init()
    } else {
        registry
            .with(fmt::layer().with_writer(std::io::stderr))
            .try_init()
    };
}

fn level_from(setting: Option<&str>) -> &'static str {
    match setting {
        Some("trace") => "trace",
        Some("debug") => "debug",
        Some("warn") | Some("warning") => "warn",
        Some("error") => "error",
        _ => "info",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_levels_fall_back_to_info() {
        assert_eq!(level_from(Some("warning")), "warn");
        assert_eq!(level_from(Some("loud")), "info");
        assert_eq!(level_from(None), "info");
    }
}

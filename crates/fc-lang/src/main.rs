use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use anyhow::Context;
use fc_lang::{Driver, DriverConfig, logging::init_tracing};

struct Args {
    trace: bool,
    socket: PathBuf,
    foreign_socket: PathBuf,
}

fn main() {
    let args: Vec<String> = std::env::args().collect();

    let args = match parse_args(&args) {
        Ok(v) => v,
        Err(msg) => {
            if !msg.is_empty() {
                eprintln!("error: {msg}");
                eprintln!();
            }
            eprintln!("Usage: fc-lang [--trace] <socket-path> <foreign-socket-path>");
            eprintln!();
            eprintln!("Arguments:");
            eprintln!("  <socket-path>          Socket to serve the bridge on");
            eprintln!("  <foreign-socket-path>  Foreign endpoint to dial, or \"\" to run standalone");
            eprintln!();
            eprintln!("Options:");
            eprintln!("  --trace                Log everything at trace level");
            eprintln!();
            eprintln!("Environment:");
            eprintln!("  FC_LOG, RUST_LOG, LOG_FORMAT=json, FC_FORWARD_TIMEOUT_MS, FC_QUEUE_DEPTH");
            process::exit(2);
        }
    };

    init_tracing(args.trace);

    if let Err(e) = run(args) {
        tracing::error!(error = ?e, "fc-lang failed");
        eprintln!("error: {e:#}");
        process::exit(1);
    }
}

fn parse_args(args: &[String]) -> Result<Args, String> {
    let mut trace = false;
    let mut positional: Vec<&str> = Vec::new();

    for arg in args.iter().skip(1) {
        match arg.as_str() {
            "--trace" => trace = true,
            "--help" | "-h" => return Err(String::new()),
            flag if flag.starts_with('-') && flag.len() > 1 => {
                return Err(format!("unknown flag: {flag}"));
            }
            value => positional.push(value),
        }
    }

    match positional.as_slice() {
        [socket, foreign] => Ok(Args {
            trace,
            socket: PathBuf::from(socket),
            foreign_socket: PathBuf::from(foreign),
        }),
        [] => Err("missing required argument: <socket-path>".to_string()),
        [_] => Err("missing required argument: <foreign-socket-path>".to_string()),
        [_, _, extra, ..] => Err(format!("unexpected argument: {extra}")),
    }
}

fn run(args: Args) -> anyhow::Result<()> {
    let config = DriverConfig::new(args.socket)
        .with_foreign_socket(args.foreign_socket)
        .with_env_overrides()?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build runtime")?;

    runtime.block_on(async move {
        let driver = Arc::new(Driver::start(config).await?);
        tokio::spawn({
            let driver = driver.clone();
            async move {
                shutdown_signal().await;
                tracing::info!("Shutdown requested");
                driver.stop();
            }
        });
        driver.serve().await?;
        Ok::<_, anyhow::Error>(())
    })
}

/// Resolves on SIGINT or SIGTERM. A handler that cannot be installed just
/// never fires.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "Could not listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut term) => {
                term.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Could not listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(rest: &[&str]) -> Vec<String> {
        std::iter::once("fc-lang")
            .chain(rest.iter().copied())
            .map(String::from)
            .collect()
    }

    #[test]
    fn accepts_two_sockets_and_trace() {
        let args = parse_args(&argv(&["--trace", "/tmp/a.sock", ""])).unwrap();
        assert!(args.trace);
        assert_eq!(args.socket, PathBuf::from("/tmp/a.sock"));
        assert_eq!(args.foreign_socket, PathBuf::new());
    }

    #[test]
    fn rejects_bad_command_lines() {
        assert!(parse_args(&argv(&[])).is_err());
        assert!(parse_args(&argv(&["/tmp/a.sock"])).is_err());
        assert!(parse_args(&argv(&["a", "b", "c"])).is_err());
        assert!(parse_args(&argv(&["--loud", "a", "b"])).is_err());
        assert_eq!(parse_args(&argv(&["-h"])).err(), Some(String::new()));
    }
}

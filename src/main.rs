//! Demo: three shell workers driven through a registry.
//!
//! Each worker understands the commands `start`, `compute`, `log` and `stop`
//! and answers with tagged events. Press Ctrl-C to stop early.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use worker_hub::{
    HostConfig, ProcessHost, WorkerHandle, WorkerOptions, WorkerRegistry,
};

/// Inline worker: reads one JSON line per command and replies with tagged events.
const DEMO_WORKER: &str = r#"
emit() { printf '{"event":"%s","data":"%s"}\n' "$1" "$2"; }
last=0
while IFS= read -r line; do
  case "$line" in
    '"start"')   emit start "Started!" ;;
    '"compute"')
      emit compute "Computation started!"
      began=$(date +%s); sleep 1; last=$(( $(date +%s) - began ))
      emit compute "Computation terminated!" ;;
    '"log"')     emit log "Last computation time: ${last}s" ;;
    '"stop"')    emit stop "Stopped!"; exit 0 ;;
    *)           emit unknown "Unknown command." ;;
  esac
done
"#;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let host = ProcessHost::new(HostConfig::from_env()?);
    let registry = WorkerRegistry::shared();

    eprintln!("worker-hub demo v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Interpreter: {} {}", host.config().interpreter, host.config().inline_flag);

    for n in 0..3 {
        let label = format!("Web Worker {n}");
        let worker = WorkerHandle::create(&host, make_options(&label, Arc::clone(&registry)))?;
        registry.register([&worker]);
    }
    eprintln!("   Workers: {} registered\n", registry.len());

    registry.listen("unknown", |ww, data| {
        eprintln!("[{}] unknown: {}", ww.label().unwrap_or("?"), text(data));
    });

    let script = ["start", "compute", "log", "bogus", "stop"];
    for command in script {
        eprintln!("> broadcast {command}");
        let delivery = registry.broadcast(command, None);
        if !delivery.is_complete() {
            eprintln!("   {} worker(s) did not accept '{command}'", delivery.failed.len());
        }

        tokio::select! {
            _ = tokio::time::sleep(pause_after(command)) => {}
            _ = tokio::signal::ctrl_c() => {
                eprintln!("Interrupted");
                break;
            }
        }
    }

    match registry.stop_all() {
        Ok(count) => eprintln!("\nStopped {count} remaining worker(s)"),
        Err(e) => eprintln!("\n{e}"),
    }

    Ok(())
}

fn make_options(label: &str, registry: Arc<WorkerRegistry>) -> WorkerOptions {
    let mut options = WorkerOptions::inline(DEMO_WORKER).with_label(label);
    for event in ["start", "compute", "log"] {
        options = options.with_listener(event, move |ww, data| {
            eprintln!("[{}] {event}: {}", ww.label().unwrap_or("?"), text(data));
        });
    }
    options
        .with_listener("stop", move |ww, data| {
            eprintln!("[{}] stop: {}", ww.label().unwrap_or("?"), text(data));
            registry.unregister([ww]);
        })
        .with_listener("error", |ww, failure| {
            eprintln!("[{}] error: {}", ww.label().unwrap_or("?"), failure);
        })
}

fn pause_after(command: &str) -> Duration {
    match command {
        "compute" => Duration::from_millis(1500),
        _ => Duration::from_millis(200),
    }
}

fn text(data: &Value) -> String {
    match data {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

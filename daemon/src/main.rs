use std::env;
use std::thread;
use std::time::Duration;

use modelhub_core::events::Subscriber;
use modelhub_core::{
    CoreError, CoreResult, Event, EventKind, ManagerConfig, PathRegistry, TaskManager,
};
use tracing_subscriber::EnvFilter;

/// Mirrors task lifecycle events into the log.
struct LogSubscriber;

impl Subscriber for LogSubscriber {
    fn deliver(&self, event: &Event) -> CoreResult<()> {
        match event.kind {
            EventKind::UpdateDownloadTask => {}
            EventKind::ErrorDownloadTask | EventKind::ScanError => {
                tracing::warn!(event = %event.kind, data = %event.data, "task event")
            }
            _ => tracing::info!(event = %event.kind, data = %event.data, "task event"),
        }
        Ok(())
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let manager = match build_manager() {
        Ok(manager) => manager,
        Err(err) => {
            tracing::error!("cannot start: {}", err);
            return;
        }
    };
    manager.broadcaster().add_subscriber(Box::new(LogSubscriber));

    let (interval_secs, once) = parse_args();

    match manager.restore() {
        Ok(count) => tracing::info!(count, "descriptors restored"),
        Err(err) => tracing::error!("restore failed: {}", err),
    }

    match manager.resume_all() {
        Ok(count) => tracing::info!(count, "resumed paused downloads"),
        Err(err) => tracing::error!("resume failed: {}", err),
    }

    loop {
        let idle = manager.wait_idle(Duration::from_secs(interval_secs));
        let status = manager.pool_status();
        if !idle {
            tracing::info!(
                workers = status.workers,
                claimed = status.claimed,
                queued = status.queued,
                "downloads in progress"
            );
        }
        if once && idle {
            break;
        }
        if idle {
            thread::sleep(Duration::from_secs(interval_secs));
        }
    }

    manager.shutdown();
}

fn build_manager() -> Result<TaskManager, CoreError> {
    let config = ManagerConfig::from_env();
    let models = env::var("MODELHUB_MODELS_DIR").unwrap_or_else(|_| "models".to_string());
    TaskManager::new(config, PathRegistry::with_defaults(models))
}

fn parse_args() -> (u64, bool) {
    let mut interval_secs = 2u64;
    let mut once = false;
    let mut args = env::args().skip(1);

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--interval" => {
                if let Some(value) = args.next() {
                    if let Ok(parsed) = value.parse::<u64>() {
                        interval_secs = parsed.max(1);
                    }
                }
            }
            "--once" => {
                once = true;
            }
            _ => {}
        }
    }

    (interval_secs, once)
}

use std::env;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use modelhub_core::control::TaskControl;
use modelhub_core::{
    CoreError, Event, EventKind, ManagerConfig, PathRegistry, TaskId, TaskKind, TaskManager,
    TaskState,
};
use serde_json::{json, Value};
use tracing_subscriber::EnvFilter;

fn main() {
    init_logging();
    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        print_usage();
        return;
    }

    let manager = match build_manager() {
        Ok(manager) => manager,
        Err(err) => {
            eprintln!("error: {}", err);
            return;
        }
    };
    if let Err(err) = manager.restore() {
        eprintln!("error: {}", err);
        return;
    }

    let result = match args[1].as_str() {
        "download" => download(&manager, &args[2..]),
        "list" => list(&manager, args.get(2)),
        "status" => with_id(&args, 2, |id| {
            let status = manager.status(id)?;
            println!(
                "{}\t{}\t{}/{}\t{:.1}%\t{}",
                status.state,
                status.filename,
                format_bytes(status.downloaded_size),
                format_bytes(status.total_size),
                status.progress,
                status.error.unwrap_or_default()
            );
            Ok(())
        }),
        "pause" => with_id(&args, 2, |id| manager.pause(id)),
        "resume" => with_id(&args, 2, |id| {
            manager.resume(id)?;
            follow(&manager, id);
            Ok(())
        }),
        "cancel" => with_id(&args, 2, |id| manager.cancel(id)),
        "delete" => with_id(&args, 2, |id| manager.delete(id)),
        "scan" => match (args.get(2), args.get(3).map(String::as_str)) {
            (Some(folder), Some("--cached")) => cached_scan(&manager, folder),
            (Some(folder), None) => scan(&manager, folder),
            _ => {
                print_usage();
                Ok(())
            }
        },
        "info" => match args.get(2).map(String::as_str) {
            Some(mode @ ("diff" | "full")) => {
                let mut params = json!({"mode": mode});
                if let Some(path) = args.get(3) {
                    params["path"] = json!(path);
                }
                run_task(&manager, TaskKind::ScanInformation, params)
            }
            _ => {
                print_usage();
                Ok(())
            }
        },
        "metadata" => match args.get(2) {
            Some(path) => run_task(&manager, TaskKind::UpdateMetadata, json!({"modelPath": path})),
            None => {
                print_usage();
                Ok(())
            }
        },
        "set-key" => match args.get(2) {
            Some(platform) => manager
                .credentials()
                .set(platform, args.get(3).map(String::as_str)),
            None => {
                print_usage();
                Ok(())
            }
        },
        "keys" => manager.credentials().masked().map(|keys| {
            for (platform, masked) in keys {
                println!("{}\t{}", platform, masked);
            }
        }),
        _ => {
            print_usage();
            Ok(())
        }
    };
    if let Err(err) = result {
        eprintln!("error: {}", err.user_message());
    }
    manager.shutdown();
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn build_manager() -> Result<TaskManager, CoreError> {
    let config = ManagerConfig::from_env();
    let models = env::var("MODELHUB_MODELS_DIR").unwrap_or_else(|_| "models".to_string());
    TaskManager::new(config, PathRegistry::with_defaults(models))
}

/// `download <url> <type> <filename> [--size-kb N] [--platform P] [--path-index N]`
fn download(manager: &TaskManager, args: &[String]) -> Result<(), CoreError> {
    if args.len() < 3 {
        print_usage();
        return Ok(());
    }
    let mut params = json!({
        "url": args[0],
        "type": args[1],
        "filename": args[2],
    });
    let mut rest = args[3..].iter();
    while let Some(flag) = rest.next() {
        let value = rest
            .next()
            .ok_or_else(|| CoreError::Validation(format!("{} needs a value", flag)))?;
        match flag.as_str() {
            "--size-kb" => {
                let kb: f64 = value
                    .parse()
                    .map_err(|_| CoreError::Validation(format!("invalid size: {}", value)))?;
                params["sizeKb"] = json!(kb);
            }
            "--platform" => params["platform"] = json!(value),
            "--path-index" => {
                let index: usize = value
                    .parse()
                    .map_err(|_| CoreError::Validation(format!("invalid path index: {}", value)))?;
                params["pathIndex"] = json!(index);
            }
            "--sha256" => params["hashes"] = json!({"SHA256": value}),
            other => return Err(CoreError::Validation(format!("unknown option {}", other))),
        }
    }
    run_task(manager, TaskKind::DownloadModel, params)
}

fn run_task(manager: &TaskManager, kind: TaskKind, params: Value) -> Result<(), CoreError> {
    let task = manager.create(kind, params)?;
    println!("created task: {}", task.id);
    follow(manager, &task.id);
    Ok(())
}

/// Prints progress until the task stops running.
fn follow(manager: &TaskManager, id: &TaskId) {
    let (handle, stop) = spawn_progress(manager.broadcaster().subscribe(), *id);
    loop {
        match manager.get(id) {
            Ok(task) if task.status == TaskState::Pending || task.status == TaskState::Running => {
                thread::sleep(Duration::from_millis(200));
            }
            Ok(task) => {
                manager.wait_idle(manager.config().settle_timeout);
                match task.error {
                    Some(error) => println!("{}: {}", task.status, error),
                    None => println!("{}", task.status),
                }
                break;
            }
            Err(err) => {
                eprintln!("error: {}", err);
                break;
            }
        }
    }
    stop.store(true, Ordering::SeqCst);
    let _ = handle.join();
}

fn list(manager: &TaskManager, state: Option<&String>) -> Result<(), CoreError> {
    let state = match state {
        Some(name) => Some(
            TaskState::from_str(name)
                .ok_or_else(|| CoreError::Validation(format!("unknown state: {}", name)))?,
        ),
        None => None,
    };
    for task in manager.list(state) {
        let name = task
            .params
            .as_download()
            .map(|params| params.filename.clone())
            .unwrap_or_default();
        println!(
            "{}\t{}\t{}\t{:.1}%\t{}",
            task.id,
            task.kind(),
            task.status,
            task.progress,
            name
        );
    }
    Ok(())
}

fn scan(manager: &TaskManager, folder: &str) -> Result<(), CoreError> {
    let records = manager
        .scan_cache()
        .scan_now(folder, None, &TaskControl::new(), &mut |done, total| {
            if total > 0 && (done == total || done % 50 == 0) {
                eprintln!("hashed {}/{}", done, total);
            }
        })?;
    for record in &records {
        println!(
            "{}\t{}\t{}",
            &record.hash[..record.hash.len().min(12)],
            format_bytes(record.size),
            record.path
        );
    }
    println!("{} models in {}", records.len(), folder);
    Ok(())
}

/// Prints the cached snapshot as JSON, waiting for a rescan if it is stale.
fn cached_scan(manager: &TaskManager, folder: &str) -> Result<(), CoreError> {
    let scan = manager.scan_cache();
    let mut snapshot = scan.request(folder)?;
    if snapshot.is_scanning && scan.wait_for_scans(manager.config().settle_timeout * 12) {
        snapshot = scan.request(folder)?;
    }
    println!(
        "{}",
        serde_json::to_string_pretty(&snapshot.to_json()).unwrap_or_default()
    );
    Ok(())
}

fn with_id<F>(args: &[String], idx: usize, f: F) -> Result<(), CoreError>
where
    F: FnOnce(&TaskId) -> Result<(), CoreError>,
{
    let id = match args.get(idx) {
        Some(value) => value,
        None => {
            print_usage();
            return Ok(());
        }
    };
    let task_id = TaskId::parse_str(id)
        .map_err(|_| CoreError::Validation(format!("invalid task id: {}", id)))?;
    f(&task_id)
}

fn print_usage() {
    eprintln!(
        "Usage: modelhub <command> [args]\n\
Commands:\n\
  download <url> <type> <filename> [options]\n\
      --size-kb N        Expected size hint\n\
      --platform P       civitai or huggingface\n\
      --path-index N     Root index within the category\n\
      --sha256 HASH      Verify the finished file\n\
  list [state]           List tasks, newest first\n\
  status <id>            Show transfer status\n\
  pause <id>             Pause a download\n\
  resume <id>            Resume a paused or failed download and wait\n\
  cancel <id>            Cancel a task\n\
  delete <id>            Delete a task and its partial file\n\
  scan <folder>          Scan a model category\n\
  scan <folder> --cached Print the cached scan as JSON\n\
  info <diff|full> [p]   Fetch Civitai information for models\n\
  metadata <path>        Refresh a model's sidecar\n\
  set-key <platform> [k] Store or clear an API key\n\
  keys                   Show masked API keys\n\
Environment:\n\
  MODELHUB_HOME          Data directory (default .modelhub)\n\
  MODELHUB_MODELS_DIR    Model root (default models)\n\
  RUST_LOG               Log filter (default warn)"
    );
}

fn spawn_progress(events: Receiver<Event>, id: TaskId) -> (thread::JoinHandle<()>, Arc<AtomicBool>) {
    let stop = Arc::new(AtomicBool::new(false));
    let stop_clone = Arc::clone(&stop);
    let wanted = id.to_string();
    let handle = thread::spawn(move || {
        let mut last_bucket: Option<u64> = None;
        while !stop_clone.load(Ordering::SeqCst) {
            let event = match events.recv_timeout(Duration::from_millis(200)) {
                Ok(event) => event,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            };
            if event.kind != EventKind::UpdateDownloadTask || event.data["taskId"] != wanted.as_str() {
                continue;
            }
            let detail = &event.data["status_detail"];
            let (Some(downloaded), Some(total)) = (
                detail["downloadedSize"].as_u64(),
                detail["totalSize"].as_u64(),
            ) else {
                continue;
            };
            // One line per percent is plenty for a terminal.
            let bucket = if total > 0 { downloaded * 100 / total } else { downloaded >> 20 };
            if last_bucket == Some(bucket) {
                continue;
            }
            last_bucket = Some(bucket);
            let speed = detail["bps"].as_f64().unwrap_or(0.0) as u64;
            let percent = if total > 0 {
                format!("{:.1}%", downloaded as f64 / total as f64 * 100.0)
            } else {
                "--".to_string()
            };
            let eta = if total > 0 && speed > 0 {
                format_duration(total.saturating_sub(downloaded) / speed)
            } else {
                "--:--".to_string()
            };
            println!(
                "[{}] {} {}/{} ({}/s) eta {}",
                &wanted[..8],
                percent,
                format_bytes(downloaded),
                if total > 0 { format_bytes(total) } else { "?".to_string() },
                format_bytes(speed),
                eta
            );
        }
    });
    (handle, stop)
}

fn format_bytes(bytes: u64) -> String {
    const KB: f64 = 1024.0;
    const MB: f64 = KB * 1024.0;
    const GB: f64 = MB * 1024.0;
    let b = bytes as f64;
    if b >= GB {
        format!("{:.2}GB", b / GB)
    } else if b >= MB {
        format!("{:.2}MB", b / MB)
    } else if b >= KB {
        format!("{:.2}KB", b / KB)
    } else {
        format!("{}B", bytes)
    }
}

fn format_duration(mut seconds: u64) -> String {
    let hours = seconds / 3600;
    seconds %= 3600;
    let minutes = seconds / 60;
    let secs = seconds % 60;
    if hours > 0 {
        format!("{:02}:{:02}:{:02}", hours, minutes, secs)
    } else {
        format!("{:02}:{:02}", minutes, secs)
    }
}

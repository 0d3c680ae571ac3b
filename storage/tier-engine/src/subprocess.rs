//! Worker subprocess entry point.
//!
//! Commands arrive as JSON lines on stdin; responses leave as JSON lines on
//! stdout. A dispatcher routes slow `check_tier` jobs and urgent move/delete
//! jobs into separate queues: mixed workers prefer the urgent queue and one
//! dedicated worker drains only the urgent queue, so file operations are
//! never stuck behind a long tier scan. Stdin EOF is the shutdown signal.

use std::io::{BufRead, Write};
use std::path::Path;
use std::sync::Arc;

use argus_db::Database;
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender, TryRecvError};
use tracing::{debug, error, info};

use crate::proto::{Command, Response};
use crate::worker::TierWorker;

/// Drop scheduling priority and optionally start `cpulimit` against our own
/// pid so tier scans do not compete with decoding.
fn limit_resources(cpulimit: Option<u32>) {
    #[cfg(unix)]
    unsafe {
        libc::nice(20);
    }
    if let Some(percent) = cpulimit {
        let pid = std::process::id();
        match std::process::Command::new("cpulimit")
            .args(["-l", &percent.to_string(), "-p", &pid.to_string(), "-z", "-q"])
            .spawn()
        {
            Ok(_) => debug!("cpulimit attached at {percent}%"),
            Err(error) => error!("could not start cpulimit: {error}"),
        }
    }
}

fn worker_loop(
    worker: Arc<TierWorker>,
    check_rx: Option<Receiver<Command>>,
    file_rx: Receiver<Command>,
    out_tx: Sender<Response>,
) {
    loop {
        // Urgent queue first.
        match file_rx.try_recv() {
            Ok(command) => {
                let response = worker.handle(&command, chrono::Utc::now().timestamp());
                let _ = out_tx.send(response);
                continue;
            }
            Err(TryRecvError::Empty) => {}
            Err(TryRecvError::Disconnected) => {
                if check_rx.is_none() {
                    return;
                }
            }
        }
        match &check_rx {
            Some(check) => match check.recv_timeout(std::time::Duration::from_secs(1)) {
                Ok(command) => {
                    let response = worker.handle(&command, chrono::Utc::now().timestamp());
                    let _ = out_tx.send(response);
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => return,
            },
            None => {
                // Dedicated file worker: block on the urgent queue alone.
                match file_rx.recv_timeout(std::time::Duration::from_secs(1)) {
                    Ok(command) => {
                        let response = worker.handle(&command, chrono::Utc::now().timestamp());
                        let _ = out_tx.send(response);
                    }
                    Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => return,
                }
            }
        }
    }
}

/// Run the storage worker until stdin closes.
pub fn run_worker(db_path: &Path, workers: usize, cpulimit: Option<u32>) -> eyre::Result<()> {
    limit_resources(cpulimit);

    let db = Arc::new(Database::open(db_path)?);
    let worker = Arc::new(TierWorker::new(db));

    let (check_tx, check_rx) = unbounded::<Command>();
    let (file_tx, file_rx) = unbounded::<Command>();
    let (out_tx, out_rx) = unbounded::<Response>();

    let mut handles = Vec::new();

    let output = std::thread::Builder::new()
        .name("storage-output".into())
        .spawn(move || {
            let stdout = std::io::stdout();
            for response in out_rx {
                let Ok(line) = serde_json::to_string(&response) else {
                    continue;
                };
                let mut locked = stdout.lock();
                if writeln!(locked, "{line}").and_then(|()| locked.flush()).is_err() {
                    return;
                }
            }
        })?;

    info!("starting {workers} mixed storage workers and one file worker");
    for i in 0..workers {
        let worker = worker.clone();
        let check_rx = check_rx.clone();
        let file_rx = file_rx.clone();
        let out_tx = out_tx.clone();
        handles.push(
            std::thread::Builder::new()
                .name(format!("storage-mixed-{i}"))
                .spawn(move || worker_loop(worker, Some(check_rx), file_rx, out_tx))?,
        );
    }
    {
        let worker = worker.clone();
        let file_rx = file_rx.clone();
        let out_tx = out_tx.clone();
        handles.push(
            std::thread::Builder::new()
                .name("storage-file-worker".into())
                .spawn(move || worker_loop(worker, None, file_rx, out_tx))?,
        );
    }
    drop(out_tx);
    drop(check_rx);
    drop(file_rx);

    // Dispatcher on the main thread: route until EOF.
    let stdin = std::io::stdin();
    for line in stdin.lock().lines() {
        let line = match line {
            Ok(line) => line,
            Err(error) => {
                error!("stdin read failed: {error}");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<Command>(&line) {
            Ok(command @ Command::CheckTier(_)) => {
                let _ = check_tx.send(command);
            }
            Ok(command) => {
                let _ = file_tx.send(command);
            }
            Err(error) => error!("discarding malformed command: {error}"),
        }
    }

    info!("stdin closed; draining storage workers");
    drop(check_tx);
    drop(file_tx);
    for handle in handles {
        let _ = handle.join();
    }
    let _ = output.join();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::{BudgetParams, CheckTierCommand};

    fn check(id: u64) -> Command {
        Command::CheckTier(CheckTierCommand {
            id,
            camera_identifier: "cam_1".into(),
            tier_id: 0,
            category: "recorder".into(),
            subcategories: vec!["segments".into()],
            throttle_period_secs: 0,
            files: Some(BudgetParams {
                max_bytes: 1,
                min_bytes: 0,
                max_age_secs: None,
                min_age_secs: None,
            }),
            events: None,
        })
    }

    #[test]
    fn workers_drain_both_queues_and_exit_on_disconnect() {
        let worker = Arc::new(TierWorker::new(Arc::new(Database::memory().unwrap())));
        let (check_tx, check_rx) = unbounded::<Command>();
        let (file_tx, file_rx) = unbounded::<Command>();
        let (out_tx, out_rx) = unbounded::<Response>();

        let mut handles = Vec::new();
        for _ in 0..2 {
            let worker = worker.clone();
            let check_rx = check_rx.clone();
            let file_rx = file_rx.clone();
            let out_tx = out_tx.clone();
            handles.push(std::thread::spawn(move || {
                worker_loop(worker, Some(check_rx), file_rx, out_tx)
            }));
        }
        drop(out_tx);
        drop(check_rx);
        drop(file_rx);

        check_tx.send(check(1)).unwrap();
        file_tx
            .send(Command::DeleteFile {
                id: 2,
                src: "/nonexistent/x.m4s".into(),
            })
            .unwrap();
        drop(check_tx);
        drop(file_tx);

        let mut ids: Vec<u64> = out_rx.iter().map(|r| r.id).collect();
        ids.sort_unstable();
        assert_eq!(ids, vec![1, 2]);
        for handle in handles {
            handle.join().unwrap();
        }
    }
}

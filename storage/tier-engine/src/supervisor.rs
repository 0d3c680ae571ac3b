//! Supervision of the storage worker subprocess from the main process.
//!
//! One writer thread serialises commands into the child's stdin; the
//! supervisor thread reads responses off its stdout and routes them to the
//! registered callbacks by id. A dead child fails all pending callbacks and
//! is relaunched after a pause. Closing stdin is the shutdown signal.

use std::collections::HashMap;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, Command as ProcessCommand, Stdio};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{unbounded, Sender};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::proto::{BudgetParams, CheckTierCommand, Command, Response};

const RESTART_PAUSE: Duration = Duration::from_secs(5);

pub type ResponseCallback = Box<dyn FnOnce(Response) + Send>;

#[derive(Debug, Clone)]
pub struct StorageWorkerConfig {
    pub database_path: PathBuf,
    pub workers: usize,
    pub cpulimit: Option<u32>,
    /// Executable hosting the `storage-worker` subcommand; defaults to the
    /// current executable.
    pub program: Option<PathBuf>,
    /// Arguments placed before the generated ones. Tests use this to stand
    /// in a scripted child.
    pub program_args: Vec<String>,
}

impl StorageWorkerConfig {
    pub fn new(database_path: PathBuf, workers: usize, cpulimit: Option<u32>) -> Self {
        StorageWorkerConfig {
            database_path,
            workers,
            cpulimit,
            program: None,
            program_args: Vec::new(),
        }
    }
}

struct SupervisorInner {
    next_id: AtomicU64,
    callbacks: Mutex<HashMap<u64, ResponseCallback>>,
    stdin: Mutex<Option<ChildStdin>>,
    stop: AtomicBool,
}

impl SupervisorInner {
    fn fail_callback(&self, id: u64, message: &str) {
        if let Some(callback) = self.callbacks.lock().remove(&id) {
            callback(Response {
                id,
                files_to_move: Vec::new(),
                error: Some(message.to_string()),
            });
        }
    }

    fn fail_all(&self, message: &str) {
        let pending = std::mem::take(&mut *self.callbacks.lock());
        for (id, callback) in pending {
            callback(Response {
                id,
                files_to_move: Vec::new(),
                error: Some(message.to_string()),
            });
        }
    }
}

pub struct StorageWorker {
    inner: Arc<SupervisorInner>,
    cmd_tx: Mutex<Option<Sender<Command>>>,
    threads: Mutex<Vec<std::thread::JoinHandle<()>>>,
}

fn spawn_child(config: &StorageWorkerConfig) -> std::io::Result<Child> {
    let program = match &config.program {
        Some(program) => program.clone(),
        None => std::env::current_exe()?,
    };
    let mut command = ProcessCommand::new(program);
    command.args(&config.program_args);
    if config.program.is_none() {
        command
            .arg("storage-worker")
            .arg("--database")
            .arg(&config.database_path)
            .arg("--workers")
            .arg(config.workers.to_string());
        if let Some(percent) = config.cpulimit {
            command.arg("--cpulimit").arg(percent.to_string());
        }
    }
    command
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .spawn()
}

impl StorageWorker {
    /// Spawn the worker subprocess. Failure to spawn the initial child is
    /// fatal to startup.
    pub fn spawn(config: StorageWorkerConfig) -> eyre::Result<Self> {
        let mut child = spawn_child(&config)
            .map_err(|e| eyre::eyre!("could not spawn storage worker: {e}"))?;
        let stdin = child.stdin.take().expect("piped stdin");
        let stdout = child.stdout.take().expect("piped stdout");

        let inner = Arc::new(SupervisorInner {
            next_id: AtomicU64::new(1),
            callbacks: Mutex::new(HashMap::new()),
            stdin: Mutex::new(Some(stdin)),
            stop: AtomicBool::new(false),
        });

        let (cmd_tx, cmd_rx) = unbounded::<Command>();

        let writer_inner = inner.clone();
        let writer = std::thread::Builder::new()
            .name("storage-writer".into())
            .spawn(move || {
                for command in cmd_rx {
                    let id = command.id();
                    let Ok(line) = serde_json::to_string(&command) else {
                        writer_inner.fail_callback(id, "could not encode command");
                        continue;
                    };
                    let mut guard = writer_inner.stdin.lock();
                    match guard.as_mut() {
                        Some(stdin) => {
                            if writeln!(stdin, "{line}").and_then(|()| stdin.flush()).is_err() {
                                *guard = None;
                                drop(guard);
                                writer_inner.fail_callback(id, "storage worker unavailable");
                            }
                        }
                        None => {
                            drop(guard);
                            writer_inner.fail_callback(id, "storage worker unavailable");
                        }
                    }
                }
            })?;

        let reader_inner = inner.clone();
        let reader = std::thread::Builder::new()
            .name("storage-supervisor".into())
            .spawn(move || {
                let mut current: Option<(Child, BufReader<std::process::ChildStdout>)> =
                    Some((child, BufReader::new(stdout)));
                loop {
                    let Some((mut child, stdout)) = current.take() else {
                        // Child gone; try to bring a new one up.
                        if reader_inner.stop.load(Ordering::SeqCst) {
                            return;
                        }
                        std::thread::sleep(RESTART_PAUSE);
                        if reader_inner.stop.load(Ordering::SeqCst) {
                            return;
                        }
                        match spawn_child(&config) {
                            Ok(mut child) => {
                                info!("storage worker restarted");
                                let stdin = child.stdin.take().expect("piped stdin");
                                let stdout = child.stdout.take().expect("piped stdout");
                                *reader_inner.stdin.lock() = Some(stdin);
                                current = Some((child, BufReader::new(stdout)));
                            }
                            Err(e) => error!("storage worker respawn failed: {e}"),
                        }
                        continue;
                    };

                    for line in stdout.lines() {
                        let Ok(line) = line else { break };
                        match serde_json::from_str::<Response>(&line) {
                            Ok(response) => {
                                debug!("storage worker response for id {}", response.id);
                                let callback =
                                    reader_inner.callbacks.lock().remove(&response.id);
                                match callback {
                                    Some(callback) => callback(response),
                                    None => warn!(
                                        "no callback for storage response id {}",
                                        response.id
                                    ),
                                }
                            }
                            Err(e) => warn!("discarding malformed storage response: {e}"),
                        }
                    }

                    // EOF: the child exited (or we are shutting down).
                    *reader_inner.stdin.lock() = None;
                    let _ = child.wait();
                    if reader_inner.stop.load(Ordering::SeqCst) {
                        reader_inner.fail_all("storage worker stopped");
                        return;
                    }
                    warn!("storage worker exited; pending commands failed");
                    reader_inner.fail_all("storage worker crashed");
                }
            })?;

        Ok(StorageWorker {
            inner,
            cmd_tx: Mutex::new(Some(cmd_tx)),
            threads: Mutex::new(vec![writer, reader]),
        })
    }

    fn send(&self, build: impl FnOnce(u64) -> Command, callback: ResponseCallback) {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.callbacks.lock().insert(id, callback);
        let sent = match self.cmd_tx.lock().as_ref() {
            Some(tx) => tx.send(build(id)).is_ok(),
            None => false,
        };
        if !sent {
            self.inner.fail_callback(id, "storage worker stopped");
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn check_tier(
        &self,
        camera_identifier: &str,
        tier_id: i64,
        category: &str,
        subcategories: Vec<String>,
        throttle_period_secs: i64,
        files: Option<BudgetParams>,
        events: Option<BudgetParams>,
        callback: ResponseCallback,
    ) {
        let camera_identifier = camera_identifier.to_string();
        let category = category.to_string();
        self.send(
            move |id| {
                Command::CheckTier(CheckTierCommand {
                    id,
                    camera_identifier,
                    tier_id,
                    category,
                    subcategories,
                    throttle_period_secs,
                    files,
                    events,
                })
            },
            callback,
        );
    }

    pub fn move_file(&self, src: &str, dst: &str, callback: ResponseCallback) {
        let (src, dst) = (src.to_string(), dst.to_string());
        self.send(move |id| Command::MoveFile { id, src, dst }, callback);
    }

    pub fn delete_file(&self, src: &str, callback: ResponseCallback) {
        let src = src.to_string();
        self.send(move |id| Command::DeleteFile { id, src }, callback);
    }

    /// Close the child's stdin and wait for the supervision threads. The
    /// worker exits on EOF.
    pub fn shutdown(&self) {
        self.inner.stop.store(true, Ordering::SeqCst);
        *self.cmd_tx.lock() = None;
        *self.inner.stdin.lock() = None;
        for handle in self.threads.lock().drain(..) {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::bounded;

    /// Scripted child: for every input line, emit one canned response with
    /// the matching id (ids are assigned sequentially from 1).
    fn scripted_config() -> StorageWorkerConfig {
        StorageWorkerConfig {
            database_path: PathBuf::from("/unused"),
            workers: 1,
            cpulimit: None,
            program: Some(PathBuf::from("sh")),
            program_args: vec![
                "-c".to_string(),
                "i=1; while read -r line; do echo \"{\\\"id\\\": $i}\"; i=$((i+1)); done"
                    .to_string(),
            ],
        }
    }

    #[test]
    fn responses_route_to_callbacks_by_id() {
        let worker = StorageWorker::spawn(scripted_config()).unwrap();
        let (tx, rx) = bounded(2);
        for _ in 0..2 {
            let tx = tx.clone();
            worker.delete_file(
                "/tmp/x.m4s",
                Box::new(move |response: Response| {
                    let _ = tx.send(response.id);
                }),
            );
        }
        let mut ids = vec![
            rx.recv_timeout(Duration::from_secs(5)).unwrap(),
            rx.recv_timeout(Duration::from_secs(5)).unwrap(),
        ];
        ids.sort_unstable();
        assert_eq!(ids, vec![1, 2]);
        worker.shutdown();
    }

    #[test]
    fn shutdown_fails_pending_callbacks() {
        // Child that swallows input and never answers.
        let mut config = scripted_config();
        config.program_args = vec!["-c".to_string(), "cat > /dev/null".to_string()];
        let worker = StorageWorker::spawn(config).unwrap();
        let (tx, rx) = bounded(1);
        worker.delete_file(
            "/tmp/x.m4s",
            Box::new(move |response: Response| {
                let _ = tx.send(response.error);
            }),
        );
        std::thread::sleep(Duration::from_millis(100));
        worker.shutdown();
        let error = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(error.is_some());
    }
}

//! The running analytics program, as seen by the supervisor.

use super::error::ProcessResult;
use crate::config::types::JobConfig;
use async_trait::async_trait;
use std::io;
use tempfile::TempPath;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::Child;

/// Exit status access for a child process.
#[async_trait]
pub trait ChildControl: Send {
    fn id(&self) -> Option<u32>;

    /// `Ok(None)` while the process is still running.
    fn try_exit_code(&mut self) -> io::Result<Option<i32>>;

    async fn wait(&mut self) -> io::Result<i32>;

    async fn kill(&mut self) -> io::Result<()>;
}

/// Termination by signal has no exit code.
const SIGNALLED_EXIT_CODE: i32 = -1;

#[async_trait]
impl ChildControl for Child {
    fn id(&self) -> Option<u32> {
        Child::id(self)
    }

    fn try_exit_code(&mut self) -> io::Result<Option<i32>> {
        Ok(self
            .try_wait()?
            .map(|status| status.code().unwrap_or(SIGNALLED_EXIT_CODE)))
    }

    async fn wait(&mut self) -> io::Result<i32> {
        let status = Child::wait(self).await?;
        Ok(status.code().unwrap_or(SIGNALLED_EXIT_CODE))
    }

    async fn kill(&mut self) -> io::Result<()> {
        Child::kill(self).await
    }
}

/// A started analytics process with its pipes separated out.
pub struct NativeProcess {
    pub stdin: Box<dyn AsyncWrite + Unpin + Send>,
    pub stdout: Box<dyn AsyncRead + Unpin + Send>,
    pub stderr: Box<dyn AsyncRead + Unpin + Send>,
    pub control: Box<dyn ChildControl>,
    /// Generated configuration files, removed when the job is torn down.
    pub files_to_delete: Vec<TempPath>,
}

impl NativeProcess {
    /// Take the pipes of a child spawned with piped stdio.
    pub fn from_child(mut child: Child, files_to_delete: Vec<TempPath>) -> io::Result<Self> {
        let (Some(stdin), Some(stdout), Some(stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "child process was started without piped stdio",
            ));
        };

        Ok(Self {
            stdin: Box::new(stdin),
            stdout: Box::new(stdout),
            stderr: Box::new(stderr),
            control: Box::new(child),
            files_to_delete,
        })
    }
}

/// Starts analytics processes.
#[async_trait]
pub trait ProcessFactory: Send + Sync {
    async fn create(&self, job_id: &str, job: &JobConfig) -> ProcessResult<NativeProcess>;
}

/// In-memory analytics process for supervisor tests.
///
/// It decodes records from its stdin, answers every flush with a
/// `{"flush":"<id>"}` document and exits once stdin is closed.
#[cfg(test)]
pub(crate) mod fake {
    use super::*;
    use crate::wire::length_encoded::read_record;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use tokio::io::{duplex, AsyncWriteExt, DuplexStream};
    use tokio::sync::watch;
    use tokio::task::JoinHandle;

    const PIPE_CAPACITY: usize = 64 * 1024;

    pub struct FakeProcessFactory {
        pub launches: AtomicUsize,
        pub records: Arc<Mutex<Vec<Vec<String>>>>,
        exit_code: i32,
        stderr_on_exit: String,
        ack_flushes: bool,
        temp_dir: Option<PathBuf>,
        crash: watch::Sender<bool>,
        exits: Arc<watch::Sender<usize>>,
    }

    impl FakeProcessFactory {
        pub fn new() -> Self {
            Self {
                launches: AtomicUsize::new(0),
                records: Arc::new(Mutex::new(Vec::new())),
                exit_code: 0,
                stderr_on_exit: String::new(),
                ack_flushes: true,
                temp_dir: None,
                crash: watch::channel(false).0,
                exits: Arc::new(watch::channel(0).0),
            }
        }

        pub fn exiting_with(mut self, code: i32, stderr: &str) -> Self {
            self.exit_code = code;
            self.stderr_on_exit = stderr.to_string();
            self
        }

        pub fn without_flush_acks(mut self) -> Self {
            self.ack_flushes = false;
            self
        }

        /// Give every launched process a generated file inside `dir`.
        pub fn with_temp_files_in(mut self, dir: PathBuf) -> Self {
            self.temp_dir = Some(dir);
            self
        }

        pub fn launch_count(&self) -> usize {
            self.launches.load(Ordering::SeqCst)
        }

        pub fn records(&self) -> Vec<Vec<String>> {
            self.records.lock().unwrap().clone()
        }

        /// Make every running fake exit with code 1.
        pub fn crash(&self) {
            self.crash.send_replace(true);
        }

        pub async fn wait_for_exits(&self, count: usize) {
            let mut exits = self.exits.subscribe();
            let _ = exits.wait_for(|n| *n >= count).await;
        }
    }

    struct Behaviour {
        exit_code: i32,
        stderr_on_exit: String,
        ack_flushes: bool,
    }

    #[async_trait]
    impl ProcessFactory for FakeProcessFactory {
        async fn create(&self, _job_id: &str, _job: &JobConfig) -> ProcessResult<NativeProcess> {
            self.launches.fetch_add(1, Ordering::SeqCst);

            let (stdin, child_stdin) = duplex(PIPE_CAPACITY);
            let (child_stdout, stdout) = duplex(PIPE_CAPACITY);
            let (child_stderr, stderr) = duplex(PIPE_CAPACITY);

            let behaviour = Behaviour {
                exit_code: self.exit_code,
                stderr_on_exit: self.stderr_on_exit.clone(),
                ack_flushes: self.ack_flushes,
            };
            let records = Arc::clone(&self.records);
            let crash = self.crash.subscribe();
            let exits = Arc::clone(&self.exits);
            let (exit_tx, exit_rx) = watch::channel(None);

            let task = tokio::spawn(async move {
                let code = run_child(
                    child_stdin,
                    child_stdout,
                    child_stderr,
                    behaviour,
                    records,
                    crash,
                )
                .await;
                exit_tx.send_replace(Some(code));
                exits.send_modify(|n| *n += 1);
            });

            let files_to_delete = match &self.temp_dir {
                Some(dir) => vec![tempfile::Builder::new()
                    .prefix("fake")
                    .suffix(".conf")
                    .tempfile_in(dir)
                    .unwrap()
                    .into_temp_path()],
                None => Vec::new(),
            };

            Ok(NativeProcess {
                stdin: Box::new(stdin),
                stdout: Box::new(stdout),
                stderr: Box::new(stderr),
                control: Box::new(FakeControl {
                    exit: exit_rx,
                    task,
                    killed: false,
                }),
                files_to_delete,
            })
        }
    }

    async fn run_child(
        mut stdin: DuplexStream,
        mut stdout: DuplexStream,
        mut stderr: DuplexStream,
        behaviour: Behaviour,
        records: Arc<Mutex<Vec<Vec<String>>>>,
        mut crash: watch::Receiver<bool>,
    ) -> i32 {
        let mut crash_open = true;
        loop {
            tokio::select! {
                record = read_record(&mut stdin) => match record {
                    Ok(Some(record)) => {
                        let flush_id = record
                            .last()
                            .and_then(|control| control.strip_prefix('f'))
                            .map(str::to_string);
                        records.lock().unwrap().push(record);
                        if let (Some(id), true) = (flush_id, behaviour.ack_flushes) {
                            let ack = format!("{{\"flush\":\"{id}\"}}\n");
                            if stdout.write_all(ack.as_bytes()).await.is_err() {
                                return 2;
                            }
                        }
                    }
                    Ok(None) => {
                        let _ = stderr.write_all(behaviour.stderr_on_exit.as_bytes()).await;
                        return behaviour.exit_code;
                    }
                    Err(_) => return 2,
                },
                changed = crash.changed(), if crash_open => {
                    if changed.is_err() {
                        crash_open = false;
                    } else if *crash.borrow() {
                        let _ = stderr.write_all(b"fatal: simulated crash\n").await;
                        return 1;
                    }
                }
            }
        }
    }

    struct FakeControl {
        exit: watch::Receiver<Option<i32>>,
        task: JoinHandle<()>,
        killed: bool,
    }

    const KILLED_EXIT_CODE: i32 = -9;

    #[async_trait]
    impl ChildControl for FakeControl {
        fn id(&self) -> Option<u32> {
            None
        }

        fn try_exit_code(&mut self) -> io::Result<Option<i32>> {
            if self.killed {
                return Ok(Some(KILLED_EXIT_CODE));
            }
            Ok(*self.exit.borrow())
        }

        async fn wait(&mut self) -> io::Result<i32> {
            if self.killed {
                return Ok(KILLED_EXIT_CODE);
            }
            let code = match self.exit.wait_for(|code| code.is_some()).await {
                Ok(code) => code.unwrap_or(KILLED_EXIT_CODE),
                Err(_) => KILLED_EXIT_CODE,
            };
            Ok(code)
        }

        async fn kill(&mut self) -> io::Result<()> {
            self.task.abort();
            self.killed = true;
            Ok(())
        }
    }
}

//! Owns the analytics processes: one per job, started on demand, stopped
//! when idle, on request, or at shutdown.

use super::error::{ProcessError, ProcessResult};
use super::jobs::{JobProvider, JobStatus};
use super::native::{ChildControl, ProcessFactory};
use super::results::{
    spawn_results_reader, FlushAcknowledgements, FlushWait, LoggingResultSink, ResultSink,
};
use super::stderr::StderrBuffer;
use crate::config::types::{JobConfig, SupervisorSettings};
use crate::ingest::persist::{DataPersisterFactory, NoneDataPersister};
use crate::ingest::status::DataCounts;
use crate::ingest::{write_header_once, write_to_process, IngestProgress, RecordLayout, WriteError};
use crate::wire::{
    ControlMessage, ControlMsgWriter, FlushId, FlushIdGenerator, LengthEncodedWriter, RecordWriter,
    TimeRange,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};
use tempfile::TempPath;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufWriter};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// How long teardown waits for the output readers after the process has exited.
const READER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

type ProcessWriter = LengthEncodedWriter<BufWriter<Box<dyn AsyncWrite + Unpin + Send>>>;

/// Everything owned on behalf of one running analytics process.
struct ProcessHandle {
    job: JobConfig,
    writer: ProcessWriter,
    control: Box<dyn ChildControl>,
    stderr: StderrBuffer,
    results: JoinHandle<usize>,
    acks: FlushAcknowledgements,
    progress: IngestProgress,
    header: Vec<String>,
    files: Vec<TempPath>,
    started: Instant,
}

impl ProcessHandle {
    fn num_analysis_fields(&self) -> usize {
        self.header.len().saturating_sub(2)
    }

    /// `Some(reason)` when the process is no longer running.
    fn exited(&mut self) -> Option<String> {
        match self.control.try_exit_code() {
            Ok(None) => None,
            Ok(Some(code)) => Some(format!(
                "analytics process exited unexpectedly with code {code}"
            )),
            Err(e) => {
                warn!(error = %e, "cannot determine analytics process status");
                None
            }
        }
    }

    async fn write_control(&mut self, message: &ControlMessage) -> std::io::Result<()> {
        write_header_once(&mut self.writer, &mut self.progress, &self.header).await?;
        let num_fields = self.num_analysis_fields();
        ControlMsgWriter::new(&mut self.writer, num_fields)
            .write_message(message)
            .await?;
        self.writer.flush().await
    }

    async fn write_flush(
        &mut self,
        ids: &FlushIdGenerator,
        interim: Option<TimeRange>,
    ) -> std::io::Result<FlushId> {
        write_header_once(&mut self.writer, &mut self.progress, &self.header).await?;
        let num_fields = self.num_analysis_fields();
        let mut control = ControlMsgWriter::new(&mut self.writer, num_fields);
        if let Some(range) = interim {
            control.write_calc_interim(range).await?;
        }
        control.write_flush(ids).await
    }

    /// Close stdin and wait for the process to finish on its own.
    async fn close(mut self, job_id: &str) -> Result<(), String> {
        if let Some(reason) = self.exited() {
            return Err(self.kill(job_id, reason).await);
        }
        let ProcessHandle {
            writer,
            mut control,
            stderr,
            results,
            files,
            started,
            ..
        } = self;

        let mut stdin = writer.into_inner();
        if let Err(e) = stdin.shutdown().await {
            warn!(job_id, error = %e, "error closing analytics process input");
        }
        drop(stdin);

        let code = match control.wait().await {
            Ok(code) => code,
            Err(e) => {
                warn!(job_id, error = %e, "failed waiting for analytics process");
                -1
            }
        };

        delete_files(job_id, files);
        let stderr = join_readers(job_id, results, stderr).await;

        if code == 0 {
            info!(job_id, uptime_secs = started.elapsed().as_secs(), "analytics process exited");
            Ok(())
        } else {
            Err(with_stderr(format!("analytics process exited with code {code}"), &stderr))
        }
    }

    /// Tear the process down after a failure. Returns the failure report.
    async fn kill(self, job_id: &str, reason: String) -> String {
        let ProcessHandle {
            writer,
            mut control,
            stderr,
            results,
            files,
            ..
        } = self;
        drop(writer);

        if let Err(e) = control.kill().await {
            debug!(job_id, error = %e, "kill failed, process has probably exited");
        }
        delete_files(job_id, files);
        let stderr = join_readers(job_id, results, stderr).await;
        with_stderr(reason, &stderr)
    }
}

fn delete_files(job_id: &str, files: Vec<TempPath>) {
    for file in files {
        let path = file.to_path_buf();
        if let Err(e) = file.close() {
            warn!(job_id, path = %path.display(), error = %e, "failed to delete temporary file");
        }
    }
}

async fn join_readers(
    job_id: &str,
    mut results: JoinHandle<usize>,
    stderr: StderrBuffer,
) -> String {
    match tokio::time::timeout(READER_DRAIN_TIMEOUT, &mut results).await {
        Ok(Ok(count)) => debug!(job_id, results = count, "result reader finished"),
        Ok(Err(e)) => warn!(job_id, error = %e, "result reader failed"),
        Err(_) => {
            warn!(job_id, "result reader did not finish, aborting it");
            results.abort();
        }
    }
    stderr.drain(READER_DRAIN_TIMEOUT).await
}

fn with_stderr(reason: String, stderr: &str) -> String {
    if stderr.is_empty() {
        reason
    } else {
        format!("{reason}\n{stderr}")
    }
}

enum SlotState {
    Absent,
    Running(Box<ProcessHandle>),
    /// The slot has left the job map; whoever locks it must look the job up again.
    Retired,
}

type Slot = Arc<Mutex<SlotState>>;

struct TimeoutEntry {
    id: u64,
    task: JoinHandle<()>,
}

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct ProcessManagerBuilder {
    factory: Arc<dyn ProcessFactory>,
    jobs: Arc<dyn JobProvider>,
    settings: SupervisorSettings,
    persisters: Arc<dyn DataPersisterFactory>,
    results: Arc<dyn ResultSink>,
    flush_ids: Arc<FlushIdGenerator>,
}

impl ProcessManagerBuilder {
    pub fn settings(mut self, settings: SupervisorSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn persisters(mut self, persisters: Arc<dyn DataPersisterFactory>) -> Self {
        self.persisters = persisters;
        self
    }

    pub fn result_sink(mut self, results: Arc<dyn ResultSink>) -> Self {
        self.results = results;
        self
    }

    /// Flush ids are unique per generator; share one to keep them unique across managers.
    pub fn flush_ids(mut self, flush_ids: Arc<FlushIdGenerator>) -> Self {
        self.flush_ids = flush_ids;
        self
    }

    pub fn build(self) -> Arc<ProcessManager> {
        Arc::new_cyclic(|this| ProcessManager {
            this: this.clone(),
            factory: self.factory,
            jobs: self.jobs,
            settings: self.settings,
            persisters: self.persisters,
            results: self.results,
            flush_ids: self.flush_ids,
            slots: StdMutex::new(HashMap::new()),
            timeouts: StdMutex::new(HashMap::new()),
            accepting_timeouts: AtomicBool::new(true),
            next_timeout_id: AtomicU64::new(1),
        })
    }
}

/// Runs at most one analytics process per job.
///
/// Every operation on a job takes that job's guard without waiting; a
/// concurrent operation on the same job fails with [`ProcessError::JobInUse`].
/// Different jobs never block each other.
pub struct ProcessManager {
    this: Weak<ProcessManager>,
    factory: Arc<dyn ProcessFactory>,
    jobs: Arc<dyn JobProvider>,
    settings: SupervisorSettings,
    persisters: Arc<dyn DataPersisterFactory>,
    results: Arc<dyn ResultSink>,
    flush_ids: Arc<FlushIdGenerator>,
    slots: StdMutex<HashMap<String, Slot>>,
    timeouts: StdMutex<HashMap<String, TimeoutEntry>>,
    accepting_timeouts: AtomicBool,
    next_timeout_id: AtomicU64,
}

impl ProcessManager {
    pub fn builder(
        factory: Arc<dyn ProcessFactory>,
        jobs: Arc<dyn JobProvider>,
    ) -> ProcessManagerBuilder {
        ProcessManagerBuilder {
            factory,
            jobs,
            settings: SupervisorSettings::default(),
            persisters: Arc::new(NoneDataPersister),
            results: Arc::new(LoggingResultSink),
            flush_ids: Arc::new(FlushIdGenerator::new()),
        }
    }

    /// Stream `input` into the job's process, starting the process if needed.
    ///
    /// `reset` asks the process to discard the buckets in the range before
    /// the data is written; a process started by this call has nothing to reset.
    pub async fn process_data_load(
        &self,
        job_id: &str,
        input: &mut (dyn AsyncRead + Unpin + Send),
        reset: Option<TimeRange>,
    ) -> ProcessResult<DataCounts> {
        let mut guard = self.acquire(job_id, "upload data")?;
        let result = self.data_load_locked(job_id, &mut guard, input, reset).await;
        self.release(job_id, guard);
        result
    }

    async fn data_load_locked(
        &self,
        job_id: &str,
        guard: &mut OwnedMutexGuard<SlotState>,
        input: &mut (dyn AsyncRead + Unpin + Send),
        reset: Option<TimeRange>,
    ) -> ProcessResult<DataCounts> {
        let created = self.ensure_started(job_id, guard).await?;

        if let Some(range) = reset {
            if created {
                warn!(job_id, "cannot reset buckets, the analytics process has just been started");
            } else {
                debug!(job_id, start = ?range.start, end = ?range.end, "resetting buckets");
                let handle = self.live_handle(job_id, guard).await?;
                if let Err(e) = handle.write_control(&ControlMessage::ResetBuckets(range)).await {
                    let reason = format!("error writing to analytics process: {e}");
                    return Err(self.fail(job_id, guard, reason).await);
                }
            }
        }

        let handle = self.live_handle(job_id, guard).await?;
        let mut persister = self.persisters.persister_for(job_id);
        let result = write_to_process(
            job_id,
            &handle.job,
            input,
            &mut handle.writer,
            persister.as_mut(),
            &mut handle.progress,
        )
        .await;
        let timeout = handle.job.timeout;

        match result {
            Ok(counts) => {
                info!(
                    job_id,
                    records = counts.processed_record_count,
                    invalid_dates = counts.invalid_date_count,
                    out_of_order = counts.out_of_order_time_stamp_count,
                    missing_fields = counts.missing_field_count,
                    "data load finished"
                );
                self.schedule_timeout(job_id, timeout);
                Ok(counts)
            }
            Err(WriteError::Output(e)) => {
                let reason = format!("error writing to analytics process: {e}");
                Err(self.fail(job_id, guard, reason).await)
            }
            Err(e) => {
                self.schedule_timeout(job_id, timeout);
                Err(e.into())
            }
        }
    }

    /// Start the job's process without sending data.
    pub async fn start_job(&self, job_id: &str) -> ProcessResult<()> {
        let mut guard = self.acquire(job_id, "start")?;
        let result = self.ensure_started(job_id, &mut guard).await;
        if let SlotState::Running(handle) = &*guard {
            self.schedule_timeout(job_id, handle.job.timeout);
        }
        self.release(job_id, guard);
        result.map(|_| ())
    }

    /// Make the process handle everything sent so far and wait for its acknowledgement.
    pub async fn flush_job(
        &self,
        job_id: &str,
        interim: Option<TimeRange>,
    ) -> ProcessResult<FlushId> {
        let mut guard = self.acquire(job_id, "flush")?;
        let result = self.flush_locked(job_id, &mut guard, interim).await;
        self.release(job_id, guard);
        result
    }

    async fn flush_locked(
        &self,
        job_id: &str,
        guard: &mut OwnedMutexGuard<SlotState>,
        interim: Option<TimeRange>,
    ) -> ProcessResult<FlushId> {
        let handle = self.live_handle(job_id, guard).await?;
        let id = match handle.write_flush(&self.flush_ids, interim).await {
            Ok(id) => id,
            Err(e) => {
                let reason = format!("error writing flush to analytics process: {e}");
                return Err(self.fail(job_id, guard, reason).await);
            }
        };
        debug!(job_id, flush_id = id, "waiting for flush acknowledgement");

        let handle = self.live_handle(job_id, guard).await?;
        let acks = handle.acks.clone();
        let waited = acks.wait_for(id, self.settings.flush_ack_timeout).await;
        let handle = self.live_handle(job_id, guard).await?;
        self.schedule_timeout(job_id, handle.job.timeout);

        match waited {
            FlushWait::Acknowledged => Ok(id),
            FlushWait::TimedOut => Err(ProcessError::FlushTimeout {
                job_id: job_id.to_string(),
                flush_id: id,
            }),
            FlushWait::StreamEnded => {
                let reason = "analytics output closed before the flush was acknowledged";
                Err(self.fail(job_id, guard, reason.to_string()).await)
            }
        }
    }

    /// Tell the process that time has moved on to `epoch` without data.
    pub async fn advance_time(&self, job_id: &str, epoch: i64) -> ProcessResult<()> {
        self.send_control(job_id, "advance time", ControlMessage::AdvanceTime(epoch))
            .await
    }

    /// Send updated configuration text to the running process.
    pub async fn update_config(&self, job_id: &str, config: &str) -> ProcessResult<()> {
        self.send_control(job_id, "update config", ControlMessage::UpdateConfig(config.to_string()))
            .await
    }

    async fn send_control(
        &self,
        job_id: &str,
        action: &str,
        message: ControlMessage,
    ) -> ProcessResult<()> {
        let mut guard = self.acquire(job_id, action)?;
        let result = self.control_locked(job_id, &mut guard, &message).await;
        self.release(job_id, guard);
        result
    }

    async fn control_locked(
        &self,
        job_id: &str,
        guard: &mut OwnedMutexGuard<SlotState>,
        message: &ControlMessage,
    ) -> ProcessResult<()> {
        let handle = self.live_handle(job_id, guard).await?;
        match handle.write_control(message).await {
            Ok(()) => {
                debug!(job_id, message = %message, "control message sent");
                self.schedule_timeout(job_id, handle.job.timeout);
                Ok(())
            }
            Err(e) => Err(self
                .fail(job_id, guard, format!("error writing {message} to analytics process: {e}"))
                .await),
        }
    }

    /// Stop the job's process gracefully. Closing a job without a process does nothing.
    pub async fn close_job(&self, job_id: &str) -> ProcessResult<()> {
        self.cancel_timeout(job_id);
        loop {
            let Some(slot) = self.existing_slot(job_id) else {
                debug!(job_id, "no analytics process to close");
                return Ok(());
            };
            let mut guard = Arc::clone(&slot)
                .try_lock_owned()
                .map_err(|_| ProcessError::in_use(job_id, "close"))?;

            let result = match std::mem::replace(&mut *guard, SlotState::Retired) {
                SlotState::Running(handle) => {
                    info!(job_id, "closing analytics process");
                    self.jobs.set_status(job_id, JobStatus::Closing, None);
                    match handle.close(job_id).await {
                        Ok(()) => {
                            self.jobs.set_status(job_id, JobStatus::Closed, None);
                            Ok(())
                        }
                        Err(report) => {
                            self.jobs.set_status(job_id, JobStatus::Failed, Some(&report));
                            Err(ProcessError::native(job_id, report))
                        }
                    }
                }
                SlotState::Absent => Ok(()),
                // left the map while we were looking it up
                SlotState::Retired => continue,
            };
            self.remove_slot(job_id, &slot);
            return result;
        }
    }

    /// True while the job has a process that has not exited, or while another call holds the job.
    pub fn job_is_running(&self, job_id: &str) -> bool {
        let Some(slot) = self.existing_slot(job_id) else {
            return false;
        };
        let Ok(mut state) = slot.try_lock() else {
            return true;
        };
        match &mut *state {
            SlotState::Running(handle) => handle.exited().is_none(),
            SlotState::Absent | SlotState::Retired => false,
        }
    }

    pub fn number_of_running_jobs(&self) -> usize {
        let slots: Vec<String> = lock(&self.slots).keys().cloned().collect();
        slots.iter().filter(|job_id| self.job_is_running(job_id)).count()
    }

    /// Close every job, retrying busy ones, and stop accepting idle timeouts.
    pub async fn shutdown(&self) {
        let pending: Vec<TimeoutEntry> = {
            let mut timeouts = lock(&self.timeouts);
            self.accepting_timeouts.store(false, Ordering::SeqCst);
            timeouts.drain().map(|(_, entry)| entry).collect()
        };
        for entry in pending {
            entry.task.abort();
        }

        let mut job_ids: Vec<String> = lock(&self.slots).keys().cloned().collect();
        job_ids.sort();
        info!(jobs = job_ids.len(), "shutting down analytics processes");

        for job_id in job_ids {
            self.close_when_idle(&job_id, || true).await;
        }
    }

    /// Close the job, waiting out other calls while `keep_trying` holds.
    async fn close_when_idle(&self, job_id: &str, keep_trying: impl Fn() -> bool) {
        loop {
            match self.close_job(job_id).await {
                Ok(()) => return,
                Err(e) if e.is_in_use() => {
                    info!(
                        job_id,
                        retry_secs = self.settings.in_use_retry.as_secs_f64(),
                        "job is in use, will retry close"
                    );
                    tokio::time::sleep(self.settings.in_use_retry).await;
                    if !keep_trying() {
                        return;
                    }
                }
                Err(e) => {
                    error!(job_id, error = %e, "error closing job");
                    return;
                }
            }
        }
    }

    fn acquire(&self, job_id: &str, action: &str) -> ProcessResult<OwnedMutexGuard<SlotState>> {
        loop {
            let slot = {
                let mut slots = lock(&self.slots);
                Arc::clone(
                    slots
                        .entry(job_id.to_string())
                        .or_insert_with(|| Arc::new(Mutex::new(SlotState::Absent))),
                )
            };
            let guard = slot
                .try_lock_owned()
                .map_err(|_| ProcessError::in_use(job_id, action))?;
            if !matches!(*guard, SlotState::Retired) {
                return Ok(guard);
            }
        }
    }

    /// Drop the guard, retiring the slot if the job has no process.
    fn release(&self, job_id: &str, mut guard: OwnedMutexGuard<SlotState>) {
        if matches!(*guard, SlotState::Absent | SlotState::Retired) {
            *guard = SlotState::Retired;
            let slot = Arc::clone(OwnedMutexGuard::mutex(&guard));
            self.remove_slot(job_id, &slot);
        }
    }

    fn existing_slot(&self, job_id: &str) -> Option<Slot> {
        lock(&self.slots).get(job_id).cloned()
    }

    fn remove_slot(&self, job_id: &str, slot: &Slot) {
        let mut slots = lock(&self.slots);
        if slots.get(job_id).is_some_and(|current| Arc::ptr_eq(current, slot)) {
            slots.remove(job_id);
        }
    }

    /// Start a process when the slot has none. Returns whether one was started.
    async fn ensure_started(
        &self,
        job_id: &str,
        guard: &mut OwnedMutexGuard<SlotState>,
    ) -> ProcessResult<bool> {
        if matches!(**guard, SlotState::Running(_)) {
            return Ok(false);
        }

        let job = self
            .jobs
            .job(job_id)
            .ok_or_else(|| ProcessError::UnknownJob(job_id.to_string()))?;
        let layout = RecordLayout::from_job(&job)?;
        let header = layout.mapper.output_names();

        let process = self.factory.create(job_id, &job).await?;
        let stderr = StderrBuffer::spawn(job_id, process.stderr);
        let (results, acks) =
            spawn_results_reader(job_id, process.stdout, Arc::clone(&self.results));

        info!(job_id, fields = ?header, "analytics process started");
        **guard = SlotState::Running(Box::new(ProcessHandle {
            job,
            writer: LengthEncodedWriter::new(BufWriter::new(process.stdin)),
            control: process.control,
            stderr,
            results,
            acks,
            progress: IngestProgress::default(),
            header,
            files: process.files_to_delete,
            started: Instant::now(),
        }));
        self.jobs.set_status(job_id, JobStatus::Running, None);
        Ok(true)
    }

    /// The running handle, failing the job if its process has died.
    async fn live_handle<'g>(
        &self,
        job_id: &str,
        guard: &'g mut OwnedMutexGuard<SlotState>,
    ) -> ProcessResult<&'g mut ProcessHandle> {
        let reason = match &mut **guard {
            SlotState::Running(handle) => handle.exited(),
            _ => return Err(ProcessError::NotRunning(job_id.to_string())),
        };
        if let Some(reason) = reason {
            return Err(self.fail(job_id, guard, reason).await);
        }
        match &mut **guard {
            SlotState::Running(handle) => Ok(handle.as_mut()),
            _ => Err(ProcessError::NotRunning(job_id.to_string())),
        }
    }

    /// Kill the process, mark the job failed and report why, with its stderr.
    async fn fail(
        &self,
        job_id: &str,
        guard: &mut OwnedMutexGuard<SlotState>,
        reason: String,
    ) -> ProcessError {
        self.cancel_timeout(job_id);
        let report = match std::mem::replace(&mut **guard, SlotState::Retired) {
            SlotState::Running(handle) => handle.kill(job_id, reason).await,
            _ => reason,
        };
        let slot = Arc::clone(OwnedMutexGuard::mutex(guard));
        self.remove_slot(job_id, &slot);
        self.jobs.set_status(job_id, JobStatus::Failed, Some(&report));
        ProcessError::native(job_id, report)
    }

    fn schedule_timeout(&self, job_id: &str, timeout: Duration) {
        let mut timeouts = lock(&self.timeouts);
        if !self.accepting_timeouts.load(Ordering::SeqCst) {
            return;
        }
        let id = self.next_timeout_id.fetch_add(1, Ordering::SeqCst);
        let manager = self.this.clone();
        let job = job_id.to_string();

        let task = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(manager) = manager.upgrade() {
                manager.on_timeout(&job, id).await;
            }
        });
        if let Some(previous) = timeouts.insert(job_id.to_string(), TimeoutEntry { id, task }) {
            previous.task.abort();
        }
    }

    fn cancel_timeout(&self, job_id: &str) {
        let entry = lock(&self.timeouts).remove(job_id);
        if let Some(entry) = entry {
            entry.task.abort();
        }
    }

    async fn on_timeout(&self, job_id: &str, id: u64) {
        {
            let mut timeouts = lock(&self.timeouts);
            if timeouts.get(job_id).map(|entry| entry.id) != Some(id) {
                return;
            }
            // no longer abortable: the close must not be cut short
            timeouts.remove(job_id);
        }
        info!(job_id, "idle timeout expired");

        // a newer schedule or a shutdown takes over from this one
        let superseded = || {
            !self.accepting_timeouts.load(Ordering::SeqCst)
                || lock(&self.timeouts).contains_key(job_id)
        };
        self.close_when_idle(job_id, || !superseded()).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::test_support::job_from_yaml;
    use crate::process::jobs::InMemoryJobProvider;
    use crate::process::native::fake::FakeProcessFactory;
    use tempfile::TempDir;

    const CSV_JOB: &str = r#"
timeout: 1h
data_description:
  field_delimiter: ","
analysis_config:
  detectors:
    - function: mean
      field_name: value
"#;

    fn provider(yaml: &str) -> Arc<InMemoryJobProvider> {
        let mut jobs = HashMap::new();
        jobs.insert("job".to_string(), job_from_yaml(yaml));
        Arc::new(InMemoryJobProvider::new(jobs))
    }

    fn manager(
        factory: &Arc<FakeProcessFactory>,
        jobs: &Arc<InMemoryJobProvider>,
    ) -> Arc<ProcessManager> {
        ProcessManager::builder(factory.clone(), jobs.clone())
            .settings(SupervisorSettings {
                in_use_retry: Duration::from_millis(10),
                flush_ack_timeout: Duration::from_secs(5),
            })
            .build()
    }

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[tokio::test]
    async fn test_data_load_starts_process_once() {
        let factory = Arc::new(FakeProcessFactory::new());
        let jobs = provider(CSV_JOB);
        let manager = manager(&factory, &jobs);

        let mut first: &[u8] = b"time,value\n1,10\n2,20\n";
        let counts = manager.process_data_load("job", &mut first, None).await.unwrap();
        assert_eq!(counts.processed_record_count, 2);

        let mut second: &[u8] = b"time,value\n3,30\n";
        manager.process_data_load("job", &mut second, None).await.unwrap();

        assert_eq!(factory.launch_count(), 1);
        assert!(manager.job_is_running("job"));
        assert_eq!(manager.number_of_running_jobs(), 1);
        assert_eq!(jobs.state("job").unwrap().status, JobStatus::Running);

        manager.close_job("job").await.unwrap();
        assert_eq!(
            factory.records(),
            vec![
                strings(&["time", "value", "."]),
                strings(&["1", "10", ""]),
                strings(&["2", "20", ""]),
                strings(&["3", "30", ""]),
            ]
        );
        assert!(!manager.job_is_running("job"));
        assert_eq!(jobs.state("job").unwrap().status, JobStatus::Closed);
    }

    #[tokio::test]
    async fn test_flush_ids_increase_and_are_acknowledged() {
        let factory = Arc::new(FakeProcessFactory::new());
        let jobs = provider(CSV_JOB);
        let manager = manager(&factory, &jobs);

        let mut input: &[u8] = b"time,value\n1,10\n";
        manager.process_data_load("job", &mut input, None).await.unwrap();

        let first = manager.flush_job("job", None).await.unwrap();
        let second = manager
            .flush_job("job", Some(TimeRange::new(Some(0), Some(100))))
            .await
            .unwrap();
        assert_eq!(second, first + 1);

        manager.close_job("job").await.unwrap();
        let controls: Vec<String> = factory
            .records()
            .iter()
            .skip(2)
            .map(|r| r.last().unwrap().trim().to_string())
            .collect();
        assert_eq!(
            controls,
            vec![
                format!("f{first}"),
                String::new(),
                "i0 100".to_string(),
                format!("f{second}"),
                String::new(),
            ]
        );
    }

    #[tokio::test]
    async fn test_flush_without_ack_times_out() {
        let factory = Arc::new(FakeProcessFactory::new().without_flush_acks());
        let jobs = provider(CSV_JOB);
        let manager = ProcessManager::builder(factory.clone(), jobs.clone())
            .settings(SupervisorSettings {
                in_use_retry: Duration::from_millis(10),
                flush_ack_timeout: Duration::from_millis(50),
            })
            .build();

        manager.start_job("job").await.unwrap();
        let err = manager.flush_job("job", None).await.unwrap_err();
        assert!(matches!(err, ProcessError::FlushTimeout { .. }));
        assert!(manager.job_is_running("job"));
        manager.close_job("job").await.unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_load_is_rejected() {
        let factory = Arc::new(FakeProcessFactory::new());
        let jobs = provider(CSV_JOB);
        let manager = manager(&factory, &jobs);

        let (mut client, mut server) = tokio::io::duplex(1024);
        let background = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move { manager.process_data_load("job", &mut server, None).await })
        };
        client.write_all(b"time,value\n1,10\n").await.unwrap();

        // wait until the first call holds the job
        while manager.number_of_running_jobs() == 0 {
            tokio::task::yield_now().await;
        }
        let mut other: &[u8] = b"time,value\n2,20\n";
        let err = manager.process_data_load("job", &mut other, None).await.unwrap_err();
        assert!(err.is_in_use());
        assert!(manager.close_job("job").await.unwrap_err().is_in_use());

        drop(client);
        let counts = background.await.unwrap().unwrap();
        assert_eq!(counts.processed_record_count, 1);
        manager.close_job("job").await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_field_leaves_process_running() {
        let factory = Arc::new(FakeProcessFactory::new());
        let jobs = provider(CSV_JOB);
        let manager = manager(&factory, &jobs);

        let mut input: &[u8] = b"time,other\n1,10\n";
        let err = manager.process_data_load("job", &mut input, None).await.unwrap_err();
        assert!(matches!(err, ProcessError::MissingField { ref field, .. } if field == "value"));
        assert!(manager.job_is_running("job"));

        manager.close_job("job").await.unwrap();
        assert!(factory.records().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_job() {
        let factory = Arc::new(FakeProcessFactory::new());
        let jobs = provider(CSV_JOB);
        let manager = manager(&factory, &jobs);

        let mut input: &[u8] = b"time,value\n1,10\n";
        let err = manager.process_data_load("nope", &mut input, None).await.unwrap_err();
        assert!(matches!(err, ProcessError::UnknownJob(_)));
        assert_eq!(manager.number_of_running_jobs(), 0);
        assert_eq!(factory.launch_count(), 0);
    }

    #[tokio::test]
    async fn test_dead_process_fails_next_call_with_stderr() {
        let temp = TempDir::new().unwrap();
        let factory =
            Arc::new(FakeProcessFactory::new().with_temp_files_in(temp.path().to_path_buf()));
        let jobs = provider(CSV_JOB);
        let manager = manager(&factory, &jobs);

        manager.start_job("job").await.unwrap();
        assert_eq!(std::fs::read_dir(temp.path()).unwrap().count(), 1);

        factory.crash();
        factory.wait_for_exits(1).await;

        let mut input: &[u8] = b"time,value\n1,10\n";
        let err = manager.process_data_load("job", &mut input, None).await.unwrap_err();
        match err {
            ProcessError::NativeProcess { message, .. } => {
                assert!(message.contains("exited unexpectedly with code 1"));
                assert!(message.contains("simulated crash"));
            }
            other => panic!("unexpected error {other:?}"),
        }

        let state = jobs.state("job").unwrap();
        assert_eq!(state.status, JobStatus::Failed);
        assert!(state.finished_at.is_some());
        assert!(!manager.job_is_running("job"));
        assert_eq!(std::fs::read_dir(temp.path()).unwrap().count(), 0);

        // the next load starts a fresh process
        let mut input: &[u8] = b"time,value\n1,10\n";
        manager.process_data_load("job", &mut input, None).await.unwrap();
        assert_eq!(factory.launch_count(), 2);
        manager.close_job("job").await.unwrap();
    }

    #[tokio::test]
    async fn test_non_zero_exit_on_close_fails_job() {
        let factory = Arc::new(FakeProcessFactory::new().exiting_with(4, "model state lost\n"));
        let jobs = provider(CSV_JOB);
        let manager = manager(&factory, &jobs);

        manager.start_job("job").await.unwrap();
        let err = manager.close_job("job").await.unwrap_err();
        assert!(err.to_string().contains("exited with code 4"));
        assert!(err.to_string().contains("model state lost"));
        assert_eq!(jobs.state("job").unwrap().status, JobStatus::Failed);
    }

    #[tokio::test]
    async fn test_reset_is_sent_only_to_existing_process() {
        let factory = Arc::new(FakeProcessFactory::new());
        let jobs = provider(CSV_JOB);
        let manager = manager(&factory, &jobs);
        let range = TimeRange::new(Some(10), Some(20));

        let mut first: &[u8] = b"time,value\n1,10\n";
        manager.process_data_load("job", &mut first, Some(range)).await.unwrap();
        let mut second: &[u8] = b"time,value\n2,20\n";
        manager.process_data_load("job", &mut second, Some(range)).await.unwrap();
        manager.close_job("job").await.unwrap();

        assert_eq!(
            factory.records(),
            vec![
                strings(&["time", "value", "."]),
                strings(&["1", "10", ""]),
                strings(&["", "", "r10 20"]),
                strings(&["2", "20", ""]),
            ]
        );
    }

    #[tokio::test]
    async fn test_control_messages_share_the_header() {
        let factory = Arc::new(FakeProcessFactory::new());
        let jobs = provider(CSV_JOB);
        let manager = manager(&factory, &jobs);

        manager.start_job("job").await.unwrap();
        manager.advance_time("job", 3600).await.unwrap();
        manager.update_config("job", "[modelDebugConfig]").await.unwrap();
        manager.close_job("job").await.unwrap();

        assert_eq!(
            factory.records(),
            vec![
                strings(&["time", "value", "."]),
                strings(&["", "", "t3600"]),
                strings(&["", "", "u[modelDebugConfig]"]),
            ]
        );
    }

    #[tokio::test]
    async fn test_control_needs_a_running_process() {
        let factory = Arc::new(FakeProcessFactory::new());
        let jobs = provider(CSV_JOB);
        let manager = manager(&factory, &jobs);

        let err = manager.flush_job("job", None).await.unwrap_err();
        assert!(matches!(err, ProcessError::NotRunning(_)));
        manager.close_job("job").await.unwrap();
        assert_eq!(manager.number_of_running_jobs(), 0);
    }

    #[tokio::test]
    async fn test_idle_timeout_closes_job() {
        let factory = Arc::new(FakeProcessFactory::new());
        let jobs = provider(&CSV_JOB.replace("timeout: 1h", "timeout: 50ms"));
        let manager = manager(&factory, &jobs);

        let mut input: &[u8] = b"time,value\n1,10\n";
        manager.process_data_load("job", &mut input, None).await.unwrap();

        factory.wait_for_exits(1).await;
        for _ in 0..500 {
            if jobs.state("job").unwrap().status == JobStatus::Closed {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(jobs.state("job").unwrap().status, JobStatus::Closed);
        assert!(!manager.job_is_running("job"));
    }

    #[tokio::test]
    async fn test_idle_timeout_waits_for_running_load() {
        let factory = Arc::new(FakeProcessFactory::new());
        let jobs = provider(&CSV_JOB.replace("timeout: 1h", "timeout: 100ms"));
        let manager = manager(&factory, &jobs);

        let mut first: &[u8] = b"time,value\n1,10\n";
        manager.process_data_load("job", &mut first, None).await.unwrap();

        let (mut client, mut server) = tokio::io::duplex(1024);
        let background = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move { manager.process_data_load("job", &mut server, None).await })
        };
        client.write_all(b"time,value\n2,20\n").await.unwrap();

        // the timeout expires while the upload still holds the job
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(lock(&manager.timeouts).is_empty());
        assert!(manager.job_is_running("job"));
        assert_eq!(jobs.state("job").unwrap().status, JobStatus::Running);

        client.write_all(b"3,30\n").await.unwrap();
        drop(client);
        let counts = background.await.unwrap().unwrap();
        assert_eq!(counts.processed_record_count, 2);
        assert_eq!(factory.launch_count(), 1);

        // the upload rescheduled the timeout, which now closes the job
        for _ in 0..500 {
            if jobs.state("job").unwrap().status == JobStatus::Closed {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(jobs.state("job").unwrap().status, JobStatus::Closed);
        assert_eq!(
            factory.records(),
            vec![
                strings(&["time", "value", "."]),
                strings(&["1", "10", ""]),
                strings(&["2", "20", ""]),
                strings(&["3", "30", ""]),
            ]
        );
    }

    #[tokio::test]
    async fn test_shutdown_retries_busy_job() {
        let factory = Arc::new(FakeProcessFactory::new());
        let jobs = provider(CSV_JOB);
        let manager = manager(&factory, &jobs);

        let (mut client, mut server) = tokio::io::duplex(1024);
        let background = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move { manager.process_data_load("job", &mut server, None).await })
        };
        client.write_all(b"time,value\n1,10\n").await.unwrap();
        while manager.number_of_running_jobs() == 0 {
            tokio::task::yield_now().await;
        }

        let shutdown = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move { manager.shutdown().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!shutdown.is_finished());
        assert_eq!(jobs.state("job").unwrap().status, JobStatus::Running);

        drop(client);
        let counts = background.await.unwrap().unwrap();
        assert_eq!(counts.processed_record_count, 1);
        shutdown.await.unwrap();

        assert_eq!(manager.number_of_running_jobs(), 0);
        assert_eq!(jobs.state("job").unwrap().status, JobStatus::Closed);
        assert!(lock(&manager.timeouts).is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_closes_all_jobs() {
        let factory = Arc::new(FakeProcessFactory::new());
        let mut configs = HashMap::new();
        configs.insert("a".to_string(), job_from_yaml(CSV_JOB));
        configs.insert("b".to_string(), job_from_yaml(CSV_JOB));
        let jobs = Arc::new(InMemoryJobProvider::new(configs));
        let manager = manager(&factory, &jobs);

        manager.start_job("a").await.unwrap();
        manager.start_job("b").await.unwrap();
        assert_eq!(manager.number_of_running_jobs(), 2);

        manager.shutdown().await;
        assert_eq!(manager.number_of_running_jobs(), 0);
        assert_eq!(jobs.state("a").unwrap().status, JobStatus::Closed);
        assert_eq!(jobs.state("b").unwrap().status, JobStatus::Closed);

        // no timeouts are scheduled after shutdown
        manager.start_job("a").await.unwrap();
        assert!(lock(&manager.timeouts).is_empty());
        manager.close_job("a").await.unwrap();
    }
}

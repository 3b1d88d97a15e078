//! Job lifecycle on top of one device session.
//!
//! ```text
//!   enable ──▶ ENABLED ──start──▶ STARTED ──▶ READY (completed / failed)
//!                 │                   └─stop─▶ STOPPED
//!              disable
//! ```

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::channel_queue::{JobQueues, SubscriptionLedger};
use crate::device::{Channel, ChannelId, Device, DeviceError};
use crate::job::{
    CaptureJob, ChannelSelection, JobContext, JobError, JobOutput, JobParams, JobRegistry, JobRun,
};
use crate::trigger::{TriggerError, TriggerSession};
use crate::trigger_config::{TriggerMap, TriggerSpec};
use crate::worker::{Readiness, Target, Worker, WorkerExit};

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("Job {0} not found among enabled jobs")]
    NotFound(JobId),

    #[error("Unknown job kind '{0}'")]
    UnknownJobKind(String),

    #[error("No device connected")]
    NotConnected,

    #[error("Configuration error: {0}")]
    Configuration(#[from] TriggerError),

    #[error("Device error: {0}")]
    Device(#[from] DeviceError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobId(u64);

impl JobId {
    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrchestratorConfig {
    /// Longest a worker blocks on one queue read; bounds stop latency.
    pub queue_timeout: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            queue_timeout: Duration::from_millis(100),
        }
    }
}

/// Channel dividers, shared by all channels or given per channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Divider {
    All(u32),
    PerChannel(Vec<u32>),
}

impl Default for Divider {
    fn default() -> Self {
        Self::All(0)
    }
}

/// A finished job as seen by the host.
#[derive(Debug, Clone)]
pub struct JobReport {
    pub id: JobId,
    pub kind: &'static str,
    pub exit: WorkerExit,
    pub output: JobOutput,
}

impl JobReport {
    pub fn is_failure(&self) -> bool {
        self.exit.is_failure()
    }
}

#[derive(Debug)]
pub enum PollStatus {
    /// Jobs that finished since the last poll, possibly none.
    Ready(Vec<JobReport>),
    /// Every started job has been reported.
    Done,
}

/// Raises the stop flag of every worker from another thread.
#[derive(Debug, Clone, Default)]
pub struct StopHandle {
    flags: Vec<Arc<AtomicBool>>,
}

impl StopHandle {
    pub fn stop(&self) {
        for flag in &self.flags {
            flag.store(true, Ordering::Relaxed);
        }
    }
}

#[derive(Debug)]
struct EnabledJob {
    id: JobId,
    kind: String,
    params: JobParams,
}

/// A job wired to its queues and triggers whose worker is not running yet.
struct PreparedJob {
    id: JobId,
    target: Target,
    job: Box<dyn CaptureJob>,
    queues: JobQueues,
    run: JobRun,
}

struct StartedJob {
    id: JobId,
    job: Box<dyn CaptureJob>,
    worker: Option<Worker>,
    readiness: Readiness,
    reported: bool,
}

impl StartedJob {
    fn report(&mut self) -> Option<JobReport> {
        if self.reported {
            return None;
        }
        let exit = self.readiness.outcome()?;
        self.reported = true;
        Some(JobReport {
            id: self.id,
            kind: self.job.kind(),
            exit,
            output: self.job.result(),
        })
    }
}

impl fmt::Debug for StartedJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StartedJob")
            .field("id", &self.id)
            .field("kind", &self.job.kind())
            .field("reported", &self.reported)
            .finish()
    }
}

/// Runs capture jobs against a connected device.
///
/// Every orchestrator owns its own [`TriggerSession`], so cross-channel
/// triggers never leak between instances.
pub struct JobOrchestrator {
    config: OrchestratorConfig,
    registry: JobRegistry,
    device: Option<Arc<dyn Device>>,
    channels: Vec<Channel>,
    triggers: TriggerMap,
    session: Arc<TriggerSession>,
    ledger: SubscriptionLedger,
    next_id: u64,
    enabled: Vec<EnabledJob>,
    started: Vec<StartedJob>,
    failures: Vec<(JobId, JobError)>,
    stream_started: bool,
    cleaned_up: bool,
}

impl JobOrchestrator {
    pub fn new(registry: JobRegistry) -> Self {
        Self::with_config(registry, OrchestratorConfig::default())
    }

    pub fn with_config(registry: JobRegistry, config: OrchestratorConfig) -> Self {
        Self {
            config,
            registry,
            device: None,
            channels: Vec::new(),
            triggers: TriggerMap::new(),
            session: TriggerSession::new(),
            ledger: SubscriptionLedger::new(),
            next_id: 0,
            enabled: Vec::new(),
            started: Vec::new(),
            failures: Vec::new(),
            stream_started: false,
            cleaned_up: false,
        }
    }

    pub fn registry_mut(&mut self) -> &mut JobRegistry {
        &mut self.registry
    }

    pub fn connect(&mut self, device: Arc<dyn Device>) -> Result<(), OrchestratorError> {
        device.connect()?;
        log::info!("Connected, {} channels available", device.channel_list()?.len());
        self.device = Some(device);
        Ok(())
    }

    pub fn disconnect(&mut self) -> Result<(), OrchestratorError> {
        let device = self.device.take().ok_or(OrchestratorError::NotConnected)?;
        device.disconnect()?;
        self.channels.clear();
        log::info!("Disconnected");
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.device.is_some()
    }

    fn device(&self) -> Result<Arc<dyn Device>, OrchestratorError> {
        self.device.clone().ok_or(OrchestratorError::NotConnected)
    }

    /// Enable `selection` on the device. Requested order is kept.
    pub fn channels_configure(
        &mut self,
        selection: &ChannelSelection,
        divider: Divider,
    ) -> Result<(), OrchestratorError> {
        let device = self.device()?;
        let available = device.channel_list()?;
        let channels = match selection {
            ChannelSelection::All => available,
            ChannelSelection::Ids(ids) => ids
                .iter()
                .map(|id| {
                    available
                        .iter()
                        .find(|c| c.id == *id)
                        .cloned()
                        .ok_or(DeviceError::UnknownChannel(*id))
                })
                .collect::<Result<Vec<_>, _>>()?,
        };

        let dividers = match divider {
            Divider::All(d) => vec![d; channels.len()],
            Divider::PerChannel(list) if list.len() == channels.len() => list,
            Divider::PerChannel(list) => {
                return Err(DeviceError::DividerMismatch {
                    expected: channels.len(),
                    got: list.len(),
                }
                .into())
            }
        };

        let ids: Vec<ChannelId> = channels.iter().map(|c| c.id).collect();
        device.configure_channels(&ids, &dividers)?;
        log::info!("Configured channels {:?} with dividers {:?}", ids, dividers);
        self.channels = channels;
        Ok(())
    }

    pub fn channels(&self) -> &[Channel] {
        &self.channels
    }

    /// Set the trigger map used by jobs that bring none of their own.
    pub fn triggers_configure(&mut self, triggers: TriggerMap) {
        log::info!("Configured {} trigger entries", triggers.len());
        self.triggers = triggers;
    }

    pub fn triggers(&self) -> &TriggerMap {
        &self.triggers
    }

    pub fn enable(&mut self, kind: &str, params: JobParams) -> Result<JobId, OrchestratorError> {
        if !self.registry.contains(kind) {
            return Err(OrchestratorError::UnknownJobKind(kind.to_string()));
        }
        self.next_id += 1;
        let id = JobId(self.next_id);
        log::info!("Enabled job {} '{}'", id, kind);
        self.enabled.push(EnabledJob {
            id,
            kind: kind.to_string(),
            params,
        });
        Ok(id)
    }

    pub fn disable(&mut self, id: JobId) -> Result<(), OrchestratorError> {
        let position = self
            .enabled
            .iter()
            .position(|job| job.id == id)
            .ok_or(OrchestratorError::NotFound(id))?;
        let job = self.enabled.remove(position);
        log::info!("Disabled job {} '{}'", id, job.kind);
        Ok(())
    }

    pub fn enabled_jobs(&self) -> Vec<(JobId, &str)> {
        self.enabled.iter().map(|job| (job.id, job.kind.as_str())).collect()
    }

    pub fn started_jobs(&self) -> Vec<(JobId, &'static str)> {
        self.started.iter().map(|job| (job.id, job.job.kind())).collect()
    }

    /// Jobs that failed to start, with the reason.
    pub fn start_failures(&self) -> &[(JobId, JobError)] {
        &self.failures
    }

    /// The configured channels a job asked for, in configured order.
    pub fn resolve_channels(&self, requested: &ChannelSelection) -> Vec<Channel> {
        self.channels
            .iter()
            .filter(|c| requested.contains(c.id))
            .cloned()
            .collect()
    }

    /// Trigger for `channel`: the job's own map replaces the global one when
    /// given. Exact channel entry first, then the catch-all entry, then always-on.
    pub fn resolve_trigger(&self, channel: ChannelId, job_map: Option<&TriggerMap>) -> TriggerSpec {
        job_map
            .unwrap_or(&self.triggers)
            .lookup(channel)
            .copied()
            .unwrap_or_default()
    }

    /// Start every enabled job, then the device stream if any job needs it.
    ///
    /// All jobs of the batch are created and wired first, workers only run
    /// once the whole trigger graph is in place. A job that fails to start is
    /// logged and recorded, the others proceed. Cross-channel triggers whose
    /// source is still missing after wiring are a configuration error and no
    /// worker of the batch is started.
    pub fn start(&mut self) -> Result<(), OrchestratorError> {
        let device = self.device()?;

        let mut prepared = Vec::new();
        for enabled in std::mem::take(&mut self.enabled) {
            let id = enabled.id;
            match self.prepare_job(enabled, device.as_ref()) {
                Ok(job) => prepared.push(job),
                Err(e) => {
                    log::error!("Job {} failed to start: {}", id, e);
                    self.failures.push((id, e));
                }
            }
        }

        if let Some((channel, source_channel)) = self.session.unresolved().first().copied() {
            for mut job in prepared {
                job.queues.release(device.as_ref(), &self.ledger);
            }
            return Err(TriggerError::UnresolvedSource {
                channel,
                source_channel,
            }
            .into());
        }

        let mut stream_needed = false;
        for job in prepared {
            let id = job.id;
            match self.launch_job(job, device.as_ref()) {
                Ok(started) => {
                    log::info!("Started job {} '{}'", id, started.job.kind());
                    stream_needed |= started.job.stream_needed();
                    self.started.push(started);
                }
                Err(e) => {
                    log::error!("Job {} failed to start: {}", id, e);
                    self.failures.push((id, e));
                }
            }
        }

        if stream_needed && !self.stream_started {
            device.stream_start()?;
            self.stream_started = true;
            log::info!("Device stream started");
        }
        Ok(())
    }

    /// Create the job, register its triggers, subscribe its queues and run
    /// its `init` hook. Nothing evaluates yet.
    fn prepare_job(
        &self,
        enabled: EnabledJob,
        device: &dyn Device,
    ) -> Result<PreparedJob, JobError> {
        let mut job = self
            .registry
            .create(&enabled.kind, &enabled.params)
            .ok_or_else(|| JobError::Start(format!("unknown job kind '{}'", enabled.kind)))??;

        let channels = self.resolve_channels(&enabled.params.channels);
        let job_map = enabled.params.triggers.as_ref();
        let mut queues = if job.stream_needed() {
            JobQueues::subscribe(device, &self.ledger, &self.session, &channels, |chan| {
                self.resolve_trigger(chan, job_map)
            })?
        } else {
            JobQueues::default()
        };

        let ctx = JobContext {
            channels: &channels,
            device,
            target: enabled.params.target,
        };
        let run = job.start(&ctx).and_then(|run| match run {
            JobRun::Stream(mut handler) => {
                handler.init(&channels)?;
                Ok(JobRun::Stream(handler))
            }
            JobRun::Finished => Ok(JobRun::Finished),
        });
        let run = match run {
            Ok(run) => run,
            Err(e) => {
                queues.release(device, &self.ledger);
                return Err(e);
            }
        };

        Ok(PreparedJob {
            id: enabled.id,
            target: enabled.params.target,
            job,
            queues,
            run,
        })
    }

    fn launch_job(
        &self,
        prepared: PreparedJob,
        device: &dyn Device,
    ) -> Result<StartedJob, JobError> {
        let PreparedJob {
            id,
            target,
            job,
            mut queues,
            run,
        } = prepared;

        let (worker, readiness) = match run {
            JobRun::Stream(handler) => {
                let name = format!("{}-{}", job.kind(), id.value());
                let worker =
                    Worker::spawn(&name, queues, handler, target, self.config.queue_timeout)?;
                let readiness = worker.readiness().clone();
                (Some(worker), readiness)
            }
            JobRun::Finished => {
                queues.release(device, &self.ledger);
                (None, Readiness::signaled(WorkerExit::Completed))
            }
        };

        Ok(StartedJob {
            id,
            job,
            worker,
            readiness,
            reported: false,
        })
    }

    /// Non-blocking: jobs that finished since the previous call.
    pub fn poll(&mut self) -> PollStatus {
        let reports: Vec<JobReport> = self
            .started
            .iter_mut()
            .filter_map(StartedJob::report)
            .collect();
        if reports.is_empty() && self.started.iter().all(|job| job.reported) {
            PollStatus::Done
        } else {
            PollStatus::Ready(reports)
        }
    }

    /// Block until every started job finished and return the unreported ones.
    ///
    /// Unbounded jobs only finish after a stop, see [`Self::stop_handle`].
    pub fn ready(&mut self) -> Vec<JobReport> {
        for job in &self.started {
            job.readiness.wait();
        }
        self.started.iter_mut().filter_map(StartedJob::report).collect()
    }

    /// Stop flags of all running workers, usable while `ready` blocks.
    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            flags: self
                .started
                .iter()
                .filter_map(|job| job.worker.as_ref().map(Worker::stop_flag))
                .collect(),
        }
    }

    /// Stop the device stream, then every worker. Idempotent.
    pub fn stop(&mut self) {
        if self.stream_started {
            if let Some(device) = &self.device {
                match device.stream_stop() {
                    Ok(()) => log::info!("Device stream stopped"),
                    Err(e) => log::warn!("Failed to stop device stream: {}", e),
                }
            }
            self.stream_started = false;
        }
        for job in &mut self.started {
            if let Some(worker) = job.worker.as_mut() {
                worker.stop();
            }
        }
    }

    /// Stop everything, release all subscriptions and triggers, disconnect.
    pub fn cleanup(mut self) {
        self.teardown();
    }

    fn teardown(&mut self) {
        self.stop();
        // dropping the workers releases the trigger states they own
        self.started.clear();
        self.enabled.clear();
        if let Some(device) = self.device.take() {
            self.ledger.release_all(device.as_ref());
            if let Err(e) = device.disconnect() {
                log::warn!("Failed to disconnect device: {}", e);
            }
        }
        self.session.clear();
        self.cleaned_up = true;
        log::debug!("Orchestrator cleaned up");
    }
}

impl fmt::Debug for JobOrchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobOrchestrator")
            .field("config", &self.config)
            .field("registry", &self.registry)
            .field("connected", &self.device.is_some())
            .field("channels", &self.channels)
            .field("enabled", &self.enabled)
            .field("started", &self.started)
            .field("stream_started", &self.stream_started)
            .finish_non_exhaustive()
    }
}

impl Drop for JobOrchestrator {
    fn drop(&mut self) {
        if !self.cleaned_up {
            log::warn!("JobOrchestrator dropped without cleanup, cleaning up now");
            self.teardown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulated_device::SimulatedDevice;
    use crate::trigger_config::TriggerKey;
    use std::time::Instant;

    fn orchestrator() -> JobOrchestrator {
        let mut orchestrator = JobOrchestrator::with_config(
            JobRegistry::with_builtin(),
            OrchestratorConfig {
                queue_timeout: Duration::from_millis(20),
            },
        );
        orchestrator.connect(Arc::new(SimulatedDevice::new())).unwrap();
        orchestrator
    }

    fn poll_until_done(orchestrator: &mut JobOrchestrator) -> Vec<JobReport> {
        let deadline = Instant::now() + Duration::from_secs(10);
        let mut reports = Vec::new();
        loop {
            match orchestrator.poll() {
                PollStatus::Done => return reports,
                PollStatus::Ready(mut new) => reports.append(&mut new),
            }
            assert!(Instant::now() < deadline, "jobs did not finish in time");
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_bounded_job_reported_once() {
        let mut orchestrator = orchestrator();
        orchestrator
            .channels_configure(&ChannelSelection::Ids(vec![0, 2]), Divider::All(1))
            .unwrap();
        let id = orchestrator.enable("none", JobParams::new().samples(200)).unwrap();
        orchestrator.start().unwrap();
        assert_eq!(orchestrator.started_jobs(), vec![(id, "none")]);

        let reports = poll_until_done(&mut orchestrator);
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].id, id);
        assert_eq!(reports[0].exit, WorkerExit::Completed);
        assert!(matches!(
            &reports[0].output,
            JobOutput::Counts(counts) if counts == &vec![(0, 200), (2, 200)]
        ));
        assert!(matches!(orchestrator.poll(), PollStatus::Done));
        orchestrator.stop();
        orchestrator.cleanup();
    }

    #[test]
    fn test_disable_twice() {
        let mut orchestrator = orchestrator();
        let id = orchestrator.enable("none", JobParams::new()).unwrap();
        assert_eq!(orchestrator.enabled_jobs(), vec![(id, "none")]);
        orchestrator.disable(id).unwrap();
        assert!(matches!(orchestrator.disable(id), Err(OrchestratorError::NotFound(x)) if x == id));
        assert!(orchestrator.enabled_jobs().is_empty());
    }

    #[test]
    fn test_ids_are_monotonic() {
        let mut orchestrator = orchestrator();
        let a = orchestrator.enable("none", JobParams::new()).unwrap();
        orchestrator.disable(a).unwrap();
        let b = orchestrator.enable("printer", JobParams::new()).unwrap();
        assert!(b > a);
        assert!(matches!(
            orchestrator.enable("plot", JobParams::new()),
            Err(OrchestratorError::UnknownJobKind(_))
        ));
    }

    #[test]
    fn test_requires_device() {
        let mut orchestrator = JobOrchestrator::new(JobRegistry::with_builtin());
        assert!(matches!(
            orchestrator.channels_configure(&ChannelSelection::All, Divider::default()),
            Err(OrchestratorError::NotConnected)
        ));
        orchestrator.enable("none", JobParams::new()).unwrap();
        assert!(matches!(orchestrator.start(), Err(OrchestratorError::NotConnected)));
        assert!(matches!(orchestrator.disconnect(), Err(OrchestratorError::NotConnected)));
    }

    #[test]
    fn test_channel_configuration() {
        let mut orchestrator = orchestrator();
        orchestrator
            .channels_configure(&ChannelSelection::Ids(vec![3, 1]), Divider::PerChannel(vec![2, 1]))
            .unwrap();
        let ids: Vec<ChannelId> = orchestrator.channels().iter().map(|c| c.id).collect();
        assert_eq!(ids, vec![3, 1]);

        let resolved = orchestrator.resolve_channels(&ChannelSelection::Ids(vec![1, 3, 7]));
        let ids: Vec<ChannelId> = resolved.iter().map(|c| c.id).collect();
        assert_eq!(ids, vec![3, 1]);

        assert!(matches!(
            orchestrator.channels_configure(&ChannelSelection::All, Divider::PerChannel(vec![1])),
            Err(OrchestratorError::Device(DeviceError::DividerMismatch { expected: 6, got: 1 }))
        ));
        assert!(matches!(
            orchestrator.channels_configure(&ChannelSelection::Ids(vec![11]), Divider::All(1)),
            Err(OrchestratorError::Device(DeviceError::UnknownChannel(11)))
        ));
    }

    #[test]
    fn test_resolve_trigger_order() {
        let mut orchestrator = orchestrator();
        let global = TriggerMap::new()
            .with(TriggerKey::Global, TriggerSpec::always_off())
            .with(1, TriggerSpec::start_capturing_when().rising_edge(1.0));
        orchestrator.triggers_configure(global);

        assert_eq!(orchestrator.resolve_trigger(1, None).kind.as_str(), "er");
        assert_eq!(orchestrator.resolve_trigger(2, None), TriggerSpec::always_off());

        let job_map =
            TriggerMap::new().with(2, TriggerSpec::start_capturing_when().falling_edge(0.0));
        assert_eq!(orchestrator.resolve_trigger(2, Some(&job_map)).kind.as_str(), "ef");
        // the job map replaces the global one entirely
        assert_eq!(orchestrator.resolve_trigger(1, Some(&job_map)), TriggerSpec::always_on());
    }

    #[test]
    fn test_start_failure_is_recorded() {
        let mut orchestrator = orchestrator();
        orchestrator
            .channels_configure(&ChannelSelection::Ids(vec![0]), Divider::All(1))
            .unwrap();
        let broken = orchestrator.enable("csv", JobParams::new().samples(10)).unwrap();
        let fine = orchestrator.enable("none", JobParams::new().samples(10)).unwrap();
        orchestrator.start().unwrap();

        assert_eq!(orchestrator.started_jobs(), vec![(fine, "none")]);
        let failures = orchestrator.start_failures();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].0, broken);
        assert!(matches!(failures[0].1, JobError::InvalidOption { .. }));

        let reports = poll_until_done(&mut orchestrator);
        assert_eq!(reports.len(), 1);
        orchestrator.cleanup();
    }

    #[test]
    fn test_init_failure_is_a_start_failure() {
        let mut orchestrator = orchestrator();
        orchestrator
            .channels_configure(&ChannelSelection::Ids(vec![0]), Divider::All(1))
            .unwrap();
        let missing = std::env::temp_dir()
            .join(format!("streamscope-missing-{}", std::process::id()))
            .join("nested")
            .join("capture");
        let broken = orchestrator
            .enable(
                "csv",
                JobParams::new()
                    .samples(10)
                    .option("path", missing.to_string_lossy()),
            )
            .unwrap();
        orchestrator.start().unwrap();

        assert!(orchestrator.started_jobs().is_empty());
        let failures = orchestrator.start_failures();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].0, broken);
        assert!(matches!(failures[0].1, JobError::Io(_)));
        assert!(matches!(orchestrator.poll(), PollStatus::Done));
        orchestrator.cleanup();
    }

    #[test]
    fn test_unresolved_cross_source() {
        let mut orchestrator = orchestrator();
        orchestrator
            .channels_configure(&ChannelSelection::Ids(vec![0, 1]), Divider::All(1))
            .unwrap();
        let map: TriggerMap = "0:er#5,0,10".parse().unwrap();
        orchestrator
            .enable("none", JobParams::new().samples(10).triggers(map))
            .unwrap();
        assert!(matches!(
            orchestrator.start(),
            Err(OrchestratorError::Configuration(TriggerError::UnresolvedSource {
                channel: 0,
                source_channel: 5
            }))
        ));
        orchestrator.cleanup();
    }

    #[test]
    fn test_cross_channel_job() {
        let mut orchestrator = orchestrator();
        orchestrator
            .channels_configure(&ChannelSelection::Ids(vec![0, 3]), Divider::All(1))
            .unwrap();
        // channel 3 is static, it only opens on the saw of channel 0
        let map: TriggerMap = "0:off;3:er#0,0,50".parse().unwrap();
        let gated = orchestrator
            .enable(
                "none",
                JobParams::new()
                    .samples(100)
                    .channels(ChannelSelection::Ids(vec![3]))
                    .triggers(map.clone()),
            )
            .unwrap();
        let source = orchestrator
            .enable(
                "none",
                JobParams::new()
                    .samples(0)
                    .channels(ChannelSelection::Ids(vec![0]))
                    .triggers(map),
            )
            .unwrap();
        orchestrator.start().unwrap();

        let deadline = Instant::now() + Duration::from_secs(10);
        let report = loop {
            if let PollStatus::Ready(reports) = orchestrator.poll() {
                if let Some(report) = reports.into_iter().find(|r| r.id == gated) {
                    break report;
                }
            }
            assert!(Instant::now() < deadline, "gated job did not finish");
            std::thread::sleep(Duration::from_millis(5));
        };
        assert_eq!(report.exit, WorkerExit::Completed);

        orchestrator.stop();
        let reports = orchestrator.ready();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].id, source);
        assert_eq!(reports[0].exit, WorkerExit::Stopped);
        orchestrator.cleanup();
    }

    #[test]
    fn test_cross_trigger_wired_on_running_stream() {
        let mut orchestrator = orchestrator();
        orchestrator
            .channels_configure(&ChannelSelection::Ids(vec![0, 1, 3]), Divider::All(1))
            .unwrap();
        orchestrator
            .enable(
                "none",
                JobParams::new()
                    .samples(0)
                    .channels(ChannelSelection::Ids(vec![1])),
            )
            .unwrap();
        orchestrator.start().unwrap();

        // the follower is enabled before its source, on a stream already running
        let map: TriggerMap = "0:off;3:er#0,0,50".parse().unwrap();
        let gated = orchestrator
            .enable(
                "none",
                JobParams::new()
                    .samples(100)
                    .channels(ChannelSelection::Ids(vec![3]))
                    .triggers(map.clone()),
            )
            .unwrap();
        std::thread::sleep(Duration::from_millis(50));
        orchestrator
            .enable(
                "none",
                JobParams::new()
                    .samples(0)
                    .channels(ChannelSelection::Ids(vec![0]))
                    .triggers(map),
            )
            .unwrap();
        orchestrator.start().unwrap();
        assert_eq!(orchestrator.started_jobs().len(), 3);

        let deadline = Instant::now() + Duration::from_secs(10);
        let report = loop {
            if let PollStatus::Ready(reports) = orchestrator.poll() {
                if let Some(report) = reports.into_iter().find(|r| r.id == gated) {
                    break report;
                }
            }
            assert!(Instant::now() < deadline, "gated job did not finish");
            std::thread::sleep(Duration::from_millis(5));
        };
        assert_eq!(report.exit, WorkerExit::Completed);

        orchestrator.stop();
        assert!(orchestrator.ready().iter().all(|r| r.exit == WorkerExit::Stopped));
        orchestrator.cleanup();
    }

    #[test]
    fn test_devinfo_needs_no_stream() {
        let device = Arc::new(SimulatedDevice::new());
        let mut orchestrator = JobOrchestrator::new(JobRegistry::with_builtin());
        orchestrator.connect(device.clone()).unwrap();
        orchestrator.enable("devinfo", JobParams::new()).unwrap();
        orchestrator.start().unwrap();
        assert!(!device.is_streaming());

        let reports = orchestrator.ready();
        assert!(matches!(
            &reports[0].output,
            JobOutput::Channels(channels) if channels.len() == 6
        ));
        assert!(matches!(orchestrator.poll(), PollStatus::Done));
        orchestrator.cleanup();
        assert!(!device.is_connected());
    }

    #[test]
    fn test_unbounded_job_stops_from_handle() {
        let device = Arc::new(SimulatedDevice::new());
        let mut orchestrator = JobOrchestrator::with_config(
            JobRegistry::with_builtin(),
            OrchestratorConfig {
                queue_timeout: Duration::from_millis(10),
            },
        );
        orchestrator.connect(device.clone()).unwrap();
        orchestrator
            .channels_configure(&ChannelSelection::Ids(vec![1]), Divider::All(1))
            .unwrap();
        orchestrator.enable("none", JobParams::new().samples(0)).unwrap();
        orchestrator.start().unwrap();
        assert!(device.is_streaming());
        assert_eq!(device.subscriber_count(), 1);

        let handle = orchestrator.stop_handle();
        let stopper = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            handle.stop();
        });
        let reports = orchestrator.ready();
        stopper.join().unwrap();
        assert_eq!(reports[0].exit, WorkerExit::Stopped);

        orchestrator.stop();
        orchestrator.stop();
        assert!(!device.is_streaming());
        orchestrator.cleanup();
        assert_eq!(device.subscriber_count(), 0);
    }
}

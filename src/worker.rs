//! Generic consumption loop shared by every streaming job kind.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::channel_queue::{ChannelQueue, JobQueues};
use crate::device::{Channel, Sample};
use crate::job::JobError;

/// How many samples each channel of a job has to deliver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Target {
    Samples(usize),
    /// Run until stopped from outside.
    #[default]
    Unbounded,
}

impl Target {
    /// `0` means unbounded, as on the command line.
    pub fn from_count(samples: usize) -> Self {
        if samples == 0 {
            Target::Unbounded
        } else {
            Target::Samples(samples)
        }
    }

    pub fn is_unbounded(&self) -> bool {
        matches!(self, Target::Unbounded)
    }
}

/// Per-channel consumed-sample counters of a running job.
///
/// The handler decides what one unit is, the loop only compares against the
/// target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Progress {
    target: Target,
    counters: Vec<usize>,
}

impl Progress {
    pub fn new(target: Target, channels: usize) -> Self {
        Self {
            target,
            counters: vec![0; channels],
        }
    }

    pub fn target(&self) -> Target {
        self.target
    }

    pub fn add(&mut self, index: usize, amount: usize) {
        if let Some(counter) = self.counters.get_mut(index) {
            *counter += amount;
        }
    }

    pub fn get(&self, index: usize) -> usize {
        self.counters.get(index).copied().unwrap_or(0)
    }

    /// Units channel `index` may still consume, `usize::MAX` when unbounded.
    pub fn remaining(&self, index: usize) -> usize {
        match self.target {
            Target::Samples(n) => n.saturating_sub(self.get(index)),
            Target::Unbounded => usize::MAX,
        }
    }

    pub fn channel_done(&self, index: usize) -> bool {
        self.remaining(index) == 0
    }

    pub fn is_complete(&self) -> bool {
        match self.target {
            Target::Samples(n) => self.counters.iter().all(|c| *c >= n),
            Target::Unbounded => false,
        }
    }

    pub fn counters(&self) -> &[usize] {
        &self.counters
    }
}

/// Job-specific hooks driven by the worker loop.
pub trait SampleHandler: Send {
    /// Called once on the starting thread, before the worker is spawned.
    /// An error here means the job never starts.
    fn init(&mut self, _channels: &[Channel]) -> Result<(), JobError> {
        Ok(())
    }

    /// Consume the gated samples of channel `index` and account for them in `progress`.
    fn handle_samples(
        &mut self,
        samples: Vec<Sample>,
        channel: &Channel,
        index: usize,
        progress: &mut Progress,
    ) -> Result<(), JobError>;

    fn finalize(&mut self) -> Result<(), JobError> {
        Ok(())
    }
}

/// Why a worker loop ended.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerExit {
    /// Every channel reached the target.
    Completed,
    Stopped,
    Failed(JobError),
}

impl WorkerExit {
    pub fn is_failure(&self) -> bool {
        matches!(self, WorkerExit::Failed(_))
    }
}

/// One-shot completion signal of a job.
#[derive(Debug, Clone, Default)]
pub struct Readiness {
    inner: Arc<(Mutex<Option<WorkerExit>>, Condvar)>,
}

impl Readiness {
    pub fn new() -> Self {
        Self::default()
    }

    /// Readiness that already fired, for jobs without a worker.
    pub fn signaled(exit: WorkerExit) -> Self {
        let readiness = Self::new();
        readiness.signal(exit);
        readiness
    }

    /// Raise the signal. Only the first call has an effect.
    pub fn signal(&self, exit: WorkerExit) -> bool {
        let (lock, cvar) = &*self.inner;
        let mut outcome = lock.lock();
        if outcome.is_some() {
            return false;
        }
        *outcome = Some(exit);
        cvar.notify_all();
        true
    }

    pub fn is_set(&self) -> bool {
        self.inner.0.lock().is_some()
    }

    pub fn outcome(&self) -> Option<WorkerExit> {
        self.inner.0.lock().clone()
    }

    pub fn wait(&self) -> WorkerExit {
        let (lock, cvar) = &*self.inner;
        let mut outcome = lock.lock();
        loop {
            if let Some(exit) = outcome.as_ref() {
                return exit.clone();
            }
            cvar.wait(&mut outcome);
        }
    }

    pub fn wait_timeout(&self, timeout: Duration) -> Option<WorkerExit> {
        let (lock, cvar) = &*self.inner;
        let mut outcome = lock.lock();
        if outcome.is_none() {
            cvar.wait_for(&mut outcome, timeout);
        }
        outcome.clone()
    }
}

/// Raises a failure if the loop unwinds before signaling.
struct SignalGuard(Readiness);

impl Drop for SignalGuard {
    fn drop(&mut self) {
        if self.0.signal(WorkerExit::Failed(JobError::Hook(
            "worker thread panicked".to_string(),
        ))) {
            log::error!("Capture worker ended without signaling readiness");
        }
    }
}

/// A running worker loop on its own thread.
#[derive(Debug)]
pub struct Worker {
    name: String,
    stop: Arc<AtomicBool>,
    readiness: Readiness,
    thread: Option<JoinHandle<JobQueues>>,
    queues: Option<JobQueues>,
}

impl Worker {
    /// Run `handler` over `queues` on a new thread. The handler is expected to
    /// be initialized already.
    pub fn spawn(
        name: &str,
        queues: JobQueues,
        handler: Box<dyn SampleHandler>,
        target: Target,
        queue_timeout: Duration,
    ) -> Result<Self, JobError> {
        let stop = Arc::new(AtomicBool::new(false));
        let readiness = Readiness::new();

        let thread = {
            let stop = Arc::clone(&stop);
            let readiness = readiness.clone();
            let job = name.to_string();
            thread::Builder::new()
                .name(format!("capture-{}", name))
                .spawn(move || {
                    let guard = SignalGuard(readiness);
                    let mut queues = queues;
                    let exit = run_loop(&job, &mut queues, handler, target, queue_timeout, &stop);
                    match &exit {
                        WorkerExit::Failed(e) => log::error!("Capture job {} failed: {}", job, e),
                        other => log::info!("Capture job {} finished: {:?}", job, other),
                    }
                    guard.0.signal(exit);
                    queues
                })
                .map_err(|e| JobError::Start(format!("cannot spawn worker thread: {}", e)))?
        };

        Ok(Self {
            name: name.to_string(),
            stop,
            readiness,
            thread: Some(thread),
            queues: None,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn readiness(&self) -> &Readiness {
        &self.readiness
    }

    /// Flag observed by the loop after every queue read.
    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    pub fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Ask the loop to exit and wait for it. Idempotent.
    ///
    /// The queues come back to the worker and stay alive until it is dropped.
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(thread) = self.thread.take() {
            match thread.join() {
                Ok(queues) => self.queues = Some(queues),
                Err(_) => log::error!("Capture worker {} panicked", self.name),
            }
        }
    }

    pub fn queues(&self) -> Option<&JobQueues> {
        self.queues.as_ref()
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_loop(
    job: &str,
    queues: &mut JobQueues,
    mut handler: Box<dyn SampleHandler>,
    target: Target,
    timeout: Duration,
    stop: &AtomicBool,
) -> WorkerExit {
    let span = tracing::info_span!("capture_worker", job = job);
    let _enter = span.enter();

    let mut progress = Progress::new(target, queues.len());
    let exit = loop {
        if queues.is_empty() {
            thread::sleep(timeout);
        }
        if let Err(e) = consume_pass(queues, handler.as_mut(), &mut progress, timeout, stop) {
            return WorkerExit::Failed(e);
        }
        if stop.load(Ordering::Relaxed) {
            break WorkerExit::Stopped;
        }
        if progress.is_complete() {
            break WorkerExit::Completed;
        }

        #[cfg(feature = "cpu-profiling")]
        if let Some(client) = tracy_client::Client::running() {
            client.secondary_frame_mark(tracy_client::frame_name!("capture_worker"));
        }
    };

    log::debug!("Capture job {} progress: {:?}", job, progress.counters());
    match handler.finalize() {
        Ok(()) => exit,
        Err(e) => WorkerExit::Failed(e),
    }
}

/// One read from every channel, in order. Returns early once `stop` is raised.
fn consume_pass(
    queues: &mut JobQueues,
    handler: &mut dyn SampleHandler,
    progress: &mut Progress,
    timeout: Duration,
    stop: &AtomicBool,
) -> Result<(), JobError> {
    for (index, queue) in queues.iter_mut().enumerate() {
        let batch = queue.read(timeout);
        if stop.load(Ordering::Relaxed) {
            return Ok(());
        }
        let Some(batch) = batch else {
            continue;
        };
        if batch.is_empty() || progress.channel_done(index) {
            continue;
        }
        deliver(queue, batch, handler, index, progress)?;
    }
    Ok(())
}

fn deliver(
    queue: &mut ChannelQueue,
    batch: Vec<Sample>,
    handler: &mut dyn SampleHandler,
    index: usize,
    progress: &mut Progress,
) -> Result<(), JobError> {
    let gated = queue.gate(batch)?;
    if gated.is_empty() {
        return Ok(());
    }
    handler.handle_samples(gated, queue.channel(), index, progress)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel_queue::SubscriptionLedger;
    use crate::device::Device;
    use crate::simulated_device::SimulatedDevice;
    use crate::trigger::TriggerSession;
    use crate::trigger_config::TriggerSpec;

    struct Counting {
        seen: Arc<Mutex<Vec<usize>>>,
        finalized: Arc<AtomicBool>,
        fail_on_samples: bool,
    }

    impl Counting {
        fn new() -> (Self, Arc<Mutex<Vec<usize>>>, Arc<AtomicBool>) {
            let seen = Arc::new(Mutex::new(Vec::new()));
            let finalized = Arc::new(AtomicBool::new(false));
            let handler = Self {
                seen: Arc::clone(&seen),
                finalized: Arc::clone(&finalized),
                fail_on_samples: false,
            };
            (handler, seen, finalized)
        }
    }

    impl SampleHandler for Counting {
        fn init(&mut self, channels: &[Channel]) -> Result<(), JobError> {
            *self.seen.lock() = vec![0; channels.len()];
            Ok(())
        }

        fn handle_samples(
            &mut self,
            samples: Vec<Sample>,
            _channel: &Channel,
            index: usize,
            progress: &mut Progress,
        ) -> Result<(), JobError> {
            if self.fail_on_samples {
                return Err(JobError::Hook("sink broke".to_string()));
            }
            let take = samples.len().min(progress.remaining(index));
            self.seen.lock()[index] += take;
            progress.add(index, take);
            Ok(())
        }

        fn finalize(&mut self) -> Result<(), JobError> {
            self.finalized.store(true, Ordering::Relaxed);
            Ok(())
        }
    }

    fn initialized(mut handler: Counting, queues: &JobQueues) -> Box<dyn SampleHandler> {
        let channels: Vec<Channel> = queues.channels().cloned().collect();
        handler.init(&channels).unwrap();
        Box::new(handler)
    }

    fn streaming_queues(device: &SimulatedDevice, ids: &[u32]) -> JobQueues {
        let ledger = SubscriptionLedger::new();
        let session = TriggerSession::new();
        let channels: Vec<Channel> = device
            .channel_list()
            .unwrap()
            .into_iter()
            .filter(|c| ids.contains(&c.id))
            .collect();
        let dividers = vec![1; channels.len()];
        device.configure_channels(ids, &dividers).unwrap();
        JobQueues::subscribe(device, &ledger, &session, &channels, |_| {
            TriggerSpec::always_on()
        })
        .unwrap()
    }

    #[test]
    fn test_progress() {
        let mut progress = Progress::new(Target::Samples(10), 2);
        progress.add(0, 10);
        assert!(progress.channel_done(0));
        assert!(!progress.is_complete());
        progress.add(1, 12);
        assert!(progress.is_complete());
        assert_eq!(progress.remaining(1), 0);

        let unbounded = Progress::new(Target::from_count(0), 1);
        assert!(!unbounded.is_complete());
        assert_eq!(unbounded.remaining(0), usize::MAX);
    }

    #[test]
    fn test_readiness_fires_once() {
        let readiness = Readiness::new();
        assert!(readiness.wait_timeout(Duration::from_millis(1)).is_none());
        assert!(readiness.signal(WorkerExit::Completed));
        assert!(!readiness.signal(WorkerExit::Stopped));
        assert_eq!(readiness.wait(), WorkerExit::Completed);
        assert!(readiness.clone().is_set());
    }

    #[test]
    fn test_bounded_worker_completes() {
        let device = SimulatedDevice::new();
        device.connect().unwrap();
        let queues = streaming_queues(&device, &[0, 1]);
        device.stream_start().unwrap();

        let (handler, seen, finalized) = Counting::new();
        let handler = initialized(handler, &queues);
        let mut worker = Worker::spawn(
            "count",
            queues,
            handler,
            Target::Samples(50),
            Duration::from_millis(20),
        )
        .unwrap();

        let exit = worker.readiness().wait_timeout(Duration::from_secs(10));
        assert_eq!(exit, Some(WorkerExit::Completed));
        assert_eq!(*seen.lock(), vec![50, 50]);
        assert!(finalized.load(Ordering::Relaxed));
        worker.stop();
        assert_eq!(worker.queues().map(JobQueues::len), Some(2));
        device.stream_stop().unwrap();
    }

    #[test]
    fn test_unbounded_worker_stops() {
        let device = SimulatedDevice::new();
        device.connect().unwrap();
        let queues = streaming_queues(&device, &[3]);

        let (handler, _seen, finalized) = Counting::new();
        let handler = initialized(handler, &queues);
        let mut worker = Worker::spawn(
            "forever",
            queues,
            handler,
            Target::Unbounded,
            Duration::from_millis(10),
        )
        .unwrap();

        assert!(worker.readiness().wait_timeout(Duration::from_millis(50)).is_none());
        worker.stop();
        assert_eq!(worker.readiness().outcome(), Some(WorkerExit::Stopped));
        assert!(finalized.load(Ordering::Relaxed));
        // second stop is a no-op
        worker.stop();
    }

    #[test]
    fn test_hook_failure_is_reported() {
        let device = SimulatedDevice::new();
        device.connect().unwrap();
        let queues = streaming_queues(&device, &[0]);
        device.stream_start().unwrap();

        let (mut handler, _seen, finalized) = Counting::new();
        handler.fail_on_samples = true;
        let handler = initialized(handler, &queues);
        let worker = Worker::spawn(
            "broken",
            queues,
            handler,
            Target::Samples(10),
            Duration::from_millis(20),
        )
        .unwrap();

        let exit = worker.readiness().wait_timeout(Duration::from_secs(10)).unwrap();
        assert!(exit.is_failure());
        assert!(!finalized.load(Ordering::Relaxed));
        drop(worker);
        device.stream_stop().unwrap();
    }
}

//! Contract between the orchestrator and job kinds.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use polars::prelude::{DataFrame, PolarsError};

use crate::channel_queue::QueueError;
use crate::device::{Channel, ChannelId, Device, DeviceError};
use crate::jobs;
use crate::trigger::TriggerError;
use crate::trigger_config::TriggerMap;
use crate::worker::{SampleHandler, Target};

/// Failures of a single job. Cloneable so one outcome can be reported more than once.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum JobError {
    #[error("Job failed to start: {0}")]
    Start(String),

    #[error("Job hook failed: {0}")]
    Hook(String),

    #[error("Trigger error: {0}")]
    Trigger(#[from] TriggerError),

    #[error("Device error: {0}")]
    Device(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Invalid value for option '{name}': {reason}")]
    InvalidOption { name: String, reason: String },
}

impl From<DeviceError> for JobError {
    fn from(e: DeviceError) -> Self {
        Self::Device(e.to_string())
    }
}

impl From<std::io::Error> for JobError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

impl From<PolarsError> for JobError {
    fn from(e: PolarsError) -> Self {
        Self::Hook(e.to_string())
    }
}

impl From<QueueError> for JobError {
    fn from(e: QueueError) -> Self {
        match e {
            QueueError::Trigger(e) => Self::Trigger(e),
            QueueError::Device(e) => e.into(),
        }
    }
}

/// Which of the configured channels a job captures.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ChannelSelection {
    #[default]
    All,
    Ids(Vec<ChannelId>),
}

impl ChannelSelection {
    pub fn contains(&self, id: ChannelId) -> bool {
        match self {
            ChannelSelection::All => true,
            ChannelSelection::Ids(ids) => ids.contains(&id),
        }
    }
}

impl FromStr for ChannelSelection {
    type Err = JobError;

    /// `all` or a comma separated id list, e.g. `0,2,3`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("all") {
            return Ok(Self::All);
        }
        s.split(',')
            .map(|id| {
                id.trim().parse::<ChannelId>().map_err(|e| JobError::InvalidOption {
                    name: "channels".to_string(),
                    reason: format!("'{}': {}", id.trim(), e),
                })
            })
            .collect::<Result<Vec<_>, _>>()
            .map(Self::Ids)
    }
}

/// Parameters a job is enabled with.
///
/// Common settings are typed; kind-specific settings travel as string options
/// and are validated when the job is instantiated.
#[derive(Debug, Clone, Default)]
pub struct JobParams {
    pub target: Target,
    pub channels: ChannelSelection,
    /// Replaces the global trigger map for this job.
    pub triggers: Option<TriggerMap>,
    options: HashMap<String, String>,
}

impl JobParams {
    pub fn new() -> Self {
        Self::default()
    }

    /// Samples per channel, `0` for unbounded.
    pub fn samples(mut self, samples: usize) -> Self {
        self.target = Target::from_count(samples);
        self
    }

    pub fn channels(mut self, channels: ChannelSelection) -> Self {
        self.channels = channels;
        self
    }

    pub fn triggers(mut self, triggers: TriggerMap) -> Self {
        self.triggers = Some(triggers);
        self
    }

    pub fn option(mut self, name: &str, value: impl Into<String>) -> Self {
        self.options.insert(name.to_string(), value.into());
        self
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.options.get(name).map(String::as_str)
    }

    pub fn required(&self, name: &str) -> Result<&str, JobError> {
        self.get(name).ok_or_else(|| JobError::InvalidOption {
            name: name.to_string(),
            reason: "option is required".to_string(),
        })
    }

    pub fn parse<T>(&self, name: &str, default: T) -> Result<T, JobError>
    where
        T: FromStr,
        T::Err: fmt::Display,
    {
        match self.get(name) {
            None => Ok(default),
            Some(raw) => raw.trim().parse().map_err(|e: T::Err| JobError::InvalidOption {
                name: name.to_string(),
                reason: format!("'{}': {}", raw, e),
            }),
        }
    }
}

/// What a job gets to see when it starts.
pub struct JobContext<'a> {
    /// Resolved channels, in configured order.
    pub channels: &'a [Channel],
    pub device: &'a dyn Device,
    pub target: Target,
}

/// How a started job continues.
pub enum JobRun {
    /// Drive these hooks on a worker thread.
    Stream(Box<dyn SampleHandler>),
    /// All work happened inside `start`.
    Finished,
}

impl fmt::Debug for JobRun {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobRun::Stream(_) => f.write_str("Stream"),
            JobRun::Finished => f.write_str("Finished"),
        }
    }
}

/// Whatever a job produced, opaque to the orchestrator.
#[derive(Debug, Clone)]
pub enum JobOutput {
    Nothing,
    /// Consumed samples per channel.
    Counts(Vec<(ChannelId, usize)>),
    Lines(Vec<String>),
    Files(Vec<PathBuf>),
    Frames(Vec<(ChannelId, DataFrame)>),
    Datagrams(usize),
    Channels(Vec<Channel>),
}

/// One job kind instance.
pub trait CaptureJob: Send {
    fn kind(&self) -> &'static str;

    /// Read once at start to decide whether the device stream must run.
    fn stream_needed(&self) -> bool {
        true
    }

    fn start(&mut self, ctx: &JobContext<'_>) -> Result<JobRun, JobError>;

    fn result(&self) -> JobOutput;
}

pub type JobFactory =
    Box<dyn Fn(&JobParams) -> Result<Box<dyn CaptureJob>, JobError> + Send + Sync>;

/// Job kinds by name.
#[derive(Default)]
pub struct JobRegistry {
    factories: BTreeMap<String, JobFactory>,
}

impl JobRegistry {
    /// Registry without any kinds.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register(jobs::none::KIND, jobs::none::NoneJob::create);
        registry.register(jobs::printer::KIND, jobs::printer::PrinterJob::create);
        registry.register(jobs::csv::KIND, jobs::csv::CsvJob::create);
        registry.register(jobs::npsave::KIND, jobs::npsave::NpSaveJob::create);
        registry.register(jobs::frame::KIND, jobs::frame::FrameJob::create);
        registry.register(jobs::udp::KIND, jobs::udp::UdpJob::create);
        registry.register(jobs::devinfo::KIND, jobs::devinfo::DevInfoJob::create);
        registry
    }

    /// Add or replace a kind.
    pub fn register<F>(&mut self, name: &str, factory: F)
    where
        F: Fn(&JobParams) -> Result<Box<dyn CaptureJob>, JobError> + Send + Sync + 'static,
    {
        if self
            .factories
            .insert(name.to_string(), Box::new(factory))
            .is_some()
        {
            log::warn!("Job kind '{}' registered twice, keeping the latest", name);
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    pub fn kinds(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }

    /// Instantiate `name`, `None` if the kind is unknown.
    pub fn create(
        &self,
        name: &str,
        params: &JobParams,
    ) -> Option<Result<Box<dyn CaptureJob>, JobError>> {
        self.factories.get(name).map(|factory| factory(params))
    }
}

impl fmt::Debug for JobRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.factories.keys()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_selection_parse() {
        assert_eq!("all".parse::<ChannelSelection>().unwrap(), ChannelSelection::All);
        assert_eq!(
            " 0, 2,3".parse::<ChannelSelection>().unwrap(),
            ChannelSelection::Ids(vec![0, 2, 3])
        );
        assert!("0,x".parse::<ChannelSelection>().is_err());
        assert!(ChannelSelection::Ids(vec![1]).contains(1));
        assert!(!ChannelSelection::Ids(vec![1]).contains(2));
    }

    #[test]
    fn test_params_options() {
        let params = JobParams::new()
            .samples(0)
            .option("port", "9000")
            .option("echo", "maybe");
        assert_eq!(params.target, Target::Unbounded);
        assert_eq!(params.parse::<u16>("port", 1).unwrap(), 9000);
        assert_eq!(params.parse::<u16>("other", 1).unwrap(), 1);
        assert!(params.parse::<bool>("echo", true).is_err());
        assert!(matches!(
            params.required("path"),
            Err(JobError::InvalidOption { .. })
        ));
    }

    #[test]
    fn test_builtin_registry() {
        let registry = JobRegistry::with_builtin();
        let kinds: Vec<&str> = registry.kinds().collect();
        assert_eq!(
            kinds,
            vec!["csv", "devinfo", "frame", "none", "npsave", "printer", "udp"]
        );

        let job = registry.create("none", &JobParams::new()).unwrap().unwrap();
        assert_eq!(job.kind(), "none");
        assert!(registry.create("plot", &JobParams::new()).is_none());
        assert!(matches!(
            registry.create("csv", &JobParams::new()),
            Some(Err(JobError::InvalidOption { .. }))
        ));
    }
}

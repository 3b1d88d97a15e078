//! # StreamScope RS
//!
//! Trigger evaluation and capture job orchestration for streaming telemetry devices.
//!
//! A device exposes numbered channels, each emitting vector samples with optional
//! metadata bytes. This library gates those streams with oscilloscope-style
//! triggers and runs several capture jobs concurrently on top of them.
//!
//! ## Features
//!
//! - **Triggers**: always on/off, rising/falling edges with pre-trigger history
//! - **Cross-channel triggers**: capture one channel when another one crosses a level
//! - **Concurrent jobs**: one worker thread per job, fed through per-channel queues
//! - **Built-in sinks**: counting, printing, CSV and Arrow files, `polars` frames, JSON over UDP
//! - **Simulated device**: deterministic waveforms for tests and demos
//!
//! ## Examples
//!
//! ### Trigger Configuration
//!
//! ```rust
//! use streamscope_rs::{TriggerMap, TriggerSpec};
//!
//! // Capture channel 1 once channel 0 rises through 2.5, keep 10 samples of history
//! let trigger = TriggerSpec::start_capturing_when()
//!     .on_channel(0)
//!     .with_history(10)
//!     .rising_edge(2.5);
//! assert_eq!(trigger.to_string(), "er#0,10,2.5");
//!
//! // The same map, written as a request string
//! let map: TriggerMap = "g:off; 1:er#0,10,2.5".parse()?;
//! assert_eq!(map.lookup(1), Some(&trigger));
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! ### Evaluating a Stream
//!
//! ```rust
//! use streamscope_rs::{Sample, TriggerSession, TriggerSpec};
//!
//! let session = TriggerSession::new();
//! let mut trigger = session.register(0, TriggerSpec::start_capturing_when().falling_edge(0.0))?;
//!
//! let batch: Vec<Sample> = [2.0, 1.0, 0.0, -1.0].into_iter().map(Sample::scalar).collect();
//! let released = trigger.evaluate(batch)?;
//! assert_eq!(released.len(), 2);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! ### Running Jobs
//!
//! ```rust
//! use std::sync::Arc;
//! use streamscope_rs::{
//!     ChannelSelection, Divider, JobOrchestrator, JobParams, JobRegistry, SimulatedDevice,
//! };
//!
//! let mut orchestrator = JobOrchestrator::new(JobRegistry::with_builtin());
//! orchestrator.connect(Arc::new(SimulatedDevice::new()))?;
//! orchestrator.channels_configure(&ChannelSelection::Ids(vec![0, 2]), Divider::All(1))?;
//! orchestrator.triggers_configure("0:er,0,50".parse()?);
//!
//! orchestrator.enable("printer", JobParams::new().samples(5).option("echo", "false"))?;
//! orchestrator.start()?;
//!
//! for report in orchestrator.ready() {
//!     println!("job {} ({}) finished: {:?}", report.id, report.kind, report.exit);
//! }
//! orchestrator.cleanup();
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod channel_queue;
pub mod device;
pub mod job;
pub mod jobs;
pub mod orchestrator;
pub mod simulated_device;
pub mod trigger;
pub mod trigger_config;
pub mod worker;

// Re-export the main types for convenience
pub use trigger_config::{
    EdgeTriggerBuilder, TriggerConfigError, TriggerKey, TriggerKind, TriggerMap, TriggerSpec,
};

pub use trigger::{TriggerError, TriggerHandle, TriggerSession, TriggerState};

pub use device::{Channel, ChannelId, Device, DeviceError, QueueHandle, Sample};

pub use simulated_device::{SimulatedDevice, SimulatedDeviceConfig};

pub use job::{CaptureJob, ChannelSelection, JobError, JobOutput, JobParams, JobRegistry};

pub use worker::{SampleHandler, Target, WorkerExit};

pub use orchestrator::{
    Divider, JobId, JobOrchestrator, JobReport, OrchestratorConfig, OrchestratorError, PollStatus,
};

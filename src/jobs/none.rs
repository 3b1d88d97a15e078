use std::sync::Arc;

use parking_lot::Mutex;

use crate::device::{Channel, ChannelId, Sample};
use crate::job::{CaptureJob, JobContext, JobError, JobOutput, JobParams, JobRun};
use crate::worker::{Progress, SampleHandler};

pub const KIND: &str = "none";

/// Consumes samples and only counts them.
#[derive(Debug, Default)]
pub struct NoneJob {
    counts: Arc<Mutex<Vec<(ChannelId, usize)>>>,
}

impl NoneJob {
    pub fn create(_params: &JobParams) -> Result<Box<dyn CaptureJob>, JobError> {
        Ok(Box::new(Self::default()))
    }
}

impl CaptureJob for NoneJob {
    fn kind(&self) -> &'static str {
        KIND
    }

    fn start(&mut self, ctx: &JobContext<'_>) -> Result<JobRun, JobError> {
        log::info!("Start counting samples on {} channels", ctx.channels.len());
        Ok(JobRun::Stream(Box::new(Counter {
            counts: Arc::clone(&self.counts),
        })))
    }

    fn result(&self) -> JobOutput {
        JobOutput::Counts(self.counts.lock().clone())
    }
}

struct Counter {
    counts: Arc<Mutex<Vec<(ChannelId, usize)>>>,
}

impl SampleHandler for Counter {
    fn init(&mut self, channels: &[Channel]) -> Result<(), JobError> {
        *self.counts.lock() = channels.iter().map(|c| (c.id, 0)).collect();
        Ok(())
    }

    fn handle_samples(
        &mut self,
        samples: Vec<Sample>,
        _channel: &Channel,
        index: usize,
        progress: &mut Progress,
    ) -> Result<(), JobError> {
        let take = samples.len().min(progress.remaining(index));
        if let Some((_, count)) = self.counts.lock().get_mut(index) {
            *count += take;
        }
        progress.add(index, take);
        Ok(())
    }
}

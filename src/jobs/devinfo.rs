use crate::device::Channel;
use crate::job::{CaptureJob, JobContext, JobError, JobOutput, JobParams, JobRun};

pub const KIND: &str = "devinfo";

/// Reports the channels the device exposes. Needs no stream.
#[derive(Debug, Default)]
pub struct DevInfoJob {
    channels: Vec<Channel>,
}

impl DevInfoJob {
    pub fn create(_params: &JobParams) -> Result<Box<dyn CaptureJob>, JobError> {
        Ok(Box::new(Self::default()))
    }
}

impl CaptureJob for DevInfoJob {
    fn kind(&self) -> &'static str {
        KIND
    }

    fn stream_needed(&self) -> bool {
        false
    }

    fn start(&mut self, ctx: &JobContext<'_>) -> Result<JobRun, JobError> {
        self.channels = ctx.device.channel_list()?;
        for channel in &self.channels {
            log::info!("{}", channel);
        }
        Ok(JobRun::Finished)
    }

    fn result(&self) -> JobOutput {
        JobOutput::Channels(self.channels.clone())
    }
}

use std::sync::Arc;

use parking_lot::Mutex;
use polars::prelude::*;

use crate::device::{Channel, ChannelId, Sample};
use crate::job::{CaptureJob, JobContext, JobError, JobOutput, JobParams, JobRun};
use crate::worker::{Progress, SampleHandler};

pub const KIND: &str = "frame";

/// Accumulated y-series of one channel.
#[derive(Debug, Clone, Default)]
struct ChannelSeries {
    channel: ChannelId,
    name: String,
    ydata: Vec<Vec<f64>>,
}

impl ChannelSeries {
    fn points(&self) -> usize {
        self.ydata.first().map_or(0, Vec::len)
    }

    fn to_frame(&self) -> Result<DataFrame, PolarsError> {
        let columns: Vec<Column> = self
            .ydata
            .iter()
            .enumerate()
            .map(|(i, values)| {
                let name = if self.ydata.len() > 1 {
                    format!("{}_{}", self.name, i)
                } else {
                    self.name.clone()
                };
                Series::new(name.into(), values.as_slice()).into()
            })
            .collect();
        DataFrame::new(columns)
    }
}

/// Collects numerical channels into in-memory frames, one column per vector component.
///
/// Progress counts accumulated y-values per component, the unit plot sinks use.
/// Channels without numerical data are skipped.
#[derive(Debug, Default)]
pub struct FrameJob {
    series: Arc<Mutex<Vec<ChannelSeries>>>,
}

impl FrameJob {
    pub fn create(_params: &JobParams) -> Result<Box<dyn CaptureJob>, JobError> {
        Ok(Box::new(Self::default()))
    }

    /// Snapshot of the frames captured so far.
    pub fn frames(&self) -> Result<Vec<(ChannelId, DataFrame)>, PolarsError> {
        self.series
            .lock()
            .iter()
            .filter(|s| !s.ydata.is_empty())
            .map(|s| s.to_frame().map(|df| (s.channel, df)))
            .collect()
    }
}

impl CaptureJob for FrameJob {
    fn kind(&self) -> &'static str {
        KIND
    }

    fn start(&mut self, _ctx: &JobContext<'_>) -> Result<JobRun, JobError> {
        Ok(JobRun::Stream(Box::new(Accumulator {
            series: Arc::clone(&self.series),
        })))
    }

    fn result(&self) -> JobOutput {
        match self.frames() {
            Ok(frames) => JobOutput::Frames(frames),
            Err(e) => {
                log::error!("Cannot build capture frames: {}", e);
                JobOutput::Nothing
            }
        }
    }
}

struct Accumulator {
    series: Arc<Mutex<Vec<ChannelSeries>>>,
}

impl SampleHandler for Accumulator {
    fn init(&mut self, channels: &[Channel]) -> Result<(), JobError> {
        *self.series.lock() = channels
            .iter()
            .map(|c| ChannelSeries {
                channel: c.id,
                name: c.name.clone(),
                ydata: if c.numerical { vec![Vec::new(); c.vdim] } else { Vec::new() },
            })
            .collect();
        Ok(())
    }

    fn handle_samples(
        &mut self,
        samples: Vec<Sample>,
        _channel: &Channel,
        index: usize,
        progress: &mut Progress,
    ) -> Result<(), JobError> {
        let mut all = self.series.lock();
        let Some(series) = all.get_mut(index) else {
            return Ok(());
        };
        if series.ydata.is_empty() {
            // nothing to plot, the channel never holds the job back
            let take = progress.remaining(index).min(samples.len());
            progress.add(index, take);
            return Ok(());
        }

        let before = series.points();
        let take = samples.len().min(progress.remaining(index));
        for sample in samples.iter().take(take) {
            for (component, column) in series.ydata.iter_mut().enumerate() {
                column.push(sample.value(component).unwrap_or(f64::NAN));
            }
        }
        progress.add(index, series.points() - before);
        Ok(())
    }
}

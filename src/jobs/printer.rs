use std::sync::Arc;

use parking_lot::Mutex;

use crate::device::{Channel, Sample};
use crate::job::{CaptureJob, JobContext, JobError, JobOutput, JobParams, JobRun};
use crate::worker::{Progress, SampleHandler};

pub const KIND: &str = "printer";

/// Renders every captured sample as a text line.
///
/// Options: `echo` (default `true`) prints lines to stdout as they arrive,
/// `metastr` (default `false`) decodes metadata bytes as UTF-8.
#[derive(Debug)]
pub struct PrinterJob {
    echo: bool,
    meta_string: bool,
    lines: Arc<Mutex<Vec<String>>>,
}

impl PrinterJob {
    pub fn create(params: &JobParams) -> Result<Box<dyn CaptureJob>, JobError> {
        Ok(Box::new(Self {
            echo: params.parse("echo", true)?,
            meta_string: params.parse("metastr", false)?,
            lines: Arc::new(Mutex::new(Vec::new())),
        }))
    }
}

impl CaptureJob for PrinterJob {
    fn kind(&self) -> &'static str {
        KIND
    }

    fn start(&mut self, _ctx: &JobContext<'_>) -> Result<JobRun, JobError> {
        Ok(JobRun::Stream(Box::new(LinePrinter {
            echo: self.echo,
            meta_string: self.meta_string,
            lines: Arc::clone(&self.lines),
        })))
    }

    fn result(&self) -> JobOutput {
        JobOutput::Lines(self.lines.lock().clone())
    }
}

struct LinePrinter {
    echo: bool,
    meta_string: bool,
    lines: Arc<Mutex<Vec<String>>>,
}

impl LinePrinter {
    fn render(&self, number: usize, channel: &Channel, sample: &Sample) -> String {
        let meta = if self.meta_string {
            String::from_utf8_lossy(&sample.meta).into_owned()
        } else {
            format!("{:?}", sample.meta)
        };
        format!("{}: chan={} data={:?} meta={}", number, channel.id, sample.data, meta)
    }
}

impl SampleHandler for LinePrinter {
    fn handle_samples(
        &mut self,
        samples: Vec<Sample>,
        channel: &Channel,
        index: usize,
        progress: &mut Progress,
    ) -> Result<(), JobError> {
        let take = samples.len().min(progress.remaining(index));
        let mut lines = self.lines.lock();
        for sample in samples.iter().take(take) {
            let line = self.render(lines.len() + 1, channel, sample);
            if self.echo {
                println!("{}", line);
            }
            lines.push(line);
        }
        progress.add(index, take);
        Ok(())
    }

    fn finalize(&mut self) -> Result<(), JobError> {
        log::info!("Printer done, {} lines", self.lines.lock().len());
        Ok(())
    }
}

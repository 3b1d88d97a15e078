use std::fs::File;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use polars::prelude::*;

use crate::device::{Channel, Sample};
use crate::job::{CaptureJob, JobContext, JobError, JobOutput, JobParams, JobRun};
use crate::worker::{Progress, SampleHandler};

pub const KIND: &str = "npsave";

/// Stores each channel as a binary Arrow IPC array file `<path>_chan<N>.arrow`.
///
/// Samples are held in memory and written once the capture ends, one `f64`
/// column per vector component. Metadata is not stored. Channels without
/// numerical data are counted but produce no file.
#[derive(Debug)]
pub struct NpSaveJob {
    prefix: String,
    files: Arc<Mutex<Vec<PathBuf>>>,
}

impl NpSaveJob {
    pub fn create(params: &JobParams) -> Result<Box<dyn CaptureJob>, JobError> {
        Ok(Box::new(Self {
            prefix: params.required("path")?.to_string(),
            files: Arc::new(Mutex::new(Vec::new())),
        }))
    }

    pub fn channel_path(prefix: &str, channel: &Channel) -> PathBuf {
        PathBuf::from(format!("{}_chan{}.arrow", prefix, channel.id))
    }
}

impl CaptureJob for NpSaveJob {
    fn kind(&self) -> &'static str {
        KIND
    }

    fn start(&mut self, _ctx: &JobContext<'_>) -> Result<JobRun, JobError> {
        log::info!("Start array capture to '{}_chan*.arrow'", self.prefix);
        Ok(JobRun::Stream(Box::new(ArraySaver {
            prefix: self.prefix.clone(),
            files: Arc::clone(&self.files),
            arrays: Vec::new(),
        })))
    }

    fn result(&self) -> JobOutput {
        JobOutput::Files(self.files.lock().clone())
    }
}

struct ChannelArray {
    file: Option<(PathBuf, File)>,
    columns: Vec<Vec<f64>>,
}

struct ArraySaver {
    prefix: String,
    files: Arc<Mutex<Vec<PathBuf>>>,
    arrays: Vec<ChannelArray>,
}

impl SampleHandler for ArraySaver {
    fn init(&mut self, channels: &[Channel]) -> Result<(), JobError> {
        self.arrays = channels
            .iter()
            .map(|channel| -> Result<ChannelArray, JobError> {
                let file = if channel.numerical && channel.vdim > 0 {
                    let path = NpSaveJob::channel_path(&self.prefix, channel);
                    log::debug!("Opening {} for {}", path.display(), channel);
                    let file = File::create(&path)?;
                    Some((path, file))
                } else {
                    None
                };
                Ok(ChannelArray {
                    file,
                    columns: vec![Vec::new(); channel.vdim],
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(())
    }

    fn handle_samples(
        &mut self,
        samples: Vec<Sample>,
        _channel: &Channel,
        index: usize,
        progress: &mut Progress,
    ) -> Result<(), JobError> {
        let array = self
            .arrays
            .get_mut(index)
            .ok_or_else(|| JobError::Hook(format!("no array for channel index {}", index)))?;
        let take = samples.len().min(progress.remaining(index));
        if array.file.is_some() {
            for sample in samples.iter().take(take) {
                for (component, column) in array.columns.iter_mut().enumerate() {
                    column.push(sample.value(component).unwrap_or(f64::NAN));
                }
            }
        }
        progress.add(index, take);
        Ok(())
    }

    fn finalize(&mut self) -> Result<(), JobError> {
        let mut files = self.files.lock();
        for array in &mut self.arrays {
            let Some((path, mut file)) = array.file.take() else {
                continue;
            };
            let columns: Vec<Column> = array
                .columns
                .iter()
                .enumerate()
                .map(|(i, values)| {
                    Series::new(format!("v{}", i).into(), values.as_slice()).into()
                })
                .collect();
            let mut df = DataFrame::new(columns)?;
            IpcWriter::new(&mut file).finish(&mut df)?;
            file.sync_all()?;
            log::debug!("Wrote {} rows to {}", df.height(), path.display());
            files.push(path);
        }
        log::info!("Array capture done");
        Ok(())
    }
}

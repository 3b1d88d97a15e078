use std::fs::File;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use polars::prelude::*;

use crate::device::{Channel, Sample};
use crate::job::{CaptureJob, JobContext, JobError, JobOutput, JobParams, JobRun};
use crate::worker::{Progress, SampleHandler};

pub const KIND: &str = "csv";

const META_COLUMN_NAME: &str = "meta";

/// Writes each channel to `<path>_chan<N>.csv`, space separated, no header.
///
/// Options: `path` (required) is the file prefix, `metastr` (default `false`)
/// stores metadata decoded as UTF-8 instead of as a byte list.
#[derive(Debug)]
pub struct CsvJob {
    prefix: String,
    meta_string: bool,
    files: Arc<Mutex<Vec<PathBuf>>>,
}

impl CsvJob {
    pub fn create(params: &JobParams) -> Result<Box<dyn CaptureJob>, JobError> {
        Ok(Box::new(Self {
            prefix: params.required("path")?.to_string(),
            meta_string: params.parse("metastr", false)?,
            files: Arc::new(Mutex::new(Vec::new())),
        }))
    }

    pub fn channel_path(prefix: &str, channel: &Channel) -> PathBuf {
        PathBuf::from(format!("{}_chan{}.csv", prefix, channel.id))
    }
}

impl CaptureJob for CsvJob {
    fn kind(&self) -> &'static str {
        KIND
    }

    fn start(&mut self, _ctx: &JobContext<'_>) -> Result<JobRun, JobError> {
        log::info!("Start CSV capture to '{}_chan*.csv'", self.prefix);
        Ok(JobRun::Stream(Box::new(CsvWriterHandler {
            prefix: self.prefix.clone(),
            meta_string: self.meta_string,
            files: Arc::clone(&self.files),
            writers: Vec::new(),
        })))
    }

    fn result(&self) -> JobOutput {
        JobOutput::Files(self.files.lock().clone())
    }
}

struct CsvWriterHandler {
    prefix: String,
    meta_string: bool,
    files: Arc<Mutex<Vec<PathBuf>>>,
    writers: Vec<File>,
}

impl CsvWriterHandler {
    /// One column per vector component followed by the metadata column.
    fn rows(&self, channel: &Channel, samples: &[Sample]) -> Result<DataFrame, PolarsError> {
        let mut columns: Vec<Column> = (0..channel.vdim)
            .map(|i| {
                let values: Vec<Option<f64>> = samples.iter().map(|s| s.value(i)).collect();
                Series::new(format!("v{}", i).into(), values).into()
            })
            .collect();

        let meta: Vec<String> = samples
            .iter()
            .map(|s| {
                if self.meta_string {
                    String::from_utf8_lossy(&s.meta).into_owned()
                } else {
                    format!("{:?}", s.meta)
                }
            })
            .collect();
        columns.push(Series::new(META_COLUMN_NAME.into(), meta).into());

        DataFrame::new(columns)
    }
}

impl SampleHandler for CsvWriterHandler {
    fn init(&mut self, channels: &[Channel]) -> Result<(), JobError> {
        let mut files = self.files.lock();
        for channel in channels {
            let path = CsvJob::channel_path(&self.prefix, channel);
            log::debug!("Opening {} for {}", path.display(), channel);
            self.writers.push(File::create(&path)?);
            files.push(path);
        }
        Ok(())
    }

    fn handle_samples(
        &mut self,
        samples: Vec<Sample>,
        channel: &Channel,
        index: usize,
        progress: &mut Progress,
    ) -> Result<(), JobError> {
        let take = samples.len().min(progress.remaining(index));
        let mut df = self.rows(channel, &samples[..take])?;
        let file = self
            .writers
            .get_mut(index)
            .ok_or_else(|| JobError::Hook(format!("no CSV writer for channel index {}", index)))?;
        CsvWriter::new(file)
            .include_header(false)
            .with_separator(b' ')
            .finish(&mut df)?;
        progress.add(index, take);
        Ok(())
    }

    fn finalize(&mut self) -> Result<(), JobError> {
        for file in &self.writers {
            file.sync_all()?;
        }
        self.writers.clear();
        log::info!("CSV capture done");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::Target;

    #[test]
    fn test_writes_rows_per_channel() {
        let dir = std::env::temp_dir().join(format!("streamscope-csv-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let prefix = dir.join("capture").to_string_lossy().into_owned();

        let params = JobParams::new().option("path", prefix.as_str());
        let job = CsvJob::create(&params).unwrap();
        assert_eq!(job.kind(), "csv");

        let files = Arc::new(Mutex::new(Vec::new()));
        let mut handler = CsvWriterHandler {
            prefix: prefix.clone(),
            meta_string: false,
            files: Arc::clone(&files),
            writers: Vec::new(),
        };
        let channel = Channel::new(3, 3, "static");
        handler.init(std::slice::from_ref(&channel)).unwrap();

        let mut progress = Progress::new(Target::Samples(2), 1);
        let samples = vec![
            Sample::new(vec![1.0, 0.0, -1.0], Vec::new()),
            Sample::new(vec![1.0, 0.0, -1.0], Vec::new()),
            Sample::new(vec![9.0, 9.0, 9.0], Vec::new()),
        ];
        handler.handle_samples(samples, &channel, 0, &mut progress).unwrap();
        handler.finalize().unwrap();

        let path = CsvJob::channel_path(&prefix, &channel);
        assert_eq!(*files.lock(), vec![path.clone()]);
        let written = std::fs::read_to_string(&path).unwrap();
        assert_eq!(written.lines().count(), 2);
        assert!(written.lines().all(|l| l.starts_with("1.0 0.0 -1.0")));
        std::fs::remove_dir_all(&dir).unwrap();
    }
}

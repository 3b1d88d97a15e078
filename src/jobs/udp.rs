use std::net::UdpSocket;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde_json::{Map, Value};

use crate::device::{Channel, Sample};
use crate::job::{CaptureJob, JobContext, JobError, JobOutput, JobParams, JobRun};
use crate::worker::{Progress, SampleHandler};

pub const KIND: &str = "udp";

pub const DEFAULT_ADDRESS: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 9870;

/// Streams every captured sample as one JSON datagram.
///
/// Options: `address` (default `127.0.0.1`), `port` (default `9870`),
/// `format` (only `json`).
#[derive(Debug)]
pub struct UdpJob {
    address: String,
    port: u16,
    sent: Arc<AtomicUsize>,
}

impl UdpJob {
    pub fn create(params: &JobParams) -> Result<Box<dyn CaptureJob>, JobError> {
        let format = params.get("format").unwrap_or("json");
        if format != "json" {
            return Err(JobError::InvalidOption {
                name: "format".to_string(),
                reason: format!("unsupported data format '{}'", format),
            });
        }
        Ok(Box::new(Self {
            address: params.get("address").unwrap_or(DEFAULT_ADDRESS).to_string(),
            port: params.parse("port", DEFAULT_PORT)?,
            sent: Arc::new(AtomicUsize::new(0)),
        }))
    }
}

impl CaptureJob for UdpJob {
    fn kind(&self) -> &'static str {
        KIND
    }

    fn start(&mut self, _ctx: &JobContext<'_>) -> Result<JobRun, JobError> {
        log::info!("Start UDP stream to {}:{}", self.address, self.port);
        Ok(JobRun::Stream(Box::new(DatagramSender {
            destination: format!("{}:{}", self.address, self.port),
            socket: None,
            sent: Arc::clone(&self.sent),
        })))
    }

    fn result(&self) -> JobOutput {
        JobOutput::Datagrams(self.sent.load(Ordering::Relaxed))
    }
}

struct DatagramSender {
    destination: String,
    socket: Option<UdpSocket>,
    sent: Arc<AtomicUsize>,
}

/// `{"timestamp": n, "<name>": v}` or `{"timestamp": n, "<name>_<i>": v, ...}` for vectors.
fn encode(timestamp: usize, channel: &Channel, sample: &Sample) -> Value {
    let mut object = Map::new();
    object.insert("timestamp".to_string(), Value::from(timestamp));
    for (i, value) in sample.data.iter().enumerate() {
        let key = if channel.vdim > 1 {
            format!("{}_{}", channel.name, i)
        } else {
            channel.name.clone()
        };
        object.insert(key, Value::from(*value));
    }
    Value::Object(object)
}

impl SampleHandler for DatagramSender {
    fn init(&mut self, _channels: &[Channel]) -> Result<(), JobError> {
        self.socket = Some(UdpSocket::bind("0.0.0.0:0")?);
        Ok(())
    }

    fn handle_samples(
        &mut self,
        samples: Vec<Sample>,
        channel: &Channel,
        index: usize,
        progress: &mut Progress,
    ) -> Result<(), JobError> {
        let socket = self
            .socket
            .as_ref()
            .ok_or_else(|| JobError::Hook("UDP socket is not open".to_string()))?;
        let take = samples.len().min(progress.remaining(index));
        for sample in samples.iter().take(take) {
            let payload = encode(progress.get(index), channel, sample).to_string();
            socket.send_to(payload.as_bytes(), self.destination.as_str())?;
            progress.add(index, 1);
            self.sent.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    fn finalize(&mut self) -> Result<(), JobError> {
        self.socket = None;
        log::info!("UDP capture done, {} datagrams", self.sent.load(Ordering::Relaxed));
        Ok(())
    }
}

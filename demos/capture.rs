// Capture example
//
// This example runs one or more capture jobs against the simulated device,
// with channels, dividers and triggers given on the command line.

use clap::Parser;
use std::sync::Arc;
use std::time::{Duration, Instant};
use streamscope_rs::{
    ChannelSelection, Divider, JobOrchestrator, JobOutput, JobParams, JobRegistry, PollStatus,
    SimulatedDevice, TriggerMap,
};

#[derive(Parser)]
#[command(name = "capture")]
#[command(version = "1.0")]
#[command(about = "Run capture jobs on a simulated telemetry device")]
#[command(
    long_about = "Configure channels and triggers on the simulated device and run capture jobs \
                  until every job collected its samples."
)]
struct Args {
    /// Job kinds to run
    #[arg(
        short,
        long = "job",
        default_value = "printer",
        help = "Job kind: none, printer, csv, npsave, frame, udp, devinfo (repeatable)"
    )]
    jobs: Vec<String>,

    /// Channels to enable
    #[arg(short, long, default_value = "all", help = "Channel ids separated by commas, or 'all'")]
    channels: String,

    /// Divider for all channels
    #[arg(short, long, default_value_t = 1)]
    divider: u32,

    /// Trigger requests
    #[arg(short, long, help = "Trigger map, e.g. 'g:on;0:er,10,50;2:ef#0@1,0,0.5'")]
    trigger: Option<String>,

    /// Samples per channel, 0 runs until --duration elapses
    #[arg(short, long, default_value_t = 10)]
    samples: usize,

    /// Run time for unbounded captures in milliseconds
    #[arg(long, default_value_t = 1000)]
    duration: u64,

    /// File prefix for the csv and npsave jobs
    #[arg(long, default_value = "capture")]
    path: String,

    /// Destination port for the udp job
    #[arg(long, default_value_t = 9870)]
    port: u16,

    /// Enable verbose logging
    #[arg(short, long, help = "Show debug information and detailed logs")]
    verbose: bool,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    if args.verbose {
        env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Debug)
            .init();
    } else {
        env_logger::init();
    }

    let mut orchestrator = JobOrchestrator::new(JobRegistry::with_builtin());
    orchestrator.connect(Arc::new(SimulatedDevice::new()))?;

    let selection: ChannelSelection = args.channels.parse()?;
    orchestrator.channels_configure(&selection, Divider::All(args.divider))?;
    if let Some(trigger) = &args.trigger {
        orchestrator.triggers_configure(trigger.parse::<TriggerMap>()?);
    }

    println!("StreamScope Capture");
    println!("===================");
    for channel in orchestrator.channels() {
        println!("  {}", channel);
    }

    for kind in &args.jobs {
        let params = JobParams::new()
            .samples(args.samples)
            .option("path", args.path.as_str())
            .option("port", args.port.to_string());
        let id = orchestrator.enable(kind, params)?;
        println!("Enabled job {} '{}'", id, kind);
    }

    orchestrator.start()?;
    for (id, error) in orchestrator.start_failures() {
        eprintln!("✗ Job {} failed to start: {}", id, error);
    }

    let stop = orchestrator.stop_handle();
    let started = Instant::now();
    loop {
        match orchestrator.poll() {
            PollStatus::Done => break,
            PollStatus::Ready(reports) => {
                for report in reports {
                    println!("✓ Job {} '{}' finished: {:?}", report.id, report.kind, report.exit);
                    describe(&report.output);
                }
            }
        }
        if args.samples == 0 && started.elapsed() >= Duration::from_millis(args.duration) {
            stop.stop();
        }
        std::thread::sleep(Duration::from_millis(10));
    }

    orchestrator.stop();
    orchestrator.cleanup();
    Ok(())
}

fn describe(output: &JobOutput) {
    match output {
        JobOutput::Nothing => {}
        JobOutput::Counts(counts) => {
            for (channel, count) in counts {
                println!("    chan{}: {} samples", channel, count);
            }
        }
        JobOutput::Lines(lines) => println!("    {} lines printed", lines.len()),
        JobOutput::Files(files) => {
            for file in files {
                println!("    wrote {}", file.display());
            }
        }
        JobOutput::Frames(frames) => {
            for (channel, df) in frames {
                println!("    chan{}: {:?}", channel, df.shape());
            }
        }
        JobOutput::Datagrams(sent) => println!("    {} datagrams sent", sent),
        JobOutput::Channels(channels) => {
            for channel in channels {
                println!("    {}", channel);
            }
        }
    }
}

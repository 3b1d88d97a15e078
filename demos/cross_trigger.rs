// Cross-channel trigger example
//
// Channel 3 carries a constant vector and never crosses anything by itself.
// Its capture is opened by a rising edge on the saw wave of channel 0.

use std::sync::Arc;
use streamscope_rs::{
    ChannelSelection, Divider, JobOrchestrator, JobOutput, JobParams, JobRegistry,
    SimulatedDevice, TriggerMap, TriggerSpec,
};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let mut orchestrator = JobOrchestrator::new(JobRegistry::with_builtin());
    orchestrator.connect(Arc::new(SimulatedDevice::new()))?;
    orchestrator.channels_configure(&ChannelSelection::Ids(vec![0, 3]), Divider::All(1))?;

    let triggers = TriggerMap::new()
        .with(0, TriggerSpec::start_capturing_when().with_history(5).rising_edge(90.0))
        .with(
            3,
            TriggerSpec::start_capturing_when()
                .on_channel(0)
                .with_history(5)
                .rising_edge(90.0),
        );
    println!("Triggers:");
    println!("  chan0: {}", triggers.lookup(0).copied().unwrap_or_default());
    println!("  chan3: {}", triggers.lookup(3).copied().unwrap_or_default());
    orchestrator.triggers_configure(triggers);

    orchestrator.enable("frame", JobParams::new().samples(20))?;
    orchestrator.start()?;

    for report in orchestrator.ready() {
        println!("Job {} '{}': {:?}", report.id, report.kind, report.exit);
        if let JobOutput::Frames(frames) = report.output {
            for (channel, df) in frames {
                println!("chan{}:\n{}", channel, df);
            }
        }
    }

    orchestrator.cleanup();
    Ok(())
}

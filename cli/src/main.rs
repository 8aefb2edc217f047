use std::{path::Path, process::ExitCode, time::Duration};

use anyhow::{bail, Context, Result};
use log::{info, warn};

use noclock::{
    capture::Capture, BusSettings, CancelToken, DecodeWorker, NoClockAnalyzer, RunOutcome,
    MINIMUM_SAMPLE_RATE_HZ,
};

const USAGE: &str = "\
Usage:
  noclock simulate <slots> <samples> [out-file]
  noclock decode <capture-file> <slots>

<slots> lists the channel for D0, D1, ... separated by commas, with - for an
unused line, e.g. 0,1,-,3";

/// How often progress is logged while decoding.
const PROGRESS_INTERVAL: Duration = Duration::from_millis(500);

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let args: Vec<&str> = args.iter().map(String::as_str).collect();

    let result = match args.as_slice() {
        ["simulate", slots, samples] => simulate(slots, samples, None),
        ["simulate", slots, samples, out] => simulate(slots, samples, Some(Path::new(out))),
        ["decode", file, slots] => decode(Path::new(file), slots),
        _ => {
            eprintln!("{USAGE}");
            return ExitCode::from(2);
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e:?}");
            ExitCode::FAILURE
        }
    }
}

fn simulate(slots: &str, samples: &str, out: Option<&Path>) -> Result<()> {
    let settings: BusSettings = slots.parse()?;
    let samples: u64 = samples
        .parse()
        .with_context(|| format!("Invalid sample count {samples:?}"))?;

    let mut analyzer = NoClockAnalyzer::new(settings);
    let mut channels = analyzer.simulation_channels();
    analyzer.generate_simulation_data(samples, MINIMUM_SAMPLE_RATE_HZ, &mut channels);
    let capture = Capture::from_simulation(MINIMUM_SAMPLE_RATE_HZ, &channels)?;

    if let Some(out) = out {
        capture.save(out)?;
        info!("Wrote {} channels to {}", capture.num_channels(), out.display());
    }

    run(&analyzer, &capture)
}

fn decode(file: &Path, slots: &str) -> Result<()> {
    let settings: BusSettings = slots.parse()?;
    let capture = Capture::load(file)?;
    let analyzer = NoClockAnalyzer::new(settings);

    if capture.sample_rate < analyzer.minimum_sample_rate_hz() {
        warn!(
            "Capture sample rate {} Hz is below the {} Hz minimum",
            capture.sample_rate,
            analyzer.minimum_sample_rate_hz()
        );
    }

    run(&analyzer, &capture)
}

fn run(analyzer: &NoClockAnalyzer, capture: &Capture) -> Result<()> {
    let mut worker = analyzer.start(CancelToken::new(), |channel, _| capture.cursor(channel))?;

    let outcome = wait_with_progress(&mut worker)?;
    if outcome != RunOutcome::Exhausted {
        bail!("Decode stopped early ({outcome:?})");
    }

    let frames = worker.results().frames();
    for frame in &frames {
        println!("{frame}");
    }
    info!(
        "{} decoded {} frames from {} Hz capture",
        analyzer.name(),
        frames.len(),
        capture.sample_rate
    );
    Ok(())
}

fn wait_with_progress(worker: &mut DecodeWorker) -> Result<RunOutcome> {
    loop {
        if let Some(outcome) = worker.wait_timeout(PROGRESS_INTERVAL)? {
            return Ok(outcome);
        }
        info!(
            "Decoded up to sample {} ({} frames)",
            worker.progress(),
            worker.results().num_frames()
        );
    }
}

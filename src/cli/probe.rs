use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::Result;

use ktoonservative::platform::ProcStat;
use ktoonservative::sampler::{domain_load, PerCpuSample};

static RUNNING: AtomicBool = AtomicBool::new(true);

// ONE LINE PER INTERVAL: PER-CPU LOAD AND THE BUSIEST CPU
pub fn run_probe(root: &Path, interval_ms: u64, ignore_nice: bool) -> Result<()> {
    ctrlc::set_handler(move || {
        RUNNING.store(false, Ordering::Relaxed);
    })
    .ok();

    let stat = ProcStat::new(root)?;
    let mut samples: BTreeMap<u32, PerCpuSample> = BTreeMap::new();
    let interval = Duration::from_millis(interval_ms.max(1));

    while RUNNING.load(Ordering::Relaxed) {
        let mut line = String::new();
        let mut loads = Vec::new();
        for (cpu, raw) in stat.read_all()? {
            let load = samples.entry(cpu)
                .or_default()
                .sample(raw, ignore_nice);
            loads.push(load);
            match load {
                Some(l) => line.push_str(&format!("cpu{}: {:>3}%  ", cpu, l)),
                None => line.push_str(&format!("cpu{}:   -   ", cpu)),
            }
        }
        if let Some(max) = domain_load(loads) {
            println!("{}max: {}%", line, max);
        }
        std::thread::sleep(interval);
    }
    Ok(())
}

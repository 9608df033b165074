// KTOONSERVATIVE SCHEDULER
// ONE WORKER THREAD PER CPU. EVERY WORKER SAMPLES ITS OWN CPU ON THE SAME
// ALIGNED INSTANT AND PUBLISHES INTO THE DOMAIN'S LOAD BOARD. THE DOMAIN'S
// FIRST CPU WAITS A BOUNDED WINDOW FOR ITS SIBLINGS, DRAINS THE BOARD AND
// DRIVES THE GOVERNOR.
//
// AN ignore_nice_load TOGGLE IS PICKED UP WHILE WAITING: EACH WORKER RESYNCS
// ITS BASELINE OFF THE TICK PATH, SO THE NEXT SAMPLE IS A REAL DELTA.
//
// STOPPING A DOMAIN RAISES ITS FLAG AND JOINS EVERY WORKER, SO AN IN-FLIGHT
// TICK ALWAYS FINISHES BEFORE stop_domain RETURNS.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};

use crate::governor::Governor;
use crate::log::now_ns;
use crate::platform::IdleAccounting;
use crate::sampler::{domain_load, PerCpuSample};
use crate::tuning::TunableStore;

// FLOOR FOR THE TICK INTERVAL
pub const MIN_SAMPLING_US: u64 = 1_000;

// LONGEST UNINTERRUPTED SLEEP; BOUNDS STOP LATENCY
const STOP_POLL: Duration = Duration::from_millis(50);

// CAP ON HOW LONG THE CONTROL WORKER WAITS FOR SIBLING LOADS
const MAX_SETTLE: Duration = Duration::from_millis(5);
const SETTLE_POLL: Duration = Duration::from_micros(50);

const NO_SAMPLE: u32 = u32::MAX;

// MICROSECONDS UNTIL THE NEXT MULTIPLE OF THE RATE
pub fn next_delay_us(now_us: u64, rate_us: u32) -> u64 {
    let rate = (rate_us as u64).max(MIN_SAMPLING_US);
    rate - now_us % rate
}

// A QUARTER OF THE TICK, NEVER MORE THAN MAX_SETTLE
pub fn settle_window(rate_us: u32) -> Duration {
    let rate = (rate_us as u64).max(MIN_SAMPLING_US);
    Duration::from_micros(rate / 4).min(MAX_SETTLE)
}

// --- LOAD BOARD ---

// ONE SLOT PER DOMAIN CPU. WORKERS STORE, THE CONTROL WORKER SWAPS OUT.
pub struct LoadBoard {
    slots:     Vec<AtomicU32>,
    // PUBLISHES SINCE THE LAST DRAIN
    published: AtomicUsize,
}

impl LoadBoard {
    pub fn new(n: usize) -> Self {
        Self {
            slots: (0..n).map(|_| AtomicU32::new(NO_SAMPLE)).collect(),
            published: AtomicUsize::new(0),
        }
    }

    pub fn publish(&self, slot: usize, load: Option<u32>) {
        if let Some(s) = self.slots.get(slot) {
            s.store(load.unwrap_or(NO_SAMPLE), Ordering::Release);
            self.published.fetch_add(1, Ordering::AcqRel);
        }
    }

    // WAIT UNTIL EVERY SLOT PUBLISHED SINCE THE LAST DRAIN, AT MOST `window`.
    // FALSE IF SOME SIBLING MISSED IT; ITS LOAD LANDS IN THE NEXT DRAIN.
    pub fn settle(&self, window: Duration) -> bool {
        let deadline = Instant::now() + window;
        loop {
            if self.published.load(Ordering::Acquire) >= self.slots.len() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            std::thread::sleep((deadline - now).min(SETTLE_POLL));
        }
    }

    // BUSIEST CPU SINCE THE LAST DRAIN; EVERY SLOT IS CONSUMED
    pub fn drain(&self) -> Option<u32> {
        self.published.store(0, Ordering::Release);
        domain_load(self.slots.iter().map(|s| {
            match s.swap(NO_SAMPLE, Ordering::AcqRel) {
                NO_SAMPLE => None,
                l => Some(l),
            }
        }))
    }
}

// --- WORKERS ---

struct Worker {
    cpu:        u32,
    slot:       usize,
    board:      Arc<LoadBoard>,
    governor:   Arc<dyn Governor>,
    accounting: Arc<dyn IdleAccounting>,
    store:      Arc<TunableStore>,
    stop:       Arc<AtomicBool>,
}

// SLEEP UNTIL THE NEXT ALIGNED TICK. FALSE IF STOPPED MEANWHILE.
// `between` RUNS ON EVERY WAKEUP BEFORE THE DEADLINE WITH THE TIME LEFT.
fn wait_for_tick<F: FnMut(Duration)>(rate_us: u32, stop: &AtomicBool, mut between: F) -> bool {
    let delay = next_delay_us(now_ns() / 1_000, rate_us);
    let deadline = Instant::now() + Duration::from_micros(delay);
    loop {
        if stop.load(Ordering::Acquire) {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        between(deadline - now);
        std::thread::sleep((deadline - now).min(STOP_POLL));
    }
}

fn pin_to_cpu(cpu: u32) {
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_SET(cpu as usize, &mut set);
        if libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set) != 0 {
            log_debug!("CPU{}: AFFINITY NOT SET", cpu);
        }
    }
}

impl Worker {
    // NEW BASELINE AFTER A NICE TOGGLE. ONLY WITH AT LEAST HALF A TICK LEFT,
    // OTHERWISE THE NEXT DELTA WOULD BE TOO SHORT TO MEAN ANYTHING.
    fn resync_on_toggle(
        &self,
        sample: &mut PerCpuSample,
        seen: &mut u64,
        left: Duration,
        rate_us: u32,
    ) {
        let generation = self.store.nice_generation();
        if generation == *seen {
            return;
        }
        let half = Duration::from_micros((rate_us as u64).max(MIN_SAMPLING_US) / 2);
        if left < half {
            return;
        }
        *seen = generation;
        if let Some(raw) = self.accounting.read(self.cpu) {
            sample.rebaseline(raw);
            log_debug!("CPU{}: BASELINE RESYNCED", self.cpu);
        }
    }

    fn run(self) {
        pin_to_cpu(self.cpu);
        let mut sample = PerCpuSample::new();
        let mut seen = self.store.nice_generation();

        loop {
            let rate = self.store.tunables().sampling_rate;
            let ticked = wait_for_tick(rate, &self.stop, |left| {
                self.resync_on_toggle(&mut sample, &mut seen, left, rate)
            });
            if !ticked {
                break;
            }

            let ignore_nice = self.store.tunables().ignore_nice != 0;
            let load = self.accounting
                .read(self.cpu)
                .and_then(|raw| sample.sample(raw, ignore_nice));
            self.board.publish(self.slot, load);

            if self.slot == 0 {
                if !self.board.settle(settle_window(rate)) {
                    log_debug!("CPU{}: SIBLING LOADS LATE", self.cpu);
                }
                self.governor.tick(self.board.drain());
            }
        }
    }
}

struct DomainHandle {
    id:      u32,
    stop:    Arc<AtomicBool>,
    workers: Vec<JoinHandle<()>>,
}

impl DomainHandle {
    fn stop(&mut self) {
        self.stop.store(true, Ordering::Release);
        for w in self.workers.drain(..) {
            if w.join().is_err() {
                log_warn!("DOMAIN {}: WORKER PANICKED", self.id);
            }
        }
    }
}

#[derive(Default)]
pub struct Scheduler {
    domains: Vec<DomainHandle>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn domain_count(&self) -> usize {
        self.domains.len()
    }

    // cpus[0] IS THE CONTROL CPU
    pub fn spawn_domain(
        &mut self,
        id: u32,
        governor: Arc<dyn Governor>,
        cpus: &[u32],
        accounting: Arc<dyn IdleAccounting>,
        store: Arc<TunableStore>,
    ) -> Result<()> {
        let stop = Arc::new(AtomicBool::new(false));
        let board = Arc::new(LoadBoard::new(cpus.len()));
        let mut handle = DomainHandle {
            id,
            stop: stop.clone(),
            workers: Vec::with_capacity(cpus.len()),
        };

        for (slot, &cpu) in cpus.iter().enumerate() {
            let worker = Worker {
                cpu,
                slot,
                board: board.clone(),
                governor: governor.clone(),
                accounting: accounting.clone(),
                store: store.clone(),
                stop: stop.clone(),
            };
            let spawned = std::thread::Builder::new()
                .name(format!("ktoon-cpu{}", cpu))
                .spawn(move || worker.run())
                .with_context(|| format!("SPAWN WORKER FOR CPU{}", cpu));
            match spawned {
                Ok(w) => handle.workers.push(w),
                Err(e) => {
                    // NO HALF-STARTED DOMAINS
                    handle.stop();
                    return Err(e);
                }
            }
        }

        log_info!("DOMAIN {}: {} WORKERS, CONTROL CPU{}", id, cpus.len(), cpus.first().copied().unwrap_or(0));
        self.domains.push(handle);
        Ok(())
    }

    // FALSE IF NO SUCH DOMAIN IS RUNNING
    pub fn stop_domain(&mut self, id: u32) -> bool {
        match self.domains.iter().position(|d| d.id == id) {
            Some(i) => {
                let mut d = self.domains.remove(i);
                d.stop();
                true
            }
            None => false,
        }
    }

    pub fn stop_all(&mut self) {
        for mut d in self.domains.drain(..) {
            d.stop();
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.stop_all();
    }
}

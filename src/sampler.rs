// KTOONSERVATIVE LOAD SAMPLER
// RAW CUMULATIVE CPU TIMES -> ONE LOAD PERCENTAGE PER TICK.
// EACH CPU WORKER OWNS ITS PerCpuSample; NOTHING ELSE TOUCHES IT.

/// Cumulative accounting for one CPU, in any monotonic unit (jiffies, us).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CpuTimes {
    pub wall: u64,
    pub idle: u64,
    pub nice: u64,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct PerCpuSample {
    prev_wall: u64,
    prev_idle: u64,
    // TRACKED IN BOTH MODES SO A NICE TOGGLE NEVER SEES A STALE VALUE
    prev_nice: u64,
    baselined: bool,
}

impl PerCpuSample {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_baselined(&self) -> bool {
        self.baselined
    }

    // FORGET HISTORY: THE NEXT DELTA IS MEASURED FROM `raw`
    pub fn rebaseline(&mut self, raw: CpuTimes) {
        self.prev_wall = raw.wall;
        self.prev_idle = raw.idle;
        self.prev_nice = raw.nice;
        self.baselined = true;
    }

    // LOAD PERCENT SINCE THE PREVIOUS CALL, OR None WHEN THIS CPU HAS NO
    // USABLE SAMPLE (FIRST CALL, ZERO OR BACKWARDS WALL TIME).
    pub fn sample(&mut self, raw: CpuTimes, ignore_nice: bool) -> Option<u32> {
        if !self.baselined {
            self.rebaseline(raw);
            return None;
        }

        let wall_delta = raw.wall.wrapping_sub(self.prev_wall);
        let mut idle_delta = raw.idle.wrapping_sub(self.prev_idle);
        let nice_delta = raw.nice.saturating_sub(self.prev_nice);
        let backwards = raw.wall < self.prev_wall || raw.idle < self.prev_idle;
        self.prev_wall = raw.wall;
        self.prev_idle = raw.idle;
        self.prev_nice = raw.nice;

        if ignore_nice {
            idle_delta = idle_delta.saturating_add(nice_delta);
        }

        compute_load(wall_delta, idle_delta).filter(|_| !backwards)
    }
}

pub fn compute_load(wall_delta: u64, idle_delta: u64) -> Option<u32> {
    if wall_delta == 0 || wall_delta < idle_delta {
        return None;
    }
    Some((100 * (wall_delta - idle_delta) / wall_delta) as u32)
}

// DOMAIN LOAD: THE BUSIEST SAMPLED CPU
pub fn domain_load<I: IntoIterator<Item = Option<u32>>>(loads: I) -> Option<u32> {
    loads.into_iter().flatten().max()
}

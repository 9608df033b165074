// KTOONSERVATIVE HYSTERESIS DECISION ENGINE
// DOMAIN LOAD + CURRENT FREQUENCY -> AT MOST ONE HOTPLUG REQUEST AND AT MOST
// ONE FREQUENCY REQUEST PER TICK. FOUR DEBOUNCE COUNTERS PERSIST ACROSS TICKS.
//
// ORDER IS FIXED:
//   1. ONLINE GATE      (FALLS THROUGH)
//   2. RAISE            (ENDS THE TICK WHENEVER LOAD > up_threshold)
//   3. OFFLINE GATE     (FALLS THROUGH)
//   4. REDUCE           (ENDS THE TICK WHENEVER LOAD < down_threshold - 10)

use crate::tuning::Tunables;

// ROUNDING PREFERENCE WHEN THE TARGET IS NOT AN AVAILABLE STATE
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Relation {
    // LOWEST STATE AT OR ABOVE TARGET
    High,
    // HIGHEST STATE AT OR BELOW TARGET
    Low,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FreqRequest {
    pub target: u32,
    pub relation: Relation,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HotplugRequest {
    Online,
    Offline,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Decision {
    pub hotplug: Option<HotplugRequest>,
    pub frequency: Option<FreqRequest>,
}

impl Decision {
    pub fn is_empty(&self) -> bool {
        self.hotplug.is_none() && self.frequency.is_none()
    }

    // COMPACT CODE FOR THE EVENT LOG
    pub fn code(&self) -> &'static str {
        match (self.hotplug, self.frequency) {
            (None, None) => "-",
            (None, Some(_)) => "FREQ",
            (Some(HotplugRequest::Online), None) => "UP",
            (Some(HotplugRequest::Offline), None) => "DOWN",
            (Some(HotplugRequest::Online), Some(_)) => "UP+FREQ",
            (Some(HotplugRequest::Offline), Some(_)) => "DOWN+FREQ",
        }
    }
}

// WHAT THE ENGINE READS FROM THE DOMAIN EACH TICK (KHZ)
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DomainView {
    pub cur: u32,
    pub min: u32,
    pub max: u32,
    pub online: u32,
}

impl DomainView {
    pub fn clamp(&self, freq: u32) -> u32 {
        freq.min(self.max).max(self.min)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DebounceCounters {
    pub raise: u32,
    pub reduce: u32,
    pub online: u32,
    pub offline: u32,
}

impl DebounceCounters {
    fn reset_frequency(&mut self) {
        self.raise = 0;
        self.reduce = 0;
    }

    fn reset_hotplug(&mut self) {
        self.online = 0;
        self.offline = 0;
    }
}

pub struct HysteresisEngine {
    requested: u32,
    counters: DebounceCounters,
}

impl HysteresisEngine {
    pub fn new(initial: u32) -> Self {
        Self {
            requested: initial,
            counters: DebounceCounters::default(),
        }
    }

    pub fn requested(&self) -> u32 {
        self.requested
    }

    pub fn set_requested(&mut self, freq: u32) {
        self.requested = freq;
    }

    pub fn counters(&self) -> DebounceCounters {
        self.counters
    }

    pub fn tick(
        &mut self,
        view: &DomainView,
        load: u32,
        t: &Tunables,
        screen_on: bool,
    ) -> Decision {
        let mut decision = Decision::default();

        // STEP 0 IN EITHER DIRECTION: ENGINE SWITCHED OFF BY CONFIGURATION
        if !t.engine_enabled() {
            return decision;
        }

        // 1. ONLINE GATE. FREQUENCY ESCALATION BELOW IS INDEPENDENT OF IT.
        if load > t.up_threshold_hotplug
            && view.cur > t.up_freq_threshold_hotplug
            && view.online < 2
            && view.cur != view.min
        {
            self.counters.online = self.counters.online.saturating_add(1);
            if self.counters.online > t.block_cycles_online
                && (t.no_2nd_cpu_screen_off == 0 || screen_on)
            {
                decision.hotplug = Some(HotplugRequest::Online);
                self.counters.reset_hotplug();
            }
        }

        // 2. RAISE
        if load > t.up_threshold {
            self.counters.raise = self.counters.raise.saturating_add(1);
            if self.counters.raise >= t.block_cycles_raise {
                if self.requested == view.max {
                    self.counters.reset_frequency();
                    return decision;
                }
                let mut step = percent_of(t.freq_step_up, view.max);
                if step == 0 {
                    step = 5;
                }
                self.requested = view.clamp(self.requested.saturating_add(step));
                self.counters.reset_frequency();
                decision.frequency = Some(FreqRequest {
                    target: self.requested,
                    relation: Relation::High,
                });
            }
            return decision;
        }

        // 3. OFFLINE GATE
        if load < t.down_threshold_hotplug
            && t.disable_hotplugging == 0
            && view.cur < t.down_freq_threshold_hotplug
            && view.online > 1
        {
            self.counters.offline = self.counters.offline.saturating_add(1);
            if self.counters.offline > t.block_cycles_offline {
                decision.hotplug = Some(HotplugRequest::Offline);
                self.counters.reset_hotplug();
            }
        }

        // 4. REDUCE, 10 POINTS UNDER down_threshold
        if load < t.reduce_threshold() {
            self.counters.reduce = self.counters.reduce.saturating_add(1);
            if self.counters.reduce > t.block_cycles_reduce {
                if self.requested == view.min {
                    self.counters.reset_frequency();
                    return decision;
                }
                let step = percent_of(t.freq_step_down, view.max);
                self.requested = view.clamp(self.requested.saturating_sub(step));
                self.counters.reset_frequency();
                // HIGH ON THE WAY DOWN TOO
                decision.frequency = Some(FreqRequest {
                    target: self.requested,
                    relation: Relation::High,
                });
            }
            return decision;
        }

        decision
    }
}

fn percent_of(pct: u32, max: u32) -> u32 {
    (pct as u64 * max as u64 / 100) as u32
}

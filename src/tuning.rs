// KTOONSERVATIVE TUNING TYPES
// PURE-RUST MODULE: ZERO SYSFS DEPENDENCIES
// TUNABLE DEFAULTS, VALIDATED KEY/VALUE STORE, CONSISTENT PER-TICK SNAPSHOTS

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use anyhow::{bail, Context, Result};

use crate::screen::ScreenState;

// LOAD THRESHOLDS (PERCENT)

pub const DEF_UP_THRESHOLD: u32           = 57;
pub const DEF_UP_THRESHOLD_HOTPLUG: u32   = 58;
pub const DEF_DOWN_THRESHOLD: u32         = 52;
pub const DEF_DOWN_THRESHOLD_HOTPLUG: u32 = 35;

// FREQUENCY GATES FOR HOTPLUG (KHZ)

pub const DEF_UP_FREQ_THRESHOLD_HOTPLUG: u32   = 1_200_000;
pub const DEF_DOWN_FREQ_THRESHOLD_HOTPLUG: u32 = 800_000;

// DEBOUNCE CYCLES

pub const DEF_BLOCK_CYCLES_ONLINE: u32  = 10;
pub const DEF_BLOCK_CYCLES_OFFLINE: u32 = 25;
pub const DEF_BLOCK_CYCLES_RAISE: u32   = 2;
pub const DEF_BLOCK_CYCLES_REDUCE: u32  = 3;

// BOOST PULSE

pub const DEF_BOOST_CPU: u32            = 800_000;  // KHZ
pub const DEF_BOOST_TURN_ON_2ND_CORE: u32 = 1;
pub const DEF_BOOST_GPU: u32            = 350;
pub const DEF_BOOST_HOLD_CYCLES: u32    = 22;
pub const BOOST_CPU_CEILING: u32        = 2_100_000;

// SUPPORTED SECONDARY-DEVICE BOOST LEVELS. ANYTHING ELSE STORES AS 0.
pub const GPU_BOOST_LEVELS: [u32; 10] = [100, 160, 266, 350, 400, 450, 533, 612, 667, 720];

// SAMPLING (MICROSECONDS)

pub const DEF_SAMPLING_RATE: u32            = 45_000;
pub const DEF_SAMPLING_RATE_SCREEN_OFF: u32 = 45_000;
pub const DEF_SAMPLING_DOWN_FACTOR: u32     = 1;
pub const MAX_SAMPLING_DOWN_FACTOR: u32     = 10;

// STEPS (PERCENT OF MAX FREQUENCY)

pub const DEF_FREQ_STEP_UP: u32   = 5;
pub const DEF_FREQ_STEP_DOWN: u32 = 5;

// REDUCE TARGETS THIS MANY POINTS UNDER down_threshold
pub const DOWN_THRESHOLD_MARGIN: u32 = 10;

// LOWEST ACCEPTED down_threshold / down_threshold_hotplug
pub const MIN_DOWN_THRESHOLD: u32 = 11;

// FREQ THRESHOLD INPUT RANGE, IN MHZ-ISH UNITS (STORED X1000)
pub const FREQ_THRESHOLD_INPUT_MIN: u32 = 100;
pub const FREQ_THRESHOLD_INPUT_END: u32 = 2100;

pub const TUNABLE_KEYS: [&str; 22] = [
    "sampling_rate",
    "sampling_rate_screen_off",
    "sampling_down_factor",
    "up_threshold",
    "up_threshold_hotplug",
    "down_threshold",
    "down_threshold_hotplug",
    "up_freq_threshold_hotplug",
    "down_freq_threshold_hotplug",
    "block_cycles_online",
    "block_cycles_offline",
    "block_cycles_raise",
    "block_cycles_reduce",
    "boost_cpu",
    "boost_turn_on_2nd_core",
    "boost_gpu",
    "boost_hold_cycles",
    "disable_hotplugging",
    "no_2nd_cpu_screen_off",
    "ignore_nice_load",
    "freq_step_up",
    "freq_step_down",
];

// TUNABLES
// FREQUENCIES IN KHZ, RATES IN MICROSECONDS, THRESHOLDS IN PERCENT.

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Tunables {
    pub sampling_rate: u32,
    pub sampling_rate_screen_off: u32,
    pub sampling_down_factor: u32,
    pub up_threshold: u32,
    pub up_threshold_hotplug: u32,
    pub down_threshold: u32,
    pub down_threshold_hotplug: u32,
    pub up_freq_threshold_hotplug: u32,
    pub down_freq_threshold_hotplug: u32,
    pub block_cycles_online: u32,
    pub block_cycles_offline: u32,
    pub block_cycles_raise: u32,
    pub block_cycles_reduce: u32,
    pub boost_cpu: u32,
    pub boost_turn_on_2nd_core: u32,
    pub boost_gpu: u32,
    pub boost_hold_cycles: u32,
    pub disable_hotplugging: u32,
    pub no_2nd_cpu_screen_off: u32,
    pub ignore_nice: u32,
    pub freq_step_up: u32,
    pub freq_step_down: u32,
}

impl Default for Tunables {
    fn default() -> Self {
        Self {
            sampling_rate: DEF_SAMPLING_RATE,
            sampling_rate_screen_off: DEF_SAMPLING_RATE_SCREEN_OFF,
            sampling_down_factor: DEF_SAMPLING_DOWN_FACTOR,
            up_threshold: DEF_UP_THRESHOLD,
            up_threshold_hotplug: DEF_UP_THRESHOLD_HOTPLUG,
            down_threshold: DEF_DOWN_THRESHOLD,
            down_threshold_hotplug: DEF_DOWN_THRESHOLD_HOTPLUG,
            up_freq_threshold_hotplug: DEF_UP_FREQ_THRESHOLD_HOTPLUG,
            down_freq_threshold_hotplug: DEF_DOWN_FREQ_THRESHOLD_HOTPLUG,
            block_cycles_online: DEF_BLOCK_CYCLES_ONLINE,
            block_cycles_offline: DEF_BLOCK_CYCLES_OFFLINE,
            block_cycles_raise: DEF_BLOCK_CYCLES_RAISE,
            block_cycles_reduce: DEF_BLOCK_CYCLES_REDUCE,
            boost_cpu: DEF_BOOST_CPU,
            boost_turn_on_2nd_core: DEF_BOOST_TURN_ON_2ND_CORE,
            boost_gpu: DEF_BOOST_GPU,
            boost_hold_cycles: DEF_BOOST_HOLD_CYCLES,
            disable_hotplugging: 0,
            no_2nd_cpu_screen_off: 1,
            ignore_nice: 0,
            freq_step_up: DEF_FREQ_STEP_UP,
            freq_step_down: DEF_FREQ_STEP_DOWN,
        }
    }
}

// SIDE EFFECT A SUCCESSFUL STORE ASKS THE CALLER TO CARRY OUT

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StoreEffect {
    None,
    // ACTIVE BOOST PULSE MUST END
    CancelBoost,
    // PER-CPU SAMPLE BASELINES ARE STALE
    Rebaseline,
}

fn parse_input(key: &str, raw: &str) -> Result<u32> {
    raw.trim()
        .parse::<u32>()
        .with_context(|| format!("{}: NOT AN UNSIGNED INTEGER: {:?}", key, raw.trim()))
}

fn flag(input: u32) -> u32 {
    if input == 0 || input == 1 { input } else { 0 }
}

impl Tunables {
    // VALIDATE AND APPLY ONE KEY. ON ERROR NOTHING IS MODIFIED.
    pub fn apply(&mut self, key: &str, raw: &str) -> Result<StoreEffect> {
        if !TUNABLE_KEYS.contains(&key) {
            bail!("UNKNOWN TUNABLE: {}", key);
        }
        let input = parse_input(key, raw)?;

        match key {
            "sampling_rate" => {
                self.sampling_rate = input;
                return Ok(StoreEffect::CancelBoost);
            }
            "sampling_rate_screen_off" => self.sampling_rate_screen_off = input,
            "sampling_down_factor" => {
                if !(1..=MAX_SAMPLING_DOWN_FACTOR).contains(&input) {
                    bail!("{}: {} OUTSIDE 1..={}", key, input, MAX_SAMPLING_DOWN_FACTOR);
                }
                self.sampling_down_factor = input;
            }
            "up_threshold" | "up_threshold_hotplug" => {
                if input > 100 || input <= self.down_threshold {
                    bail!(
                        "{}: {} MUST BE <= 100 AND > down_threshold ({})",
                        key, input, self.down_threshold
                    );
                }
                if key == "up_threshold" {
                    self.up_threshold = input;
                } else {
                    self.up_threshold_hotplug = input;
                }
            }
            "down_threshold" | "down_threshold_hotplug" => {
                if input < MIN_DOWN_THRESHOLD || input > 100 || input >= self.up_threshold {
                    bail!(
                        "{}: {} MUST BE IN {}..=100 AND < up_threshold ({})",
                        key, input, MIN_DOWN_THRESHOLD, self.up_threshold
                    );
                }
                if key == "down_threshold" {
                    self.down_threshold = input;
                } else {
                    self.down_threshold_hotplug = input;
                }
            }
            "up_freq_threshold_hotplug" | "down_freq_threshold_hotplug" => {
                if !(FREQ_THRESHOLD_INPUT_MIN..FREQ_THRESHOLD_INPUT_END).contains(&input) {
                    bail!(
                        "{}: {} OUTSIDE {}..{}",
                        key, input, FREQ_THRESHOLD_INPUT_MIN, FREQ_THRESHOLD_INPUT_END
                    );
                }
                if key == "up_freq_threshold_hotplug" {
                    self.up_freq_threshold_hotplug = input * 1000;
                } else {
                    self.down_freq_threshold_hotplug = input * 1000;
                }
            }
            "block_cycles_online" => self.block_cycles_online = input,
            "block_cycles_offline" => self.block_cycles_offline = input,
            "block_cycles_raise" => self.block_cycles_raise = input,
            "block_cycles_reduce" => self.block_cycles_reduce = input,
            "boost_cpu" => {
                self.boost_cpu = input.saturating_mul(1000).min(BOOST_CPU_CEILING);
            }
            "boost_turn_on_2nd_core" => self.boost_turn_on_2nd_core = flag(input),
            "boost_gpu" => {
                self.boost_gpu = if GPU_BOOST_LEVELS.contains(&input) { input } else { 0 };
            }
            "boost_hold_cycles" => self.boost_hold_cycles = input,
            "disable_hotplugging" => self.disable_hotplugging = flag(input),
            "no_2nd_cpu_screen_off" => self.no_2nd_cpu_screen_off = flag(input),
            "ignore_nice_load" => {
                let input = input.min(1);
                if input == self.ignore_nice {
                    return Ok(StoreEffect::None);
                }
                self.ignore_nice = input;
                return Ok(StoreEffect::Rebaseline);
            }
            "freq_step_up" => self.freq_step_up = input.min(100),
            "freq_step_down" => self.freq_step_down = input.min(100),
            _ => unreachable!("key checked against TUNABLE_KEYS"),
        }
        Ok(StoreEffect::None)
    }

    pub fn show(&self, key: &str) -> Result<String> {
        let v = match key {
            "sampling_rate" => self.sampling_rate,
            "sampling_rate_screen_off" => self.sampling_rate_screen_off,
            "sampling_down_factor" => self.sampling_down_factor,
            "up_threshold" => self.up_threshold,
            "up_threshold_hotplug" => self.up_threshold_hotplug,
            "down_threshold" => self.down_threshold,
            "down_threshold_hotplug" => self.down_threshold_hotplug,
            "up_freq_threshold_hotplug" => self.up_freq_threshold_hotplug / 1000,
            "down_freq_threshold_hotplug" => self.down_freq_threshold_hotplug / 1000,
            "block_cycles_online" => self.block_cycles_online,
            "block_cycles_offline" => self.block_cycles_offline,
            "block_cycles_raise" => self.block_cycles_raise,
            "block_cycles_reduce" => self.block_cycles_reduce,
            "boost_cpu" => self.boost_cpu / 1000,
            "boost_turn_on_2nd_core" => self.boost_turn_on_2nd_core,
            "boost_gpu" => self.boost_gpu,
            "boost_hold_cycles" => self.boost_hold_cycles,
            "disable_hotplugging" => self.disable_hotplugging,
            "no_2nd_cpu_screen_off" => self.no_2nd_cpu_screen_off,
            "ignore_nice_load" => self.ignore_nice,
            "freq_step_up" => self.freq_step_up,
            "freq_step_down" => self.freq_step_down,
            _ => bail!("UNKNOWN TUNABLE: {}", key),
        };
        Ok(v.to_string())
    }

    // ZERO IN EITHER STEP DIRECTION SWITCHES THE HYSTERESIS ENGINE OFF
    pub fn engine_enabled(&self) -> bool {
        self.freq_step_up != 0 && self.freq_step_down != 0
    }

    // LOAD BELOW THIS COUNTS TOWARD A REDUCE
    pub fn reduce_threshold(&self) -> u32 {
        self.down_threshold.saturating_sub(DOWN_THRESHOLD_MARGIN)
    }
}

// SHARED STORE
// TUNABLES AND SCREEN STATE LIVE UNDER ONE LOCK SO A TICK SEES ONE CONSISTENT VIEW.

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Snapshot {
    pub tunables: Tunables,
    pub screen_on: bool,
}

struct Settings {
    tunables: Tunables,
    screen: ScreenState,
}

pub struct TunableStore {
    settings: RwLock<Settings>,
    // BUMPED ON EVERY ignore_nice_load CHANGE; WORKERS RESYNC BASELINES ON SIGHT
    nice_generation: AtomicU64,
}

impl Default for TunableStore {
    fn default() -> Self {
        Self::new(Tunables::default())
    }
}

impl TunableStore {
    pub fn new(tunables: Tunables) -> Self {
        Self {
            settings: RwLock::new(Settings {
                tunables,
                screen: ScreenState::new(),
            }),
            nice_generation: AtomicU64::new(0),
        }
    }

    pub fn snapshot(&self) -> Snapshot {
        let s = self.settings.read().unwrap_or_else(|e| e.into_inner());
        Snapshot {
            tunables: s.tunables,
            screen_on: s.screen.is_on(),
        }
    }

    pub fn tunables(&self) -> Tunables {
        self.snapshot().tunables
    }

    pub fn store(&self, key: &str, raw: &str) -> Result<StoreEffect> {
        let mut s = self.settings.write().unwrap_or_else(|e| e.into_inner());
        let effect = s.tunables.apply(key, raw)?;
        if effect == StoreEffect::Rebaseline {
            self.nice_generation.fetch_add(1, Ordering::AcqRel);
        }
        Ok(effect)
    }

    pub fn nice_generation(&self) -> u64 {
        self.nice_generation.load(Ordering::Acquire)
    }

    pub fn show(&self, key: &str) -> Result<String> {
        self.snapshot().tunables.show(key)
    }

    pub fn set_screen(&self, on: bool) {
        let mut s = self.settings.write().unwrap_or_else(|e| e.into_inner());
        let Settings { tunables, screen } = &mut *s;
        if on {
            screen.on_screen_on(tunables);
        } else {
            screen.on_screen_off(tunables);
        }
    }

    pub fn screen_on(&self) -> bool {
        self.snapshot().screen_on
    }
}

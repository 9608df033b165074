// KTOONSERVATIVE GOVERNOR INTEGRATION TESTS
// DOMAIN GOVERNOR OVER A MOCK PLATFORM, SCHEDULER WORKERS, CONTROL COMMANDS
//
// THE MOCK RECORDS EVERY PLATFORM CALL. NO SYSFS, NO ROOT.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Result};

use ktoonservative::control::{parse_command, Controller};
use ktoonservative::engine::{Decision, Relation};
use ktoonservative::governor::{DomainGovernor, Governor};
use ktoonservative::platform::{
    DeviceBoost, FrequencyDriver, Hotplug, IdleAccounting, Platform, Policy,
};
use ktoonservative::sampler::CpuTimes;
use ktoonservative::scheduler::Scheduler;
use ktoonservative::tuning::TunableStore;

#[derive(Clone, Debug, PartialEq, Eq)]
enum Call {
    SetTarget(u32, Relation),
    Online,
    Offline,
    DeviceBoost(u32, u32),
}

struct MockPlatform {
    cur:       AtomicU32,
    min:       AtomicU32,
    max:       AtomicU32,
    online:    AtomicU32,
    fail_freq: AtomicU32,
    // FAKE /proc/stat: EVERY READ ADVANCES wall BY 100 AND idle BY idle_step
    ticks:     AtomicU64,
    idle_step: AtomicU64,
    calls:     Mutex<Vec<Call>>,
}

impl MockPlatform {
    fn new(cur: u32, online: u32) -> Arc<Self> {
        Arc::new(Self {
            cur: AtomicU32::new(cur),
            min: AtomicU32::new(200_000),
            max: AtomicU32::new(1_800_000),
            online: AtomicU32::new(online),
            fail_freq: AtomicU32::new(0),
            ticks: AtomicU64::new(0),
            idle_step: AtomicU64::new(50),
            calls: Mutex::new(Vec::new()),
        })
    }

    fn platform(self: &Arc<Self>) -> Platform {
        Platform {
            accounting: self.clone(),
            freq: self.clone(),
            hotplug: self.clone(),
            device: self.clone(),
        }
    }

    fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    fn push(&self, c: Call) {
        self.calls.lock().unwrap().push(c);
    }
}

impl IdleAccounting for MockPlatform {
    fn read(&self, _cpu: u32) -> Option<CpuTimes> {
        let n = self.ticks.fetch_add(1, Ordering::SeqCst) + 1;
        Some(CpuTimes {
            wall: n * 100,
            idle: n * self.idle_step.load(Ordering::SeqCst),
            nice: 0,
        })
    }
}

impl FrequencyDriver for MockPlatform {
    fn policy(&self) -> Result<Policy> {
        Ok(Policy {
            cur: self.cur.load(Ordering::SeqCst),
            min: self.min.load(Ordering::SeqCst),
            max: self.max.load(Ordering::SeqCst),
        })
    }

    fn set_target(&self, target: u32, relation: Relation) -> Result<u32> {
        self.push(Call::SetTarget(target, relation));
        if self.fail_freq.load(Ordering::SeqCst) != 0 {
            bail!("SETSPEED REJECTED");
        }
        self.cur.store(target, Ordering::SeqCst);
        Ok(target)
    }
}

impl Hotplug for MockPlatform {
    fn online_count(&self) -> u32 {
        self.online.load(Ordering::SeqCst)
    }

    fn bring_online(&self) -> Result<Option<u32>> {
        self.push(Call::Online);
        self.online.fetch_add(1, Ordering::SeqCst);
        Ok(Some(1))
    }

    fn take_offline(&self) -> Result<Option<u32>> {
        self.push(Call::Offline);
        self.online.fetch_sub(1, Ordering::SeqCst);
        Ok(Some(1))
    }
}

impl DeviceBoost for MockPlatform {
    fn boost(&self, level: u32, cycles: u32) -> Result<()> {
        self.push(Call::DeviceBoost(level, cycles));
        Ok(())
    }
}

fn start(mock: &Arc<MockPlatform>, store: &Arc<TunableStore>) -> Arc<DomainGovernor> {
    Arc::new(DomainGovernor::start(0, vec![0, 1], store.clone(), mock.platform()).unwrap())
}

// === ACTIVATION ===

#[test]
fn requested_starts_at_current_frequency() {
    let mock = MockPlatform::new(1_234_000, 2);
    let g = start(&mock, &Arc::new(TunableStore::default()));
    assert_eq!(g.status().requested, 1_234_000);
    assert_eq!(g.id(), 0);
    assert_eq!(g.cpus(), &[0, 1]);
}

#[test]
fn zero_current_frequency_refuses_to_start() {
    let mock = MockPlatform::new(0, 2);
    let r = DomainGovernor::start(0, vec![0], Arc::new(TunableStore::default()), mock.platform());
    assert!(r.is_err());
}

// === DECISIONS REACH THE PLATFORM ===

#[test]
fn sustained_load_raises_then_idle_reduces() {
    let mock = MockPlatform::new(1_000_000, 1);
    let g = start(&mock, &Arc::new(TunableStore::default()));

    g.tick(Some(60));
    g.tick(Some(60));
    assert_eq!(mock.calls(), vec![Call::SetTarget(1_090_000, Relation::High)]);

    for _ in 0..4 {
        g.tick(Some(5));
    }
    assert_eq!(mock.cur.load(Ordering::SeqCst), 1_000_000);
    assert_eq!(g.status().requested, 1_000_000);
}

#[test]
fn driver_failure_keeps_intent() {
    let mock = MockPlatform::new(1_000_000, 2);
    mock.fail_freq.store(1, Ordering::SeqCst);
    let g = start(&mock, &Arc::new(TunableStore::default()));
    g.tick(Some(90));
    let d = g.tick(Some(90));
    assert!(d.frequency.is_some());
    assert_eq!(mock.cur.load(Ordering::SeqCst), 1_000_000);
    assert_eq!(g.status().requested, 1_090_000);
}

#[test]
fn offline_request_reaches_hotplug() {
    let store = Arc::new(TunableStore::default());
    store.store("block_cycles_offline", "0").unwrap();
    let mock = MockPlatform::new(500_000, 2);
    let g = start(&mock, &store);
    let d = g.tick(Some(10));
    assert_eq!(d.code(), "DOWN");
    assert_eq!(mock.online.load(Ordering::SeqCst), 1);
    assert!(mock.calls().contains(&Call::Offline));
}

#[test]
fn missing_samples_change_nothing() {
    let mock = MockPlatform::new(1_000_000, 2);
    let g = start(&mock, &Arc::new(TunableStore::default()));
    g.tick(Some(70));
    let before = g.status();
    for _ in 0..10 {
        assert_eq!(g.tick(None), Decision::default());
    }
    let after = g.status();
    assert_eq!(after.counters, before.counters);
    assert_eq!(after.requested, before.requested);
    assert!(mock.calls().is_empty());
}

// === BOOST ===

#[test]
fn boost_pulse_forces_boost_frequency_for_window() {
    let store = Arc::new(TunableStore::default());
    store.store("boost_hold_cycles", "4").unwrap();
    let mock = MockPlatform::new(300_000, 1);
    let g = start(&mock, &store);

    g.on_boost_pulse();
    // hold/2 CYCLES FOR THE DEVICE, SECOND CORE BROUGHT UP
    assert_eq!(mock.calls(), vec![Call::DeviceBoost(350, 2), Call::Online]);

    let d = g.tick(Some(0));
    assert_eq!(d.frequency.map(|f| f.target), Some(800_000));

    let mut boosted = 1;
    while g.status().boost_active {
        // ENGINE WOULD REDUCE; BOOST OWNS THE TICK
        assert!(g.tick(Some(0)).hotplug.is_none());
        boosted += 1;
    }
    assert_eq!(boosted, 5);
    assert_eq!(g.status().down_skip, 0);
    assert_eq!(g.status().requested, 800_000);
}

#[test]
fn boost_retrigger_does_not_stack() {
    let mock = MockPlatform::new(300_000, 2);
    let g = start(&mock, &Arc::new(TunableStore::default()));
    g.on_boost_pulse();
    g.tick(Some(50));
    g.tick(Some(50));
    assert_eq!(g.status().hold_count, 2);
    g.on_boost_pulse();
    let s = g.status();
    assert!(s.boost_active);
    assert_eq!(s.hold_count, 0);
    let device = mock.calls().iter().filter(|c| matches!(c, Call::DeviceBoost(..))).count();
    assert_eq!(device, 2);
}

#[test]
fn everything_disabled_pulse_is_noop() {
    let store = Arc::new(TunableStore::default());
    store.store("boost_turn_on_2nd_core", "0").unwrap();
    store.store("boost_cpu", "0").unwrap();
    store.store("boost_gpu", "0").unwrap();
    let mock = MockPlatform::new(300_000, 1);
    let g = start(&mock, &store);
    g.on_boost_pulse();
    assert!(!g.status().boost_active);
    assert!(mock.calls().is_empty());
}

// === LIMITS ===

#[test]
fn limits_change_clamps_and_reevaluates() {
    let store = Arc::new(TunableStore::default());
    store.store("block_cycles_raise", "0").unwrap();
    let mock = MockPlatform::new(300_000, 2);
    let g = start(&mock, &store);
    g.tick(Some(45));

    // NEW FLOOR ABOVE CUR: PULLED UP WITH LOW RELATION, TARGET FOLLOWS
    mock.min.store(500_000, Ordering::SeqCst);
    g.on_limits_changed(500_000, 1_800_000);
    assert_eq!(mock.calls()[0], Call::SetTarget(500_000, Relation::Low));
    assert_eq!(g.status().requested, 500_000);
    assert_eq!(g.status().min, 500_000);
}

#[test]
fn limits_change_reruns_with_last_load() {
    let store = Arc::new(TunableStore::default());
    store.store("block_cycles_raise", "0").unwrap();
    let mock = MockPlatform::new(1_000_000, 2);
    let g = start(&mock, &store);
    store.store("block_cycles_raise", "100").unwrap();
    g.tick(Some(90));
    store.store("block_cycles_raise", "0").unwrap();

    // SAME BOUNDS: NO CLAMP, BUT THE IMMEDIATE TICK RAISES ON LOAD 90
    g.on_limits_changed(200_000, 1_800_000);
    assert_eq!(mock.calls(), vec![Call::SetTarget(1_090_000, Relation::High)]);
}

#[test]
fn scheduled_tick_notices_silent_limit_change() {
    let mock = MockPlatform::new(1_500_000, 2);
    let g = start(&mock, &Arc::new(TunableStore::default()));
    mock.max.store(1_000_000, Ordering::SeqCst);
    g.tick(None);
    assert_eq!(mock.cur.load(Ordering::SeqCst), 1_000_000);
    assert_eq!(g.status().requested, 1_000_000);
    assert_eq!(g.status().max, 1_000_000);
}

// === SCREEN ===

#[test]
fn screen_notifications_swap_cadence() {
    let store = Arc::new(TunableStore::default());
    store.store("sampling_rate_screen_off", "90000").unwrap();
    let a = start(&MockPlatform::new(1_000_000, 1), &store);
    let b = start(&MockPlatform::new(1_000_000, 1), &store);
    let c = Controller::new(store.clone(), vec![a, b]);

    c.execute(&parse_command("screen off").unwrap()).unwrap();
    assert_eq!(store.tunables().sampling_rate, 90_000);
    assert!(!store.screen_on());
    c.execute(&parse_command("screen on").unwrap()).unwrap();
    assert_eq!(store.tunables().sampling_rate, 45_000);
    assert!(store.screen_on());
}

#[test]
fn screen_off_suppresses_second_core() {
    let store = Arc::new(TunableStore::default());
    store.store("block_cycles_online", "0").unwrap();
    let mock = MockPlatform::new(1_300_000, 1);
    let g = start(&mock, &store);
    let c = Controller::new(store.clone(), vec![g.clone()]);

    c.handle_line("screen off");
    assert!(g.tick(Some(90)).hotplug.is_none());
    c.handle_line("screen on");
    assert!(g.tick(Some(90)).hotplug.is_some());
}

// === CONTROL ===

#[test]
fn sampling_rate_write_cancels_boost() {
    let store = Arc::new(TunableStore::default());
    let mock = MockPlatform::new(300_000, 2);
    let g = start(&mock, &store);
    let c = Controller::new(store.clone(), vec![g.clone()]);

    c.execute(&parse_command("boost").unwrap()).unwrap();
    assert!(g.status().boost_active);
    c.execute(&parse_command("set sampling_rate 30000").unwrap()).unwrap();
    let s = g.status();
    assert!(!s.boost_active);
    assert_eq!(s.hold_count, 0);
}

#[test]
fn limits_command_targets_one_policy() {
    let store = Arc::new(TunableStore::default());
    let mock = MockPlatform::new(1_500_000, 2);
    let g = start(&mock, &store);
    let c = Controller::new(store, vec![g.clone()]);

    assert!(c.execute(&parse_command("limits 3 200000 1000000").unwrap()).is_err());
    let reply = c.execute(&parse_command("limits 0 200000 1000000").unwrap()).unwrap();
    assert_eq!(reply, "POLICY0 LIMITS 200000..1000000");
    assert_eq!(mock.cur.load(Ordering::SeqCst), 1_000_000);
}

#[test]
fn limits_command_holds_across_scheduled_ticks() {
    let store = Arc::new(TunableStore::default());
    store.store("block_cycles_raise", "0").unwrap();
    let mock = MockPlatform::new(1_500_000, 2);
    let g = start(&mock, &store);
    let c = Controller::new(store, vec![g.clone()]);

    // THE DRIVER KEEPS REPORTING 200000..1800000 THROUGHOUT
    c.execute(&parse_command("limits 0 200000 1000000").unwrap()).unwrap();
    for _ in 0..5 {
        g.tick(Some(90));
        let s = g.status();
        assert_eq!(s.max, 1_000_000);
        assert!(s.requested <= 1_000_000, "requested {} above 1000000", s.requested);
        assert!(mock.cur.load(Ordering::SeqCst) <= 1_000_000);
    }

    // WIDENING AGAIN LETS THE SAME LOAD RAISE
    c.execute(&parse_command("limits 0 200000 1800000").unwrap()).unwrap();
    assert_eq!(g.status().max, 1_800_000);
    assert_eq!(mock.cur.load(Ordering::SeqCst), 1_090_000);
}

#[test]
fn transition_outside_limits_resyncs_target() {
    let mock = MockPlatform::new(1_000_000, 2);
    let g = start(&mock, &Arc::new(TunableStore::default()));
    g.on_frequency_transition(1_200_000);
    // IN RANGE: UNCHANGED
    assert_eq!(g.status().requested, 1_000_000);
}

// === SCHEDULER ===

#[test]
fn scheduler_ticks_until_stopped() {
    let store = Arc::new(TunableStore::default());
    store.store("sampling_rate", "1000").unwrap();
    store.store("block_cycles_raise", "100").unwrap();
    let mock = MockPlatform::new(1_000_000, 2);
    // 50% IDLE PER READ -> LOAD 50 ONCE BASELINED
    let g = start(&mock, &store);

    let mut sched = Scheduler::new();
    sched.spawn_domain(0, g.clone(), &[0, 1], mock.clone(), store.clone()).unwrap();
    assert_eq!(sched.domain_count(), 1);

    let mut waited = 0;
    while g.status().last_load.is_none() && waited < 200 {
        std::thread::sleep(Duration::from_millis(10));
        waited += 1;
    }
    assert!(sched.stop_domain(0));
    assert!(!sched.stop_domain(0));

    let load = g.status().last_load;
    assert!(load.is_some(), "no tick produced a load");

    // STOPPED: READS NO LONGER ADVANCE
    let reads = mock.ticks.load(Ordering::SeqCst);
    std::thread::sleep(Duration::from_millis(30));
    assert_eq!(mock.ticks.load(Ordering::SeqCst), reads);
}

struct RecordingGovernor {
    loads: Mutex<Vec<Option<u32>>>,
}

impl Governor for RecordingGovernor {
    fn tick(&self, load: Option<u32>) -> Decision {
        self.loads.lock().unwrap().push(load);
        Decision::default()
    }
    fn on_limits_changed(&self, _min: u32, _max: u32) {}
    fn on_screen_state_changed(&self, _on: bool) {}
    fn on_boost_pulse(&self) {}
}

fn wait_for_ticks(g: &RecordingGovernor, n: usize) {
    let mut waited = 0;
    while g.loads.lock().unwrap().len() < n && waited < 500 {
        std::thread::sleep(Duration::from_millis(5));
        waited += 1;
    }
}

#[test]
fn nice_toggle_never_costs_a_tick() {
    let store = Arc::new(TunableStore::default());
    store.store("sampling_rate", "2000").unwrap();
    // EVERY READ: WALL +100, IDLE +50
    let mock = MockPlatform::new(1_000_000, 1);
    let rec = Arc::new(RecordingGovernor { loads: Mutex::new(Vec::new()) });

    let mut sched = Scheduler::new();
    sched.spawn_domain(0, rec.clone(), &[0], mock.clone(), store.clone()).unwrap();
    wait_for_ticks(&rec, 3);
    store.store("ignore_nice_load", "1").unwrap();
    let toggled_at = rec.loads.lock().unwrap().len();
    wait_for_ticks(&rec, toggled_at + 10);
    store.store("ignore_nice_load", "0").unwrap();
    let toggled_at = rec.loads.lock().unwrap().len();
    wait_for_ticks(&rec, toggled_at + 10);
    sched.stop_all();

    let loads = rec.loads.lock().unwrap().clone();
    assert!(loads.len() >= 23, "only {} ticks", loads.len());
    // ONLY THE VERY FIRST TICK, WHICH TOOK THE INITIAL BASELINE, IS EMPTY
    assert_eq!(loads[0], None);
    for (i, l) in loads.iter().enumerate().skip(1) {
        assert_eq!(*l, Some(50), "tick {}", i);
    }
}

struct CountingGovernor {
    ticks: AtomicU32,
}

impl Governor for CountingGovernor {
    fn tick(&self, _load: Option<u32>) -> Decision {
        self.ticks.fetch_add(1, Ordering::SeqCst);
        Decision::default()
    }
    fn on_limits_changed(&self, _min: u32, _max: u32) {}
    fn on_screen_state_changed(&self, _on: bool) {}
    fn on_boost_pulse(&self) {}
}

#[test]
fn only_the_control_cpu_drives_the_governor() {
    let store = Arc::new(TunableStore::default());
    store.store("sampling_rate", "1000").unwrap();
    let mock = MockPlatform::new(1_000_000, 4);
    let counting = Arc::new(CountingGovernor { ticks: AtomicU32::new(0) });

    {
        let mut sched = Scheduler::new();
        sched.spawn_domain(7, counting.clone(), &[0, 1, 2, 3], mock.clone(), store.clone()).unwrap();
        std::thread::sleep(Duration::from_millis(60));
        // DROP STOPS AND JOINS
    }
    let ticks = counting.ticks.load(Ordering::SeqCst);
    let reads = mock.ticks.load(Ordering::SeqCst);
    assert!(ticks > 0);
    // FOUR WORKERS READ, ONE TICKS
    assert!(reads >= ticks as u64);
    std::thread::sleep(Duration::from_millis(20));
    assert_eq!(counting.ticks.load(Ordering::SeqCst), ticks);
}

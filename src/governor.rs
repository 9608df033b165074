// KTOONSERVATIVE DOMAIN GOVERNOR
// OWNS EVERYTHING DOMAIN-WIDE: ENGINE (REQUESTED TARGET + DEBOUNCE COUNTERS),
// BOOST STATE, LAST LOAD, EVENT LOG. ONE MUTEX, HELD FOR A WHOLE TICK, SO A
// NOTIFICATION-DRIVEN RE-EVALUATION NEVER INTERLEAVES WITH A TIMER TICK.
//
// PLATFORM FAILURES ARE LOGGED AND SWALLOWED. THE REQUESTED TARGET KEEPS THE
// INTENT; THE NEXT TICK TRIES AGAIN FROM THERE.

use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{bail, Context, Result};

use crate::boost::BoostState;
use crate::engine::{
    DebounceCounters, Decision, DomainView, FreqRequest, HotplugRequest, HysteresisEngine,
    Relation,
};
use crate::event::{EventLog, TickRecord};
use crate::platform::{Platform, Policy};
use crate::tuning::{Snapshot, TunableStore};

pub trait Governor: Send + Sync {
    // ONE DECISION PASS. None = NO CPU IN THE DOMAIN PRODUCED A SAMPLE.
    fn tick(&self, load: Option<u32>) -> Decision;
    fn on_limits_changed(&self, min: u32, max: u32);
    fn on_screen_state_changed(&self, on: bool);
    fn on_boost_pulse(&self);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GovernorStatus {
    pub requested:    u32,
    pub min:          u32,
    pub max:          u32,
    pub last_load:    Option<u32>,
    pub boost_active: bool,
    pub hold_count:   u32,
    pub down_skip:    u32,
    pub counters:     DebounceCounters,
}

struct GovernorState {
    engine:    HysteresisEngine,
    boost:     BoostState,
    last_load: Option<u32>,
    min:       u32,
    max:       u32,
    // LAST FREQUENCY THE DRIVER REPORTED
    last_cur:  u32,
    // BOUNDS FROM THE LAST LIMITS NOTIFICATION, NARROWING THE DRIVER'S
    notified:  Option<(u32, u32)>,
    // RESERVED FOR sampling_down_factor; ONLY EVER RESET
    down_skip: u32,
    log:       EventLog,
}

pub struct DomainGovernor {
    id:       u32,
    cpus:     Vec<u32>,
    store:    Arc<TunableStore>,
    platform: Platform,
    state:    Mutex<GovernorState>,
}

impl DomainGovernor {
    // ACTIVATE: REQUESTED TARGET STARTS AT THE DOMAIN'S CURRENT FREQUENCY
    pub fn start(
        id: u32,
        cpus: Vec<u32>,
        store: Arc<TunableStore>,
        platform: Platform,
    ) -> Result<Self> {
        let policy = platform.freq.policy()
            .with_context(|| format!("POLICY{}: READ LIMITS", id))?;
        if policy.cur == 0 {
            bail!("POLICY{}: CURRENT FREQUENCY IS 0", id);
        }
        if cpus.is_empty() {
            bail!("POLICY{}: NO CPUS", id);
        }

        log_info!(
            "POLICY{}: CPUS {:?} CUR {} MIN {} MAX {}",
            id, cpus, policy.cur, policy.min, policy.max
        );

        Ok(Self {
            id,
            cpus,
            store,
            platform,
            state: Mutex::new(GovernorState {
                engine: HysteresisEngine::new(policy.cur),
                boost: BoostState::new(),
                last_load: None,
                min: policy.min,
                max: policy.max,
                last_cur: policy.cur,
                notified: None,
                down_skip: 0,
                log: EventLog::new(),
            }),
        })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn cpus(&self) -> &[u32] {
        &self.cpus
    }

    pub fn store(&self) -> &Arc<TunableStore> {
        &self.store
    }

    fn lock(&self) -> MutexGuard<'_, GovernorState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn status(&self) -> GovernorStatus {
        let st = self.lock();
        GovernorStatus {
            requested: st.engine.requested(),
            min: st.min,
            max: st.max,
            last_load: st.last_load,
            boost_active: st.boost.is_active(),
            hold_count: st.boost.hold_count(),
            down_skip: st.down_skip,
            counters: st.engine.counters(),
        }
    }

    pub fn cancel_boost(&self) {
        let mut st = self.lock();
        if st.boost.is_active() {
            log_debug!("POLICY{}: BOOST CANCELLED", self.id);
        }
        st.boost.cancel();
    }

    // A FREQUENCY CHANGE LANDED. A TARGET LEFT OUTSIDE THE LIMITS FOLLOWS IT.
    pub fn on_frequency_transition(&self, new_freq: u32) {
        let mut st = self.lock();
        resync_after_transition(&mut st, new_freq);
    }

    pub fn dump_log(&self) {
        self.lock().log.dump(&format!("POLICY{}", self.id));
    }

    pub fn summary(&self) {
        self.lock().log.summary(&format!("POLICY{}", self.id));
    }

    fn read_policy(&self) -> Option<Policy> {
        match self.platform.freq.policy() {
            Ok(p) => Some(p),
            Err(e) => {
                log_warn!("POLICY{}: {:#}", self.id, e);
                None
            }
        }
    }

    // PULL cur INTO [min, max] AND KEEP THE REQUESTED TARGET INSIDE TOO.
    // RETURNS THE FREQUENCY THE DOMAIN SHOULD NOW BE RUNNING AT.
    fn enforce_limits(&self, st: &mut GovernorState, cur: u32, min: u32, max: u32) -> u32 {
        st.min = min;
        st.max = max;

        let mut cur = cur;
        if cur > max {
            cur = self.set_frequency(max, Relation::High).unwrap_or(max);
        } else if cur < min {
            cur = self.set_frequency(min, Relation::Low).unwrap_or(min);
        }

        let requested = st.engine.requested();
        if requested > max || requested < min {
            st.engine.set_requested(cur);
        }
        cur
    }

    fn set_frequency(&self, target: u32, relation: Relation) -> Option<u32> {
        match self.platform.freq.set_target(target, relation) {
            Ok(f) => Some(f),
            Err(e) => {
                log_warn!("POLICY{}: SET {} FAILED: {:#}", self.id, target, e);
                None
            }
        }
    }

    fn bring_online(&self) {
        match self.platform.hotplug.bring_online() {
            Ok(Some(cpu)) => log_debug!("POLICY{}: CPU{} ONLINE", self.id, cpu),
            Ok(None) => {}
            Err(e) => log_warn!("POLICY{}: ONLINE FAILED: {:#}", self.id, e),
        }
    }

    fn take_offline(&self) {
        match self.platform.hotplug.take_offline() {
            Ok(Some(cpu)) => log_debug!("POLICY{}: CPU{} OFFLINE", self.id, cpu),
            Ok(None) => {}
            Err(e) => log_warn!("POLICY{}: OFFLINE FAILED: {:#}", self.id, e),
        }
    }

    fn apply(&self, decision: &Decision) {
        match decision.hotplug {
            Some(HotplugRequest::Online) => self.bring_online(),
            Some(HotplugRequest::Offline) => self.take_offline(),
            None => {}
        }
        if let Some(FreqRequest { target, relation }) = decision.frequency {
            self.set_frequency(target, relation);
        }
    }

    // ONE PASS UNDER THE LOCK. BOOST PRE-EMPTS THE ENGINE; NO LOAD, NO ENGINE.
    fn evaluate(
        &self,
        st: &mut GovernorState,
        view: &DomainView,
        load: Option<u32>,
        snap: &Snapshot,
    ) -> Decision {
        if st.boost.is_active() {
            st.down_skip = 0;
            let mut requested = st.engine.requested();
            let frequency = st.boost.tick(&mut requested, view, &snap.tunables);
            st.engine.set_requested(requested);
            return Decision { hotplug: None, frequency };
        }
        match load {
            Some(l) => st.engine.tick(view, l, &snap.tunables, snap.screen_on),
            None => Decision::default(),
        }
    }

    fn run_tick(&self, st: &mut GovernorState, view: DomainView, load: Option<u32>) -> Decision {
        let snap = self.store.snapshot();
        let from = st.engine.requested();
        let boosting = st.boost.is_active();

        let decision = self.evaluate(st, &view, load, &snap);
        self.apply(&decision);

        if !decision.is_empty() {
            log_debug!(
                "POLICY{}: LOAD {:?} CUR {} REQ {} -> {} {}",
                self.id, load, view.cur, from, st.engine.requested(), decision.code()
            );
        }
        st.log.record(TickRecord {
            load,
            cur: view.cur,
            from,
            requested: st.engine.requested(),
            online: view.online,
            boosting,
            decision,
            ..TickRecord::default()
        });
        decision
    }
}

// DRIVER LIMITS NARROWED BY THE NOTIFIED ONES. DISJOINT RANGES: THE DRIVER WINS.
pub fn effective_limits(policy: &Policy, notified: Option<(u32, u32)>) -> (u32, u32) {
    match notified {
        Some((lo, hi)) => {
            let min = policy.min.max(lo);
            let max = policy.max.min(hi);
            if min <= max {
                (min, max)
            } else {
                (policy.min, policy.max)
            }
        }
        None => (policy.min, policy.max),
    }
}

fn resync_after_transition(st: &mut GovernorState, new_freq: u32) {
    st.last_cur = new_freq;
    let requested = st.engine.requested();
    if requested > st.max || requested < st.min {
        st.engine.set_requested(new_freq);
    }
}

impl Governor for DomainGovernor {
    fn tick(&self, load: Option<u32>) -> Decision {
        let mut st = self.lock();
        let policy = match self.read_policy() {
            Some(p) => p,
            None => return Decision::default(),
        };

        if policy.cur != st.last_cur {
            resync_after_transition(&mut st, policy.cur);
        }

        // LIMITS MOVED WITHOUT A NOTIFICATION: ENFORCE BEFORE DECIDING
        let (min, max) = effective_limits(&policy, st.notified);
        let mut cur = policy.cur;
        if min != st.min || max != st.max {
            log_info!("POLICY{}: LIMITS {}..{}", self.id, min, max);
            cur = self.enforce_limits(&mut st, policy.cur, min, max);
        }

        if load.is_some() {
            st.last_load = load;
        }
        st.last_cur = cur;
        let view = DomainView {
            cur,
            min,
            max,
            online: self.platform.hotplug.online_count(),
        };
        self.run_tick(&mut st, view, load)
    }

    fn on_limits_changed(&self, min: u32, max: u32) {
        if min > max {
            log_warn!("POLICY{}: IGNORING INVERTED LIMITS {}..{}", self.id, min, max);
            return;
        }
        let mut st = self.lock();
        st.notified = Some((min, max));
        let (observed, min, max) = match self.read_policy() {
            Some(p) => {
                let (lo, hi) = effective_limits(&p, st.notified);
                (p.cur, lo, hi)
            }
            None => (st.engine.requested(), min, max),
        };
        log_info!("POLICY{}: LIMITS {}..{}", self.id, min, max);
        let cur = self.enforce_limits(&mut st, observed, min, max);
        st.last_cur = cur;

        // RE-RUN ONCE WITH THE LOAD THE LAST SCHEDULED TICK SAW
        let view = DomainView {
            cur,
            min,
            max,
            online: self.platform.hotplug.online_count(),
        };
        let load = st.last_load;
        self.run_tick(&mut st, view, load);
    }

    // THE STORE ALREADY SWITCHED CADENCE; THE NEXT TICK PICKS UP screen_on
    fn on_screen_state_changed(&self, on: bool) {
        log_debug!(
            "POLICY{}: SCREEN {} SAMPLING {}us",
            self.id,
            if on { "ON" } else { "OFF" },
            self.store.tunables().sampling_rate
        );
    }

    fn on_boost_pulse(&self) {
        let mut st = self.lock();
        let t = self.store.tunables();
        let online = self.platform.hotplug.online_count();
        let outcome = st.boost.trigger(&t, online);

        if let Some((level, cycles)) = outcome.device_boost {
            if let Err(e) = self.platform.device.boost(level, cycles) {
                log_warn!("POLICY{}: DEVICE BOOST FAILED: {:#}", self.id, e);
            }
        }
        if outcome.bring_online {
            self.bring_online();
        }
        log_debug!(
            "POLICY{}: BOOST PULSE ACTIVE={} HOLD={}",
            self.id, st.boost.is_active(), t.boost_hold_cycles
        );
    }
}

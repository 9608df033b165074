// KTOONSERVATIVE BOOST PULSE
// AN EXTERNAL PULSE FORCES boost_cpu FOR boost_hold_cycles + 1 TICKS AND
// PRE-EMPTS THE HYSTERESIS ENGINE ENTIRELY WHILE ACTIVE. RE-TRIGGERING SLIDES
// THE WINDOW; IT NEVER STACKS.

use crate::engine::{DomainView, FreqRequest, Relation};
use crate::tuning::Tunables;

// WHAT A TRIGGER ASKS THE PLATFORM TO DO
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PulseOutcome {
    // (LEVEL, CYCLES) FOR THE SECONDARY DEVICE
    pub device_boost: Option<(u32, u32)>,
    pub bring_online: bool,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BoostState {
    active: bool,
    hold_count: u32,
}

fn device_boost(t: &Tunables) -> Option<(u32, u32)> {
    if t.boost_gpu == 0 {
        return None;
    }
    Some((t.boost_gpu, t.boost_hold_cycles / 2))
}

impl BoostState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn hold_count(&self) -> u32 {
        self.hold_count
    }

    pub fn cancel(&mut self) {
        self.active = false;
        self.hold_count = 0;
    }

    pub fn trigger(&mut self, t: &Tunables, online: u32) -> PulseOutcome {
        let mut out = PulseOutcome {
            device_boost: device_boost(t),
            bring_online: false,
        };

        if self.active {
            self.hold_count = 0;
            return out;
        }

        if online < 2 && t.boost_turn_on_2nd_core != 0 {
            out.bring_online = true;
        } else if t.boost_turn_on_2nd_core == 0 && t.boost_cpu == 0 && t.boost_gpu == 0 {
            // NOTHING TO BOOST
            return out;
        }

        self.active = true;
        self.hold_count = 0;
        out
    }

    // ONE TICK WHILE ACTIVE. `requested` IS THE ENGINE'S RUNNING TARGET.
    pub fn tick(&mut self, requested: &mut u32, view: &DomainView, t: &Tunables) -> Option<FreqRequest> {
        if self.hold_count >= t.boost_hold_cycles {
            self.active = false;
            self.hold_count = 0;
        }
        // POST-EXPIRY INCREMENT IS HARMLESS: THE NEXT TRIGGER ZEROES IT
        self.hold_count = self.hold_count.saturating_add(1);

        if *requested == view.max || view.cur >= t.boost_cpu || *requested > t.boost_cpu {
            return None;
        }

        *requested = t.boost_cpu.min(view.max);
        Some(FreqRequest {
            target: *requested,
            relation: Relation::High,
        })
    }
}

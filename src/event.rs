// KTOONSERVATIVE EVENT LOG
// RECORDS ONE DECISION SNAPSHOT PER GOVERNOR TICK
// PRE-ALLOCATED RING BUFFER. NO HEAP ALLOCATION WHILE THE GOVERNOR RUNS.
// WRAPS AROUND AT CAPACITY -- OLDEST ENTRIES OVERWRITTEN.

use crate::engine::Decision;
use crate::log::now_ns;

pub const MAX_RECORDS: usize = 8192;

#[derive(Clone, Copy, Debug, Default)]
pub struct TickRecord {
    pub ts_ns:     u64,
    pub load:      Option<u32>,
    pub cur:       u32,
    // REQUESTED TARGET BEFORE AND AFTER THE TICK
    pub from:      u32,
    pub requested: u32,
    pub online:    u32,
    pub boosting:  bool,
    pub decision:  Decision,
}

impl TickRecord {
    fn raised(&self) -> bool {
        self.decision.frequency.is_some() && self.requested > self.from
    }

    fn reduced(&self) -> bool {
        self.decision.frequency.is_some() && self.requested < self.from
    }
}

pub struct EventLog {
    records: Vec<TickRecord>,
    head:    usize,
    len:     usize,
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new()
    }
}

impl EventLog {
    pub fn new() -> Self {
        Self::with_capacity(MAX_RECORDS)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            records: vec![TickRecord::default(); capacity.max(1)],
            head: 0,
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn capacity(&self) -> usize {
        self.records.len()
    }

    // STAMPS AND STORES ONE TICK. OVERWRITES OLDEST ENTRY WHEN FULL.
    pub fn record(&mut self, mut rec: TickRecord) {
        rec.ts_ns = now_ns();
        let cap = self.capacity();
        self.records[self.head] = rec;
        self.head = (self.head + 1) % cap;
        if self.len < cap {
            self.len += 1;
        }
    }

    // ITERATE RECORDS IN CHRONOLOGICAL ORDER
    pub fn iter_chronological(&self) -> impl Iterator<Item = &TickRecord> {
        let cap = self.capacity();
        let start = if self.len < cap { 0 } else { self.head };
        (0..self.len).map(move |i| &self.records[(start + i) % cap])
    }

    // DUMP THE TIME SERIES AFTER EXECUTION
    pub fn dump(&self, label: &str) {
        let mut iter = self.iter_chronological();
        let first = match iter.next() {
            Some(f) => f,
            None => return,
        };
        let base_ts = first.ts_ns;

        println!("\n{}", label);
        println!("{:<10} {:<6} {:<10} {:<10} {:<7} {:<6} {:<10}",
            "TIME_S", "LOAD", "CUR", "REQ", "ONLINE", "BOOST", "ACTION");
        println!("{}", "-".repeat(66));

        for r in std::iter::once(first).chain(iter) {
            let elapsed_s = r.ts_ns.saturating_sub(base_ts) as f64 / 1_000_000_000.0;
            let load = match r.load {
                Some(l) => l.to_string(),
                None => "-".to_string(),
            };
            println!("{:<10.3} {:<6} {:<10} {:<10} {:<7} {:<6} {:<10}",
                elapsed_s, load, r.cur, r.requested, r.online,
                if r.boosting { "Y" } else { "" }, r.decision.code());
        }

        if self.len == self.capacity() {
            println!("\n(RING BUFFER WRAPPED -- SHOWING MOST RECENT {} TICKS)", self.capacity());
        }
        println!("TOTAL TICKS: {}", self.len);
    }

    pub fn summary(&self, label: &str) {
        if self.len < 2 {
            return;
        }

        let records: Vec<&TickRecord> = self.iter_chronological().collect();

        let raises = records.iter().filter(|r| r.raised()).count();
        let reduces = records.iter().filter(|r| r.reduced()).count();
        let onlines = records.iter()
            .filter(|r| r.decision.code().starts_with("UP"))
            .count();
        let offlines = records.iter()
            .filter(|r| r.decision.code().starts_with("DOWN"))
            .count();
        let boost_ticks = records.iter().filter(|r| r.boosting).count();

        let loads: Vec<u32> = records.iter().filter_map(|r| r.load).collect();
        let peak_load = loads.iter().copied().max().unwrap_or(0);
        let avg_load = if loads.is_empty() {
            0.0
        } else {
            loads.iter().map(|&l| l as u64).sum::<u64>() as f64 / loads.len() as f64
        };

        let elapsed_ns = records[records.len() - 1].ts_ns.saturating_sub(records[0].ts_ns);
        let elapsed_s = elapsed_ns as f64 / 1_000_000_000.0;

        println!("\n{}", "=".repeat(50));
        println!("KTOONSERVATIVE SUMMARY: {}", label);
        println!("{}", "=".repeat(50));
        println!("  TICKS:             {}", self.len);
        println!("  RAISES:            {}", raises);
        println!("  REDUCES:           {}", reduces);
        println!("  CPU ONLINE:        {}", onlines);
        println!("  CPU OFFLINE:       {}", offlines);
        println!("  BOOST TICKS:       {}", boost_ticks);
        println!("  PEAK LOAD:         {}%", peak_load);
        println!("  AVG LOAD:          {:.1}%", avg_load);
        println!("  SKIPPED SAMPLES:   {}", records.len() - loads.len());
        println!("  ELAPSED:           {:.1}s", elapsed_s);
    }
}

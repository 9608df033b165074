// KTOONSERVATIVE PLATFORM
// THE COLLABORATORS THE GOVERNOR DRIVES, AS TRAITS, PLUS THEIR LINUX
// IMPLEMENTATIONS OVER /proc/stat AND /sys/devices/system/cpu.
//
// EVERY PATH HANGS OFF A CONFIGURABLE ROOT SO TESTS CAN FAKE THE TREE.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use regex::Regex;

use crate::engine::Relation;
use crate::sampler::CpuTimes;

const CPU_DIR: &str = "sys/devices/system/cpu";
const CPUFREQ_DIR: &str = "sys/devices/system/cpu/cpufreq";
const PROC_STAT: &str = "proc/stat";
const USERSPACE_GOVERNOR: &str = "userspace";

// --- TRAITS ---

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Policy {
    pub cur: u32,
    pub min: u32,
    pub max: u32,
}

pub trait IdleAccounting: Send + Sync {
    // None WHEN THE CPU HAS NO ACCOUNTING (OFFLINE, UNREADABLE)
    fn read(&self, cpu: u32) -> Option<CpuTimes>;
}

pub trait FrequencyDriver: Send + Sync {
    fn policy(&self) -> Result<Policy>;
    // RETURNS THE STATE ACTUALLY WRITTEN
    fn set_target(&self, target: u32, relation: Relation) -> Result<u32>;
}

pub trait Hotplug: Send + Sync {
    fn online_count(&self) -> u32;
    // LOWEST ELIGIBLE CPU, NEVER THE CONTROL CPU. Ok(None) WHEN NOTHING TO DO.
    fn bring_online(&self) -> Result<Option<u32>>;
    fn take_offline(&self) -> Result<Option<u32>>;
}

pub trait DeviceBoost: Send + Sync {
    fn boost(&self, level: u32, cycles: u32) -> Result<()>;
}

#[derive(Clone)]
pub struct Platform {
    pub accounting: Arc<dyn IdleAccounting>,
    pub freq: Arc<dyn FrequencyDriver>,
    pub hotplug: Arc<dyn Hotplug>,
    pub device: Arc<dyn DeviceBoost>,
}

// --- HELPERS ---

fn read_trimmed(path: &Path) -> Result<String> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("READ {}", path.display()))?;
    Ok(raw.trim().to_string())
}

fn read_u32(path: &Path) -> Result<u32> {
    let raw = read_trimmed(path)?;
    raw.parse::<u32>()
        .with_context(|| format!("PARSE {}: {:?}", path.display(), raw))
}

fn write_value(path: &Path, value: &str) -> Result<()> {
    fs::write(path, value).with_context(|| format!("WRITE {:?} TO {}", value, path.display()))
}

// PARSE "0-3,6" OR "0 1 2 3" INTO A SORTED CPU LIST
pub fn parse_cpu_list(raw: &str) -> Vec<u32> {
    let mut cpus = Vec::new();
    for range in raw.trim().split(|c: char| c == ',' || c.is_whitespace()) {
        if range.is_empty() {
            continue;
        }
        let parts: Vec<&str> = range.split('-').collect();
        match parts.len() {
            1 => {
                if let Ok(cpu) = parts[0].parse::<u32>() {
                    cpus.push(cpu);
                }
            }
            2 => {
                if let (Ok(lo), Ok(hi)) = (parts[0].parse::<u32>(), parts[1].parse::<u32>()) {
                    cpus.extend(lo..=hi);
                }
            }
            _ => {}
        }
    }
    cpus.sort_unstable();
    cpus.dedup();
    cpus
}

// PICK THE AVAILABLE STATE FOR `target` WITHIN [min, max].
// EMPTY TABLE: THE CLAMPED TARGET ITSELF.
pub fn resolve_target(table: &[u32], policy: &Policy, target: u32, relation: Relation) -> u32 {
    let target = target.min(policy.max).max(policy.min);
    let states: Vec<u32> = table.iter()
        .copied()
        .filter(|&f| f >= policy.min && f <= policy.max)
        .collect();
    if states.is_empty() {
        return target;
    }
    match relation {
        Relation::High => states.iter()
            .copied()
            .find(|&f| f >= target)
            .unwrap_or(states[states.len() - 1]),
        Relation::Low => states.iter()
            .rev()
            .copied()
            .find(|&f| f <= target)
            .unwrap_or(states[0]),
    }
}

// --- /proc/stat ---

pub struct ProcStat {
    path: PathBuf,
    line_re: Regex,
}

impl ProcStat {
    pub fn new(root: &Path) -> Result<Self> {
        Ok(Self {
            path: root.join(PROC_STAT),
            line_re: Regex::new(r"(?m)^cpu(\d+)\s+(.*)$")?,
        })
    }

    pub fn read_all(&self) -> Result<Vec<(u32, CpuTimes)>> {
        let raw = fs::read_to_string(&self.path)
            .with_context(|| format!("READ {}", self.path.display()))?;
        Ok(self.parse(&raw))
    }

    // user nice system idle iowait irq softirq steal [guest guest_nice]
    // GUEST TIME IS ALREADY FOLDED INTO user/nice, SO ONLY THE FIRST 8 COUNT.
    pub fn parse(&self, raw: &str) -> Vec<(u32, CpuTimes)> {
        let mut out = Vec::new();
        for caps in self.line_re.captures_iter(raw) {
            let cpu = match caps[1].parse::<u32>() {
                Ok(c) => c,
                Err(_) => continue,
            };
            let fields: Vec<u64> = caps[2].split_whitespace()
                .filter_map(|s| s.parse().ok())
                .collect();
            if fields.len() < 4 {
                continue;
            }
            let wall: u64 = fields.iter().take(8).sum();
            let idle = fields[3] + fields.get(4).copied().unwrap_or(0);
            out.push((cpu, CpuTimes { wall, idle, nice: fields[1] }));
        }
        out
    }
}

impl IdleAccounting for ProcStat {
    fn read(&self, cpu: u32) -> Option<CpuTimes> {
        self.read_all().ok()?
            .into_iter()
            .find(|(c, _)| *c == cpu)
            .map(|(_, t)| t)
    }
}

// --- CPUFREQ POLICY ---

pub struct SysfsCpufreq {
    dir: PathBuf,
    id: u32,
    cpus: Vec<u32>,
    table: Vec<u32>,
}

impl SysfsCpufreq {
    pub fn open(dir: &Path) -> Result<Self> {
        let name = dir.file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default();
        let id = match name.strip_prefix("policy").map(str::parse::<u32>) {
            Some(Ok(id)) => id,
            _ => bail!("NOT A CPUFREQ POLICY DIRECTORY: {}", dir.display()),
        };

        let cpus_raw = read_trimmed(&dir.join("related_cpus"))
            .or_else(|_| read_trimmed(&dir.join("affected_cpus")))?;
        let cpus = parse_cpu_list(&cpus_raw);
        if cpus.is_empty() {
            bail!("POLICY{} HAS NO CPUS", id);
        }

        let mut table: Vec<u32> = read_trimmed(&dir.join("scaling_available_frequencies"))
            .map(|raw| raw.split_whitespace().filter_map(|s| s.parse().ok()).collect())
            .unwrap_or_default();
        table.sort_unstable();
        table.dedup();

        Ok(Self {
            dir: dir.to_path_buf(),
            id,
            cpus,
            table,
        })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn cpus(&self) -> &[u32] {
        &self.cpus
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn table(&self) -> &[u32] {
        &self.table
    }

    pub fn governor(&self) -> Result<String> {
        read_trimmed(&self.dir.join("scaling_governor"))
    }
}

impl FrequencyDriver for SysfsCpufreq {
    fn policy(&self) -> Result<Policy> {
        Ok(Policy {
            cur: read_u32(&self.dir.join("scaling_cur_freq"))?,
            min: read_u32(&self.dir.join("scaling_min_freq"))?,
            max: read_u32(&self.dir.join("scaling_max_freq"))?,
        })
    }

    fn set_target(&self, target: u32, relation: Relation) -> Result<u32> {
        let policy = self.policy()?;
        let freq = resolve_target(&self.table, &policy, target, relation);
        write_value(&self.dir.join("scaling_setspeed"), &freq.to_string())?;
        Ok(freq)
    }
}

// ALL POLICIES UNDER THE ROOT, IN POLICY ORDER
pub fn discover_domains(root: &Path) -> Result<Vec<SysfsCpufreq>> {
    let base = root.join(CPUFREQ_DIR);
    let entries = fs::read_dir(&base)
        .with_context(|| format!("READ DIR {}", base.display()))?;
    let mut domains = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        let is_policy = path.file_name()
            .and_then(|n| n.to_str())
            .map(|n| n.starts_with("policy"))
            .unwrap_or(false);
        if !is_policy {
            continue;
        }
        match SysfsCpufreq::open(&path) {
            Ok(d) => domains.push(d),
            Err(e) => log_warn!("SKIPPING {}: {:#}", path.display(), e),
        }
    }
    domains.sort_by_key(|d| d.id());
    Ok(domains)
}

// SWITCHES A POLICY TO THE USERSPACE GOVERNOR; PUTS THE OLD ONE BACK ON DROP
pub struct GovernorClaim {
    path: PathBuf,
    previous: String,
}

impl GovernorClaim {
    pub fn claim(domain: &SysfsCpufreq) -> Result<Self> {
        let path = domain.dir().join("scaling_governor");
        let previous = read_trimmed(&path)?;
        if previous != USERSPACE_GOVERNOR {
            write_value(&path, USERSPACE_GOVERNOR)?;
            log_info!("POLICY{}: GOVERNOR {} -> {}", domain.id(), previous, USERSPACE_GOVERNOR);
        }
        Ok(Self { path, previous })
    }
}

impl Drop for GovernorClaim {
    fn drop(&mut self) {
        if self.previous != USERSPACE_GOVERNOR {
            if let Err(e) = write_value(&self.path, &self.previous) {
                log_warn!("GOVERNOR RESTORE FAILED: {:#}", e);
            }
        }
    }
}

// --- HOTPLUG ---

pub struct SysfsHotplug {
    cpu_dir: PathBuf,
    domain: Vec<u32>,
    control_cpu: u32,
}

impl SysfsHotplug {
    pub fn new(root: &Path, domain: &[u32], control_cpu: u32) -> Self {
        Self {
            cpu_dir: root.join(CPU_DIR),
            domain: domain.to_vec(),
            control_cpu,
        }
    }

    fn list(&self, name: &str) -> Vec<u32> {
        read_trimmed(&self.cpu_dir.join(name))
            .map(|raw| parse_cpu_list(&raw))
            .unwrap_or_default()
    }

    pub fn online(&self) -> Vec<u32> {
        let online = self.list("online");
        self.domain.iter().copied().filter(|c| online.contains(c)).collect()
    }

    fn set_online(&self, cpu: u32, on: bool) -> Result<()> {
        let path = self.cpu_dir.join(format!("cpu{}", cpu)).join("online");
        write_value(&path, if on { "1" } else { "0" })
    }
}

impl Hotplug for SysfsHotplug {
    fn online_count(&self) -> u32 {
        // THE CONTROL CPU IS RUNNING THIS CODE: AT LEAST ONE
        (self.online().len() as u32).max(1)
    }

    fn bring_online(&self) -> Result<Option<u32>> {
        let online = self.online();
        let possible = self.list("possible");
        let candidate = self.domain.iter()
            .copied()
            .filter(|c| *c != self.control_cpu && possible.contains(c) && !online.contains(c))
            .min();
        match candidate {
            Some(cpu) => {
                self.set_online(cpu, true)?;
                Ok(Some(cpu))
            }
            None => Ok(None),
        }
    }

    fn take_offline(&self) -> Result<Option<u32>> {
        let candidate = self.online()
            .into_iter()
            .filter(|c| *c != self.control_cpu)
            .min();
        match candidate {
            Some(cpu) => {
                self.set_online(cpu, false)?;
                Ok(Some(cpu))
            }
            None => Ok(None),
        }
    }
}

// --- SECONDARY DEVICE BOOST ---

pub struct DeviceBoostFile {
    path: PathBuf,
}

impl DeviceBoostFile {
    pub fn new(path: &Path) -> Self {
        Self { path: path.to_path_buf() }
    }
}

impl DeviceBoost for DeviceBoostFile {
    fn boost(&self, level: u32, cycles: u32) -> Result<()> {
        write_value(&self.path, &format!("{} {}\n", level, cycles))
    }
}

pub struct NoDeviceBoost;

impl DeviceBoost for NoDeviceBoost {
    fn boost(&self, level: u32, cycles: u32) -> Result<()> {
        log_debug!("DEVICE BOOST {} FOR {} CYCLES (NO DEVICE CONFIGURED)", level, cycles);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch(name: &str) -> PathBuf {
        let dir = std::env::temp_dir()
            .join(format!("ktoon-platform-{}-{}", std::process::id(), name));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn put(path: PathBuf, content: &str) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    #[test]
    fn cpu_list_formats() {
        assert_eq!(parse_cpu_list("0-3"), vec![0, 1, 2, 3]);
        assert_eq!(parse_cpu_list("0,2-3\n"), vec![0, 2, 3]);
        assert_eq!(parse_cpu_list("0 1 2 3"), vec![0, 1, 2, 3]);
        assert_eq!(parse_cpu_list(""), Vec::<u32>::new());
        assert_eq!(parse_cpu_list("x,1"), vec![1]);
    }

    #[test]
    fn resolve_high_and_low() {
        let table = [200_000, 500_000, 800_000, 1_200_000, 1_800_000];
        let p = Policy { cur: 500_000, min: 200_000, max: 1_800_000 };
        assert_eq!(resolve_target(&table, &p, 600_000, Relation::High), 800_000);
        assert_eq!(resolve_target(&table, &p, 600_000, Relation::Low), 500_000);
        assert_eq!(resolve_target(&table, &p, 800_000, Relation::High), 800_000);
        assert_eq!(resolve_target(&table, &p, 5_000_000, Relation::High), 1_800_000);
        assert_eq!(resolve_target(&table, &p, 0, Relation::Low), 200_000);
        assert_eq!(resolve_target(&[], &p, 654_321, Relation::High), 654_321);
    }

    #[test]
    fn resolve_respects_policy_limits() {
        let table = [200_000, 500_000, 800_000, 1_200_000, 1_800_000];
        let p = Policy { cur: 500_000, min: 500_000, max: 1_200_000 };
        assert_eq!(resolve_target(&table, &p, 1_500_000, Relation::High), 1_200_000);
        assert_eq!(resolve_target(&table, &p, 100_000, Relation::High), 500_000);
    }

    #[test]
    fn proc_stat_parses_per_cpu_lines() {
        let ps = ProcStat::new(Path::new("/")).unwrap();
        let raw = "cpu  10 20 30 40 50 60 70 80 0 0\n\
                   cpu0 1 2 3 4 5 6 7 8 9 10\n\
                   cpu1 100 0 100 800 0 0 0 0\n\
                   intr 12345\n";
        let cpus = ps.parse(raw);
        assert_eq!(cpus.len(), 2);
        assert_eq!(cpus[0], (0, CpuTimes { wall: 36, idle: 9, nice: 2 }));
        assert_eq!(cpus[1], (1, CpuTimes { wall: 1000, idle: 800, nice: 0 }));
    }

    #[test]
    fn proc_stat_reads_from_root() {
        let root = scratch("procstat");
        put(root.join("proc/stat"), "cpu 1 1 1 1\ncpu3 5 5 5 5 5 0 0 0\n");
        let ps = ProcStat::new(&root).unwrap();
        assert_eq!(ps.read(3), Some(CpuTimes { wall: 25, idle: 10, nice: 5 }));
        assert_eq!(ps.read(0), None);
        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn cpufreq_policy_and_setspeed() {
        let root = scratch("cpufreq");
        let dir = root.join(CPUFREQ_DIR).join("policy0");
        put(dir.join("related_cpus"), "0 1\n");
        put(dir.join("scaling_available_frequencies"), "1800000 200000 800000 \n");
        put(dir.join("scaling_cur_freq"), "800000\n");
        put(dir.join("scaling_min_freq"), "200000\n");
        put(dir.join("scaling_max_freq"), "1800000\n");
        put(dir.join("scaling_setspeed"), "<unsupported>\n");
        put(dir.join("scaling_governor"), "ondemand\n");

        let domains = discover_domains(&root).unwrap();
        assert_eq!(domains.len(), 1);
        let d = &domains[0];
        assert_eq!(d.id(), 0);
        assert_eq!(d.cpus(), &[0, 1]);
        assert_eq!(d.table(), &[200_000, 800_000, 1_800_000]);
        assert_eq!(d.policy().unwrap(), Policy { cur: 800_000, min: 200_000, max: 1_800_000 });

        assert_eq!(d.set_target(900_000, Relation::High).unwrap(), 1_800_000);
        assert_eq!(fs::read_to_string(dir.join("scaling_setspeed")).unwrap(), "1800000");

        {
            let _claim = GovernorClaim::claim(d).unwrap();
            assert_eq!(d.governor().unwrap(), "userspace");
        }
        assert_eq!(d.governor().unwrap(), "ondemand");
        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn hotplug_skips_control_cpu() {
        let root = scratch("hotplug");
        let cpu = root.join(CPU_DIR);
        put(cpu.join("possible"), "0-3\n");
        put(cpu.join("online"), "0,2\n");
        for n in 1..4 {
            put(cpu.join(format!("cpu{}/online", n)), if n == 2 { "1" } else { "0" });
        }
        let hp = SysfsHotplug::new(&root, &[0, 1, 2, 3], 0);
        assert_eq!(hp.online_count(), 2);
        assert_eq!(hp.bring_online().unwrap(), Some(1));
        assert_eq!(fs::read_to_string(cpu.join("cpu1/online")).unwrap(), "1");
        assert_eq!(hp.take_offline().unwrap(), Some(2));
        assert_eq!(fs::read_to_string(cpu.join("cpu2/online")).unwrap(), "0");

        put(cpu.join("online"), "0\n");
        assert_eq!(hp.take_offline().unwrap(), None);
        assert_eq!(hp.online_count(), 1);
        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn device_boost_file_format() {
        let root = scratch("gpu");
        let path = root.join("boost");
        DeviceBoostFile::new(&path).boost(350, 11).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "350 11\n");
        assert!(NoDeviceBoost.boost(350, 11).is_ok());
        let _ = fs::remove_dir_all(&root);
    }
}

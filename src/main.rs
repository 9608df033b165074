// KTOONSERVATIVE -- HYSTERESIS CPUFREQ GOVERNOR + CORE HOTPLUG DAEMON
// DRIVES THE USERSPACE CPUFREQ GOVERNOR OF EVERY POLICY ON THE MACHINE
//
// DECISIONS: PER-DOMAIN HYSTERESIS ENGINE + BOOST PULSE (LIBRARY)
// THIS BINARY: CONFIGURATION, WIRING, CONTROL CHANNEL, REPORTING

mod cli;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};

use ktoonservative::control::{self, Controller};
use ktoonservative::governor::DomainGovernor;
use ktoonservative::platform::{
    discover_domains, DeviceBoost, DeviceBoostFile, GovernorClaim, IdleAccounting,
    NoDeviceBoost, Platform, ProcStat, SysfsHotplug,
};
use ktoonservative::scheduler::Scheduler;
use ktoonservative::tuning::{TunableStore, TUNABLE_KEYS};
use ktoonservative::{log_info, log_warn};

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

#[derive(Parser)]
#[command(name = "ktoonservative")]
#[command(about = "KTOONSERVATIVE -- HYSTERESIS CPUFREQ GOVERNOR WITH CORE HOTPLUG")]
struct Cli {
    #[command(subcommand)]
    command: Option<Cmd>,

    // ROOT FOR /proc AND /sys LOOKUPS
    #[arg(long, global = true, default_value = "/")]
    sysfs_root: PathBuf,

    // TUNABLE OVERRIDE, REPEATABLE: --set up_threshold=70
    #[arg(long = "set", value_name = "KEY=VALUE")]
    overrides: Vec<String>,

    // NAMED PIPE FOR boost / screen / set / get / limits COMMANDS
    #[arg(long)]
    control: Option<PathBuf>,

    // FILE RECEIVING "<level> <cycles>" ON EVERY BOOST PULSE
    #[arg(long)]
    gpu_boost_path: Option<PathBuf>,

    // SWITCH EVERY POLICY TO THE USERSPACE GOVERNOR, RESTORE ON EXIT
    #[arg(long)]
    claim_governor: bool,

    // PRINT VERBOSE OUTPUT
    #[arg(long)]
    verbose: bool,

    // DUMP FULL DECISION LOG ON EXIT
    #[arg(long)]
    dump_log: bool,
}

#[derive(Subcommand)]
enum Cmd {
    // VERIFY KERNEL CONFIG AND SYSFS FILES
    Check,
    // PRINT PER-CPU LOAD EACH INTERVAL
    Probe {
        #[arg(long, default_value_t = 1000)]
        interval_ms: u64,
        #[arg(long)]
        ignore_nice: bool,
    },
    // PRINT EVERY TUNABLE AFTER OVERRIDES
    Tunables,
}

fn build_store(overrides: &[String]) -> Result<TunableStore> {
    let store = TunableStore::default();
    for o in overrides {
        let (key, value) = match o.split_once('=') {
            Some(kv) => kv,
            None => bail!("--set {}: EXPECTED KEY=VALUE", o),
        };
        store.store(key.trim(), value.trim())
            .with_context(|| format!("--set {}", o))?;
    }
    Ok(store)
}

fn print_tunables(store: &TunableStore) -> Result<()> {
    for key in TUNABLE_KEYS {
        println!("{:<28} {}", key, store.show(key)?);
    }
    Ok(())
}

fn run(cli: Cli) -> Result<()> {
    ktoonservative::log::set_verbose(cli.verbose);
    let store = Arc::new(build_store(&cli.overrides)?);
    let root = cli.sysfs_root.as_path();

    let domains = discover_domains(root)?;
    if domains.is_empty() {
        bail!("NO CPUFREQ POLICIES UNDER {}", root.display());
    }

    let accounting: Arc<dyn IdleAccounting> = Arc::new(ProcStat::new(root)?);
    let device: Arc<dyn DeviceBoost> = match &cli.gpu_boost_path {
        Some(p) => Arc::new(DeviceBoostFile::new(p)),
        None => Arc::new(NoDeviceBoost),
    };

    println!("KTOONSERVATIVE v{}", env!("CARGO_PKG_VERSION"));
    println!("ROOT:            {}", root.display());
    println!("POLICIES:        {}", domains.len());
    println!("SAMPLING:        {} us", store.tunables().sampling_rate);
    println!("CONTROL:         {}", cli.control.as_ref()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "none".to_string()));
    println!("VERBOSE:         {}", cli.verbose);
    println!();

    // CLAIMS DROP AFTER THE SCHEDULER STOPS: DECLARED FIRST
    let mut claims: Vec<GovernorClaim> = Vec::new();
    let mut sched = Scheduler::new();
    let mut governors: Vec<Arc<DomainGovernor>> = Vec::new();

    for domain in domains {
        if cli.claim_governor {
            claims.push(GovernorClaim::claim(&domain)?);
        } else if domain.governor().map(|g| g != "userspace").unwrap_or(true) {
            log_warn!("POLICY{}: GOVERNOR IS NOT userspace, SETSPEED WRITES MAY FAIL", domain.id());
        }

        let id = domain.id();
        let cpus = domain.cpus().to_vec();
        let control_cpu = cpus[0];
        let platform = Platform {
            accounting: accounting.clone(),
            hotplug: Arc::new(SysfsHotplug::new(root, &cpus, control_cpu)),
            device: device.clone(),
            freq: Arc::new(domain),
        };
        let governor = Arc::new(DomainGovernor::start(id, cpus.clone(), store.clone(), platform)?);
        sched.spawn_domain(id, governor.clone(), &cpus, accounting.clone(), store.clone())?;
        governors.push(governor);
    }

    ctrlc::set_handler(move || {
        SHUTDOWN.store(true, Ordering::Relaxed);
    })?;

    let control_thread = match cli.control {
        Some(path) => {
            let controller = Arc::new(Controller::new(store.clone(), governors.clone()));
            Some(control::spawn_reader(path, controller, &SHUTDOWN)?)
        }
        None => None,
    };

    println!("KTOONSERVATIVE IS ACTIVE (CTRL+C TO EXIT)");

    while !SHUTDOWN.load(Ordering::Relaxed) {
        std::thread::sleep(Duration::from_secs(1));
        if !cli.verbose {
            continue;
        }
        let screen = if store.screen_on() { "on" } else { "off" };
        for g in &governors {
            let s = g.status();
            let load = s.last_load.map(|l| l.to_string()).unwrap_or_else(|| "-".to_string());
            println!(
                "policy{}: load: {:<4} req: {:<8} limits: {}..{} boost: {} hold: {:<3} raise: {} reduce: {} online: {} offline: {} screen: {}",
                g.id(), load, s.requested, s.min, s.max,
                if s.boost_active { "Y" } else { "N" }, s.hold_count,
                s.counters.raise, s.counters.reduce, s.counters.online, s.counters.offline,
                screen
            );
        }
    }

    println!("KTOONSERVATIVE IS SHUTTING DOWN");
    sched.stop_all();
    if let Some(h) = control_thread {
        if h.join().is_err() {
            log_warn!("CONTROL THREAD PANICKED");
        }
    }

    for g in &governors {
        if cli.dump_log {
            g.dump_log();
        }
        g.summary();
    }

    drop(claims);
    log_info!("GOVERNORS RESTORED");
    println!("KTOONSERVATIVE OUT.");
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Some(Cmd::Check) => cli::check::run_check(&cli.sysfs_root),
        Some(Cmd::Probe { interval_ms, ignore_nice }) => {
            cli::probe::run_probe(&cli.sysfs_root, interval_ms, ignore_nice)
        }
        Some(Cmd::Tunables) => print_tunables(&build_store(&cli.overrides)?),
        None => run(cli),
    }
}

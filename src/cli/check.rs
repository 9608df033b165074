use std::io::Read;
use std::path::Path;

use anyhow::Result;

use ktoonservative::platform::{discover_domains, FrequencyDriver};

const REQUIRED_CONFIG: [&str; 2] = ["CONFIG_CPU_FREQ_GOV_USERSPACE", "CONFIG_HOTPLUG_CPU"];

fn check_kernel_config() -> bool {
    let file = match std::fs::File::open("/proc/config.gz") {
        Ok(f) => f,
        Err(_) => {
            println!("  /proc/config.gz       NOT FOUND (SKIPPED)");
            return true;
        }
    };
    let mut decoder = flate2::read::GzDecoder::new(file);
    let mut config = String::new();
    if decoder.read_to_string(&mut config).is_err() {
        println!("  /proc/config.gz       UNREADABLE (SKIPPED)");
        return true;
    }

    let mut ok = true;
    for key in REQUIRED_CONFIG {
        if config.lines().any(|l| l == format!("{}=y", key)) {
            println!("  {:<32}OK", key);
        } else {
            println!("  {:<32}NOT FOUND", key);
            ok = false;
        }
    }
    ok
}

fn check_file(label: &str, path: &Path) -> bool {
    if path.exists() {
        println!("  {:<32}OK", label);
        true
    } else {
        println!("  {:<32}MISSING ({})", label, path.display());
        false
    }
}

pub fn run_check(root: &Path) -> Result<()> {
    println!("KTOONSERVATIVE DEPENDENCY CHECK");
    println!();

    let mut ok = true;

    println!("KERNEL CONFIG:");
    if !check_kernel_config() {
        ok = false;
    }
    println!();

    println!("ACCOUNTING:");
    ok &= check_file("proc/stat", &root.join("proc/stat"));
    ok &= check_file("cpu/online", &root.join("sys/devices/system/cpu/online"));
    ok &= check_file("cpu/possible", &root.join("sys/devices/system/cpu/possible"));
    println!();

    println!("CPUFREQ POLICIES:");
    match discover_domains(root) {
        Ok(domains) if !domains.is_empty() => {
            for d in &domains {
                let label = format!("policy{} {:?}", d.id(), d.cpus());
                match d.policy() {
                    Ok(p) => println!(
                        "  {:<32}CUR {} MIN {} MAX {} STATES {}",
                        label, p.cur, p.min, p.max, d.table().len()
                    ),
                    Err(e) => {
                        println!("  {:<32}UNREADABLE: {:#}", label, e);
                        ok = false;
                    }
                }
                ok &= check_file("  scaling_setspeed", &d.dir().join("scaling_setspeed"));
                let governors = std::fs::read_to_string(
                    d.dir().join("scaling_available_governors")
                ).unwrap_or_default();
                if governors.split_whitespace().any(|g| g == "userspace") {
                    println!("  {:<32}OK", "  userspace governor");
                } else {
                    println!("  {:<32}NOT AVAILABLE", "  userspace governor");
                    ok = false;
                }
            }
        }
        Ok(_) => {
            println!("  NO POLICIES FOUND");
            ok = false;
        }
        Err(e) => {
            println!("  {:#}", e);
            ok = false;
        }
    }
    println!();

    if ok {
        println!("ALL CHECKS PASSED");
    } else {
        println!("SOME CHECKS FAILED");
        std::process::exit(1);
    }

    Ok(())
}

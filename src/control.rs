// KTOONSERVATIVE CONTROL CHANNEL
// LINE COMMANDS OVER A NAMED PIPE. EXTERNAL EVENTS (BOOST PULSE, SCREEN
// STATE, LIMIT CHANGES) AND TUNABLE READ/WRITE ALL ENTER HERE.
//
//   boost
//   screen on|off
//   set <key> <value>
//   get <key>
//   limits <policy> <min> <max>

use std::ffi::CString;
use std::fs::OpenOptions;
use std::io::{ErrorKind, Read};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{FileTypeExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{bail, Context, Result};

use crate::governor::{DomainGovernor, Governor};
use crate::tuning::{StoreEffect, TunableStore};

const IDLE_POLL: Duration = Duration::from_millis(100);

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    Boost,
    Screen(bool),
    Set { key: String, value: String },
    Get { key: String },
    Limits { policy: u32, min: u32, max: u32 },
}

fn number(field: &str, raw: &str) -> Result<u32> {
    raw.parse::<u32>()
        .with_context(|| format!("{}: NOT AN UNSIGNED INTEGER: {:?}", field, raw))
}

pub fn parse_command(line: &str) -> Result<Command> {
    let words: Vec<&str> = line.split_whitespace().collect();
    let cmd = match words.as_slice() {
        ["boost"] => Command::Boost,
        ["screen", "on"] => Command::Screen(true),
        ["screen", "off"] => Command::Screen(false),
        ["set", key, value] => Command::Set {
            key: key.to_string(),
            value: value.to_string(),
        },
        ["get", key] => Command::Get { key: key.to_string() },
        ["limits", policy, min, max] => {
            let min = number("min", min)?;
            let max = number("max", max)?;
            if min > max {
                bail!("LIMITS: MIN {} ABOVE MAX {}", min, max);
            }
            Command::Limits {
                policy: number("policy", policy)?,
                min,
                max,
            }
        }
        [] => bail!("EMPTY COMMAND"),
        _ => bail!("UNKNOWN COMMAND: {:?}", line.trim()),
    };
    Ok(cmd)
}

pub struct Controller {
    store:     Arc<TunableStore>,
    governors: Vec<Arc<DomainGovernor>>,
}

impl Controller {
    pub fn new(store: Arc<TunableStore>, governors: Vec<Arc<DomainGovernor>>) -> Self {
        Self { store, governors }
    }

    // RETURNS THE REPLY LINE
    pub fn execute(&self, cmd: &Command) -> Result<String> {
        match cmd {
            Command::Boost => {
                for g in &self.governors {
                    g.on_boost_pulse();
                }
                Ok("BOOST".to_string())
            }
            Command::Screen(on) => {
                // PROCESS-WIDE: APPLIED ONCE, THEN EVERY DOMAIN IS TOLD
                self.store.set_screen(*on);
                for g in &self.governors {
                    g.on_screen_state_changed(*on);
                }
                Ok(format!("SCREEN {}", if *on { "ON" } else { "OFF" }))
            }
            Command::Set { key, value } => {
                match self.store.store(key, value)? {
                    StoreEffect::CancelBoost => {
                        for g in &self.governors {
                            g.cancel_boost();
                        }
                    }
                    StoreEffect::Rebaseline => {
                        log_debug!(
                            "IGNORE_NICE CHANGED: GENERATION {}, WORKERS RESYNC BASELINES",
                            self.store.nice_generation()
                        );
                    }
                    StoreEffect::None => {}
                }
                Ok(format!("{} = {}", key, self.store.show(key)?))
            }
            Command::Get { key } => Ok(format!("{} = {}", key, self.store.show(key)?)),
            Command::Limits { policy, min, max } => {
                let g = match self.governors.iter().find(|g| g.id() == *policy) {
                    Some(g) => g,
                    None => bail!("NO SUCH POLICY: {}", policy),
                };
                g.on_limits_changed(*min, *max);
                Ok(format!("POLICY{} LIMITS {}..{}", policy, min, max))
            }
        }
    }

    pub fn handle_line(&self, line: &str) {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return;
        }
        match parse_command(line).and_then(|cmd| self.execute(&cmd)) {
            Ok(reply) => log_info!("CONTROL: {}", reply),
            Err(e) => log_warn!("CONTROL: {:#}", e),
        }
    }
}

// --- FIFO ---

// CREATE THE PIPE UNLESS ONE IS ALREADY THERE. TRUE IF WE CREATED IT.
pub fn ensure_fifo(path: &Path) -> Result<bool> {
    if let Ok(meta) = std::fs::metadata(path) {
        if meta.file_type().is_fifo() {
            return Ok(false);
        }
        bail!("{} EXISTS AND IS NOT A FIFO", path.display());
    }
    let c_path = CString::new(path.as_os_str().as_bytes())
        .with_context(|| format!("BAD FIFO PATH {}", path.display()))?;
    let ret = unsafe { libc::mkfifo(c_path.as_ptr(), 0o600) };
    if ret != 0 {
        return Err(std::io::Error::last_os_error())
            .with_context(|| format!("MKFIFO {}", path.display()));
    }
    Ok(true)
}

// READ COMMANDS UNTIL SHUTDOWN. NON-BLOCKING SO SHUTDOWN IS NEVER STUCK
// BEHIND AN ABSENT WRITER.
pub fn spawn_reader(
    path: PathBuf,
    controller: Arc<Controller>,
    shutdown: &'static AtomicBool,
) -> Result<JoinHandle<()>> {
    let created = ensure_fifo(&path)?;
    let mut fifo = OpenOptions::new()
        .read(true)
        .custom_flags(libc::O_NONBLOCK)
        .open(&path)
        .with_context(|| format!("OPEN {}", path.display()))?;
    log_info!("CONTROL FIFO: {}", path.display());

    let handle = std::thread::Builder::new()
        .name("ktoon-control".to_string())
        .spawn(move || {
            let mut pending: Vec<u8> = Vec::new();
            let mut buf = [0u8; 512];
            while !shutdown.load(Ordering::Relaxed) {
                match fifo.read(&mut buf) {
                    Ok(0) => std::thread::sleep(IDLE_POLL),
                    Ok(n) => {
                        pending.extend_from_slice(&buf[..n]);
                        while let Some(pos) = pending.iter().position(|&b| b == b'\n') {
                            let line: Vec<u8> = pending.drain(..=pos).collect();
                            controller.handle_line(&String::from_utf8_lossy(&line));
                        }
                    }
                    Err(e) if e.kind() == ErrorKind::WouldBlock
                        || e.kind() == ErrorKind::Interrupted => {
                        std::thread::sleep(IDLE_POLL);
                    }
                    Err(e) => {
                        log_warn!("CONTROL FIFO READ: {}", e);
                        std::thread::sleep(IDLE_POLL);
                    }
                }
            }
            if created {
                let _ = std::fs::remove_file(&path);
            }
        })
        .context("SPAWN CONTROL THREAD")?;
    Ok(handle)
}

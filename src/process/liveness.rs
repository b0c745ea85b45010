//! Process liveness checks for relay servers and their targets

use std::time::{Duration, Instant};
use sysinfo::{Pid, ProcessStatus, System};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Whether `pid` names a running process. Zombies count as exited.
pub fn is_process_alive(pid: u32) -> bool {
    let mut sys = System::new();
    sys.refresh_processes();
    is_alive_in(&sys, pid)
}

fn is_alive_in(sys: &System, pid: u32) -> bool {
    sys.process(Pid::from_u32(pid))
        .map(|p| !matches!(p.status(), ProcessStatus::Zombie | ProcessStatus::Dead))
        .unwrap_or(false)
}

/// Poll until `pid` has exited or `timeout` elapses.
/// Returns true if the process is gone.
pub fn wait_for_exit(pid: u32, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    let mut sys = System::new();

    loop {
        sys.refresh_processes();
        if !is_alive_in(&sys, pid) {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(POLL_INTERVAL);
    }
}

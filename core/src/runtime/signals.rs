//! Signal handling.
//!
//! Handlers only set bits in one process-wide atomic register; the capture
//! loop polls it between bursts and after plugin fan-out. Ctrl-C raises the
//! interrupt level by one (drain and exit, then remove and exit, then die),
//! SIGTERM jumps straight to level 2, SIGUSR1 requests a one-shot report,
//! SIGUSR2 toggles periodic monitoring and SIGALRM is the monitoring tick.

use std::sync::atomic::{AtomicU32, Ordering};

use anyhow::{Context, Result};
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};

/// Interrupt level mask: 0 = run, 1 = drain then exit, 2 = remove all flows
/// then exit, 3 = immediate exit.
const LEVEL_MASK: u32 = 0x0f;
const FLAG_REPORT: u32 = 0x10;
const FLAG_TOGGLE: u32 = 0x20;
const FLAG_ALARM: u32 = 0x40;

static FLAGS: AtomicU32 = AtomicU32::new(0);

extern "C" fn handle_signal(sig: i32) {
    match sig {
        libc::SIGTERM => {
            let _ = FLAGS.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| {
                Some((v & !LEVEL_MASK) | (v & LEVEL_MASK).max(2))
            });
        }
        libc::SIGUSR1 => {
            FLAGS.fetch_or(FLAG_REPORT, Ordering::SeqCst);
        }
        libc::SIGUSR2 => {
            FLAGS.fetch_or(FLAG_TOGGLE, Ordering::SeqCst);
        }
        libc::SIGALRM => {
            FLAGS.fetch_or(FLAG_ALARM, Ordering::SeqCst);
        }
        _ => {}
    }
}

/// Installs all handlers. The Ctrl-C handler runs on its own thread; the
/// remaining signals are plain handlers that only touch the atomic register.
pub fn install() -> Result<()> {
    ctrlc::set_handler(|| {
        let previous = FLAGS.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| {
            let level = ((v & LEVEL_MASK) + 1).min(3);
            Some((v & !LEVEL_MASK) | level)
        });
        if let Ok(v) = previous {
            if v & LEVEL_MASK >= 2 {
                // third Ctrl-C: the loop may be stuck, leave now
                std::process::exit(1);
            }
        }
    })
    .context("installing the interrupt handler")?;

    let action = SigAction::new(
        SigHandler::Handler(handle_signal),
        SaFlags::SA_RESTART,
        SigSet::empty(),
    );
    for sig in [Signal::SIGTERM, Signal::SIGUSR1, Signal::SIGUSR2, Signal::SIGALRM] {
        unsafe {
            sigaction(sig, &action).with_context(|| format!("installing {sig:?} handler"))?;
        }
    }
    Ok(())
}

/// Arms (or with `None` disarms) the periodic monitoring timer.
pub fn arm_monitor_timer(interval: Option<f64>) {
    let (sec, usec) = match interval {
        Some(secs) if secs > 0.0 => (secs as i64, ((secs % 1.0) * 1e6) as i64),
        _ => (0, 0),
    };
    let timer = libc::itimerval {
        it_interval: libc::timeval {
            tv_sec: sec,
            tv_usec: usec,
        },
        it_value: libc::timeval {
            tv_sec: sec,
            tv_usec: usec,
        },
    };
    unsafe {
        libc::setitimer(libc::ITIMER_REAL, &timer, std::ptr::null_mut());
    }
}

/// Current interrupt level.
pub fn interrupt_level() -> u32 {
    FLAGS.load(Ordering::SeqCst) & LEVEL_MASK
}

fn take_flag(flag: u32) -> bool {
    FLAGS.fetch_and(!flag, Ordering::SeqCst) & flag != 0
}

/// Consumes a pending one-shot report request.
pub fn take_report() -> bool {
    take_flag(FLAG_REPORT)
}

/// Consumes a pending monitoring toggle.
pub fn take_toggle() -> bool {
    take_flag(FLAG_TOGGLE)
}

/// Consumes a pending monitoring tick.
pub fn take_alarm() -> bool {
    take_flag(FLAG_ALARM)
}

#[cfg(test)]
pub(crate) fn reset_for_tests() {
    FLAGS.store(0, Ordering::SeqCst);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_are_one_shot() {
        reset_for_tests();
        FLAGS.fetch_or(FLAG_REPORT | FLAG_ALARM, Ordering::SeqCst);
        assert!(take_report());
        assert!(!take_report());
        assert!(take_alarm());
        assert_eq!(interrupt_level(), 0);
    }

    #[test]
    fn term_jumps_to_level_two() {
        reset_for_tests();
        handle_signal(libc::SIGTERM);
        assert_eq!(interrupt_level(), 2);
        // a lower request never lowers the level
        handle_signal(libc::SIGTERM);
        assert_eq!(interrupt_level(), 2);
        reset_for_tests();
    }
}

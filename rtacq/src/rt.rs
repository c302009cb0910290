//! Real-time placement of the receiver thread.
//!
//! CPU affinity and `SCHED_FIFO` priority are Linux-only. Elsewhere the
//! calls log a warning and succeed. Failures never stop acquisition: the
//! receiver runs unpinned at normal priority and says so.

use std::io;

/// Pins the calling thread to the CPUs set in `cpu_mask` (bit n = CPU n).
///
/// # Errors
///
/// Returns the OS error if the mask is empty or rejected.
#[cfg(target_os = "linux")]
pub fn set_affinity(cpu_mask: u64) -> io::Result<()> {
    if cpu_mask == 0 {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "empty cpu mask"));
    }

    // SAFETY: cpu_set_t is plain data for which all-zero is the empty set.
    let mut cpu_set: libc::cpu_set_t = unsafe { std::mem::zeroed() };
    for cpu in (0..64).filter(|bit| cpu_mask & (1u64 << bit) != 0) {
        // SAFETY: cpu < 64 is within CPU_SETSIZE.
        unsafe { libc::CPU_SET(cpu, &mut cpu_set) };
    }

    // SAFETY: pid 0 targets the calling thread; the set is initialized and
    // its size is passed alongside.
    let result = unsafe {
        libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &cpu_set)
    };
    if result == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

/// Pins the calling thread (stub for non-Linux platforms).
///
/// # Errors
///
/// Never fails.
#[cfg(not(target_os = "linux"))]
pub fn set_affinity(cpu_mask: u64) -> io::Result<()> {
    tracing::warn!(cpu_mask, "thread affinity not supported on this platform");
    Ok(())
}

/// Moves the calling thread to `SCHED_FIFO` at `priority`, clamped to the
/// range the scheduler accepts.
///
/// Returns the priority actually applied.
///
/// # Errors
///
/// Returns the OS error, typically `EPERM` without `CAP_SYS_NICE`.
#[cfg(target_os = "linux")]
pub fn set_fifo_priority(priority: i32) -> io::Result<i32> {
    // SAFETY: Pure queries on a valid policy constant.
    let (min, max) = unsafe {
        (
            libc::sched_get_priority_min(libc::SCHED_FIFO),
            libc::sched_get_priority_max(libc::SCHED_FIFO),
        )
    };
    let applied = priority.clamp(min, max);
    // SAFETY: sched_param is plain data; zero is valid for every field.
    let mut param: libc::sched_param = unsafe { std::mem::zeroed() };
    param.sched_priority = applied;

    // SAFETY: pthread_self() is the calling thread and `param` outlives the
    // call.
    let result =
        unsafe { libc::pthread_setschedparam(libc::pthread_self(), libc::SCHED_FIFO, &param) };
    if result == 0 {
        Ok(applied)
    } else {
        Err(io::Error::from_raw_os_error(result))
    }
}

/// Raises the calling thread's priority (stub for non-Linux platforms).
///
/// # Errors
///
/// Never fails.
#[cfg(not(target_os = "linux"))]
pub fn set_fifo_priority(priority: i32) -> io::Result<i32> {
    tracing::warn!(priority, "real-time priority not supported on this platform");
    Ok(priority)
}

/// Applies the optional affinity mask and priority to the calling thread,
/// logging instead of failing.
pub fn configure_current_thread(stream: &str, cpu_mask: Option<u64>, priority: Option<i32>) {
    if let Some(mask) = cpu_mask {
        match set_affinity(mask) {
            Ok(()) => tracing::debug!(stream, cpu_mask = mask, "pinned receiver"),
            Err(error) => tracing::warn!(stream, cpu_mask = mask, %error, "failed to pin receiver"),
        }
    }

    if let Some(requested) = priority {
        match set_fifo_priority(requested) {
            Ok(applied) => tracing::debug!(stream, requested, applied, "receiver priority set"),
            Err(error) => {
                tracing::warn!(stream, requested, %error, "failed to raise receiver priority");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(target_os = "linux")]
    #[test]
    fn test_empty_mask_is_rejected() {
        assert!(set_affinity(0).is_err());
    }

    #[test]
    fn test_configure_without_settings_is_noop() {
        configure_current_thread("test", None, None);
    }

    #[test]
    fn test_configure_never_panics_on_failure() {
        // May lack permission; only the absence of a panic is checked.
        std::thread::spawn(|| configure_current_thread("test", Some(1), Some(i32::MAX)))
            .join()
            .unwrap();
    }
}

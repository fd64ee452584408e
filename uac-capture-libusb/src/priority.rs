//! Real-time scheduling for the acquisition thread.

/// Move the calling thread to `SCHED_FIFO`.
///
/// Returns `false` when the process lacks the privilege; capture still works
/// at normal priority, with a higher risk of overruns under load.
#[cfg(unix)]
pub fn elevate_current_thread() -> bool {
    // SAFETY: plain libc queries and a pthread call on the current thread.
    unsafe {
        let max = libc::sched_get_priority_max(libc::SCHED_FIFO);
        let min = libc::sched_get_priority_min(libc::SCHED_FIFO);
        if max < 0 || min < 0 {
            log::warn!("SCHED_FIFO priority range unavailable");
            return false;
        }

        let mut param: libc::sched_param = std::mem::zeroed();
        // Midpoint of the SCHED_FIFO range.
        param.sched_priority = min + (max - min) / 2;

        let rc = libc::pthread_setschedparam(libc::pthread_self(), libc::SCHED_FIFO, &param);
        if rc != 0 {
            log::warn!(
                "real-time priority refused ({}); acquisition runs at normal priority",
                std::io::Error::from_raw_os_error(rc)
            );
            return false;
        }
        log::info!("acquisition thread running SCHED_FIFO at priority {}", param.sched_priority);
        true
    }
}

#[cfg(not(unix))]
pub fn elevate_current_thread() -> bool {
    log::debug!("real-time priority not supported on this platform");
    false
}

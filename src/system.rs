//! Small OS services shared by the whole engine: a monotonic millisecond
//! clock, timeout arithmetic, and the descriptor-set poller that lets one
//! thread wait on a heterogeneous bag of OS wait objects.

use std::time::Instant;

use crate::error::{Error, ErrorKind, Result};

/// What the poller waits on: a file descriptor on POSIX, a wait object
/// HANDLE on Windows.
#[cfg(unix)]
pub type Descriptor = std::os::unix::io::RawFd;
#[cfg(windows)]
pub type Descriptor = windows_sys::Win32::Foundation::HANDLE;

/// Upper bound on the number of descriptors in one set; chosen so a single
/// system call (poll / WaitForMultipleObjects) always suffices.
pub const MAX_DESCRIPTORS: usize = 64;

/// Monotonic millisecond clock. The epoch is arbitrary (as with the OS
/// monotonic clocks this stands in for); only differences are meaningful.
pub fn millis() -> u64 {
    use std::sync::OnceLock;
    static START: OnceLock<Instant> = OnceLock::new();

    // Bias away from zero so timestamp arithmetic never has to saturate.
    const EPOCH_BIAS: u64 = 86_400_000;

    EPOCH_BIAS + START.get_or_init(Instant::now).elapsed().as_millis() as u64
}

/// Sleeps for `ms` milliseconds.
pub fn delay(ms: u64) {
    std::thread::sleep(std::time::Duration::from_millis(ms));
}

/// Shrinks a millisecond timeout by the time elapsed since `start`, so
/// restarted system calls do not overshoot the caller's deadline.
///
/// Negative timeouts mean infinite and are returned unchanged; the result
/// never goes below 0.
pub fn adjust_timeout(timeout: i32, start: u64) -> i32 {
    if timeout < 0 {
        return -1;
    }

    let elapsed = millis().saturating_sub(start);
    if elapsed >= timeout as u64 {
        0
    } else {
        timeout - elapsed as i32
    }
}

/// A bounded set of descriptors with caller-chosen integer ids.
///
/// Ids should be positive: [poll] uses 0 to report a timeout.
#[derive(Debug, Default, Clone)]
pub struct DescriptorSet {
    entries: Vec<(Descriptor, i32)>,
}

impl DescriptorSet {
    pub fn new() -> Self {
        DescriptorSet {
            entries: Vec::new(),
        }
    }

    pub fn add(&mut self, desc: Descriptor, id: i32) {
        assert!(
            self.entries.len() < MAX_DESCRIPTORS,
            "too many descriptors in one set"
        );
        self.entries.push((desc, id));
    }

    /// Removes every descriptor registered under `id`.
    pub fn remove(&mut self, id: i32) {
        self.entries.retain(|&(_, entry_id)| entry_id != id);
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn entries(&self) -> &[(Descriptor, i32)] {
        &self.entries
    }
}

/// Waits until one descriptor in `set` becomes ready.
///
/// Returns the id of a ready descriptor, or 0 on timeout. Which descriptor is
/// reported when several are ready is unspecified; callers must drain what
/// they find and come back.
#[cfg(unix)]
pub fn poll(set: &DescriptorSet, timeout: i32) -> Result<i32> {
    assert!(!set.is_empty());

    let mut pfd: Vec<libc::pollfd> = set
        .entries()
        .iter()
        .map(|&(fd, _)| libc::pollfd {
            fd,
            events: libc::POLLIN,
            revents: 0,
        })
        .collect();

    let start = millis();
    loop {
        let r = unsafe {
            libc::poll(
                pfd.as_mut_ptr(),
                pfd.len() as libc::nfds_t,
                adjust_timeout(timeout, start),
            )
        };
        if r < 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                continue;
            }
            return Err(Error::new(
                ErrorKind::System,
                format!("poll() failed: {}", err),
            ));
        }
        if r == 0 {
            return Ok(0);
        }

        for (pfd, &(_, id)) in pfd.iter().zip(set.entries()) {
            if pfd.revents != 0 {
                return Ok(id);
            }
        }
        unreachable!("poll() reported readiness but no descriptor has events");
    }
}

#[cfg(windows)]
pub fn poll(set: &DescriptorSet, timeout: i32) -> Result<i32> {
    use windows_sys::Win32::Foundation::{WAIT_FAILED, WAIT_OBJECT_0, WAIT_TIMEOUT};
    use windows_sys::Win32::System::Threading::{WaitForMultipleObjects, INFINITE};

    assert!(!set.is_empty());

    let handles: Vec<Descriptor> = set.entries().iter().map(|&(h, _)| h).collect();
    let timeout = if timeout < 0 { INFINITE } else { timeout as u32 };

    let r = unsafe { WaitForMultipleObjects(handles.len() as u32, handles.as_ptr(), 0, timeout) };
    if r == WAIT_TIMEOUT {
        return Ok(0);
    }
    if r == WAIT_FAILED {
        return Err(Error::new(
            ErrorKind::System,
            format!(
                "WaitForMultipleObjects() failed: {}",
                std::io::Error::last_os_error()
            ),
        ));
    }

    let index = (r - WAIT_OBJECT_0) as usize;
    if index >= set.len() {
        return Err(Error::new(
            ErrorKind::System,
            "WaitForMultipleObjects() reported an abandoned wait object",
        ));
    }
    Ok(set.entries()[index].1)
}

/// True when two paths designate the same device node.
///
/// POSIX compares `(st_dev, st_ino)` so `/dev` aliases match; Windows device
/// node names are not filesystem paths, so compare case-insensitively after
/// stripping the `\\.\` / `\\?\` prefixes (COM ports exist under both forms).
pub fn paths_are_same_node(path1: &str, path2: &str) -> bool {
    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;

        if path1 == path2 {
            return true;
        }

        match (std::fs::metadata(path1), std::fs::metadata(path2)) {
            (Ok(m1), Ok(m2)) => m1.dev() == m2.dev() && m1.ino() == m2.ino(),
            _ => false,
        }
    }

    #[cfg(windows)]
    {
        fn strip(path: &str) -> &str {
            path.strip_prefix("\\\\.\\")
                .or_else(|| path.strip_prefix("\\\\?\\"))
                .unwrap_or(path)
        }

        strip(path1).eq_ignore_ascii_case(strip(path2))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adjust_timeout_clamps_to_zero() {
        let start = millis();
        assert!(adjust_timeout(100, start) <= 100);

        // A start far in the "past" must have fully elapsed.
        assert_eq!(adjust_timeout(100, 0), 0);
    }

    #[test]
    fn adjust_timeout_keeps_infinite_infinite() {
        assert_eq!(adjust_timeout(-1, 0), -1);
        assert_eq!(adjust_timeout(-42, millis()), -1);
    }

    #[test]
    fn descriptor_set_remove_drops_all_matching_ids() {
        let mut set = DescriptorSet::new();
        set.add(3 as Descriptor, 1);
        set.add(4 as Descriptor, 2);
        set.add(5 as Descriptor, 1);

        set.remove(1);
        assert_eq!(set.len(), 1);
        assert_eq!(set.entries()[0].1, 2);
    }

    #[cfg(unix)]
    #[test]
    fn poll_reports_the_ready_descriptor() {
        let mut fds = [0 as libc::c_int; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);

        let mut set = DescriptorSet::new();
        set.add(fds[0], 7);

        // Nothing written yet: timeout.
        assert_eq!(poll(&set, 0).unwrap(), 0);

        assert_eq!(unsafe { libc::write(fds[1], b"x".as_ptr().cast(), 1) }, 1);
        assert_eq!(poll(&set, 1000).unwrap(), 7);

        unsafe {
            libc::close(fds[0]);
            libc::close(fds[1]);
        }
    }

    #[cfg(unix)]
    #[test]
    fn same_node_check_sees_through_aliases() {
        assert!(paths_are_same_node("/dev/null", "/dev/null"));
        assert!(!paths_are_same_node("/dev/null", "/dev/zero"));
    }
}

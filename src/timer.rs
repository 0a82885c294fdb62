//! One-shot / periodic timer whose expiry is pollable as a descriptor.
//!
//! Backed by timerfd on Linux, a kqueue `EVFILT_TIMER` on macOS, and a
//! waitable timer on Windows. The board aggregator uses one of these to
//! expire missing boards without a dedicated thread.

use crate::error::Result;
use crate::system::DescriptorSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerMode {
    Oneshot,
    Periodic,
}

#[cfg(target_os = "linux")]
pub use self::linux::Timer;
#[cfg(target_os = "macos")]
pub use self::macos::Timer;
#[cfg(windows)]
pub use self::windows::Timer;

#[cfg(target_os = "linux")]
mod linux {
    use super::*;
    use crate::error::{Error, ErrorKind};

    /// Pollable timer on top of timerfd.
    #[derive(Debug)]
    pub struct Timer {
        fd: libc::c_int,
    }

    impl Timer {
        pub fn new() -> Result<Timer> {
            let fd = unsafe {
                libc::timerfd_create(
                    libc::CLOCK_MONOTONIC,
                    libc::TFD_CLOEXEC | libc::TFD_NONBLOCK,
                )
            };
            if fd < 0 {
                return Err(Error::new(
                    ErrorKind::System,
                    format!(
                        "timerfd_create() failed: {}",
                        std::io::Error::last_os_error()
                    ),
                ));
            }

            Ok(Timer { fd })
        }

        pub fn descriptors(&self, set: &mut DescriptorSet, id: i32) {
            set.add(self.fd, id);
        }

        /// Arms (or rearms) the timer for `value` milliseconds; 0 cancels.
        pub fn set(&mut self, value: i32, mode: TimerMode) -> Result<()> {
            let mut ispec: libc::itimerspec = unsafe { std::mem::zeroed() };

            if value > 0 {
                ispec.it_value.tv_sec = (value / 1000) as libc::time_t;
                ispec.it_value.tv_nsec = ((value % 1000) * 1_000_000) as _;

                if mode == TimerMode::Periodic {
                    ispec.it_interval = ispec.it_value;
                }
            }

            let r = unsafe { libc::timerfd_settime(self.fd, 0, &ispec, std::ptr::null_mut()) };
            if r < 0 {
                return Err(Error::new(
                    ErrorKind::System,
                    format!(
                        "timerfd_settime() failed: {}",
                        std::io::Error::last_os_error()
                    ),
                ));
            }

            Ok(())
        }

        /// Returns the number of ticks since the last rearm and marks the
        /// timer not-ready.
        pub fn rearm(&mut self) -> u64 {
            let mut ticks: u64 = 0;

            let r = unsafe {
                libc::read(
                    self.fd,
                    &mut ticks as *mut u64 as *mut libc::c_void,
                    std::mem::size_of::<u64>(),
                )
            };
            if r <= 0 {
                return 0;
            }

            ticks
        }
    }

    impl Drop for Timer {
        fn drop(&mut self) {
            unsafe {
                libc::close(self.fd);
            }
        }
    }
}

#[cfg(target_os = "macos")]
mod macos {
    use super::*;
    use crate::error::{Error, ErrorKind};

    const TIMER_IDENT: usize = 1;

    /// Pollable timer on top of a kqueue `EVFILT_TIMER`.
    #[derive(Debug)]
    pub struct Timer {
        kq: libc::c_int,
        armed: bool,
    }

    impl Timer {
        pub fn new() -> Result<Timer> {
            let kq = unsafe { libc::kqueue() };
            if kq < 0 {
                return Err(Error::new(
                    ErrorKind::System,
                    format!("kqueue() failed: {}", std::io::Error::last_os_error()),
                ));
            }

            Ok(Timer { kq, armed: false })
        }

        pub fn descriptors(&self, set: &mut DescriptorSet, id: i32) {
            set.add(self.kq, id);
        }

        fn change(&mut self, flags: u16, value: i32) -> Result<()> {
            let kev = libc::kevent {
                ident: TIMER_IDENT,
                filter: libc::EVFILT_TIMER,
                flags,
                fflags: 0,
                data: value as isize,
                udata: std::ptr::null_mut(),
            };

            let r = unsafe { libc::kevent(self.kq, &kev, 1, std::ptr::null_mut(), 0, std::ptr::null()) };
            if r < 0 {
                return Err(Error::new(
                    ErrorKind::System,
                    format!("kevent() failed: {}", std::io::Error::last_os_error()),
                ));
            }

            Ok(())
        }

        pub fn set(&mut self, value: i32, mode: TimerMode) -> Result<()> {
            if value <= 0 {
                if self.armed {
                    self.change(libc::EV_DELETE, 0)?;
                    self.armed = false;
                }
                return Ok(());
            }

            let mut flags = libc::EV_ADD | libc::EV_ENABLE;
            if mode == TimerMode::Oneshot {
                flags |= libc::EV_ONESHOT;
            }

            self.change(flags, value)?;
            self.armed = true;
            Ok(())
        }

        pub fn rearm(&mut self) -> u64 {
            let mut kev: libc::kevent = unsafe { std::mem::zeroed() };
            let zero = libc::timespec {
                tv_sec: 0,
                tv_nsec: 0,
            };

            let r = unsafe { libc::kevent(self.kq, std::ptr::null(), 0, &mut kev, 1, &zero) };
            if r <= 0 {
                return 0;
            }

            kev.data as u64
        }
    }

    impl Drop for Timer {
        fn drop(&mut self) {
            unsafe {
                libc::close(self.kq);
            }
        }
    }
}

#[cfg(windows)]
mod windows {
    use super::*;
    use crate::error::{Error, ErrorKind};
    use crate::system::millis;
    use windows_sys::Win32::Foundation::{CloseHandle, HANDLE, WAIT_OBJECT_0};
    use windows_sys::Win32::System::Threading::{
        CancelWaitableTimer, CreateWaitableTimerW, SetWaitableTimer, WaitForSingleObject,
    };

    /// Pollable timer on top of a manual-reset waitable timer.
    #[derive(Debug)]
    pub struct Timer {
        handle: HANDLE,
        period: Option<u64>,
        deadline: u64,
    }

    // The handle is only ever used behind &mut self.
    unsafe impl Send for Timer {}

    impl Timer {
        pub fn new() -> Result<Timer> {
            let handle =
                unsafe { CreateWaitableTimerW(std::ptr::null(), 1, std::ptr::null()) };
            if handle.is_null() {
                return Err(Error::new(
                    ErrorKind::System,
                    format!(
                        "CreateWaitableTimer() failed: {}",
                        std::io::Error::last_os_error()
                    ),
                ));
            }

            Ok(Timer {
                handle,
                period: None,
                deadline: 0,
            })
        }

        pub fn descriptors(&self, set: &mut DescriptorSet, id: i32) {
            set.add(self.handle, id);
        }

        pub fn set(&mut self, value: i32, mode: TimerMode) -> Result<()> {
            if value <= 0 {
                unsafe {
                    CancelWaitableTimer(self.handle);
                }
                self.period = None;
                return Ok(());
            }

            // Negative due time = relative, in 100 ns units.
            let due = -(value as i64) * 10_000;
            let period = match mode {
                TimerMode::Periodic => value,
                TimerMode::Oneshot => 0,
            };

            let r = unsafe {
                SetWaitableTimer(self.handle, &due, period, None, std::ptr::null(), 0)
            };
            if r == 0 {
                return Err(Error::new(
                    ErrorKind::System,
                    format!(
                        "SetWaitableTimer() failed: {}",
                        std::io::Error::last_os_error()
                    ),
                ));
            }

            self.period = (mode == TimerMode::Periodic).then_some(value as u64);
            self.deadline = millis() + value as u64;
            Ok(())
        }

        pub fn rearm(&mut self) -> u64 {
            let signaled =
                unsafe { WaitForSingleObject(self.handle, 0) } == WAIT_OBJECT_0;
            if !signaled {
                return 0;
            }

            match self.period {
                Some(period) => {
                    // A manual-reset timer stays signaled; count missed
                    // periods and schedule the next aligned expiry.
                    let late = millis().saturating_sub(self.deadline);
                    let ticks = 1 + late / period;

                    let next = period - late % period;
                    let due = -(next as i64) * 10_000;
                    unsafe {
                        SetWaitableTimer(
                            self.handle,
                            &due,
                            period as i32,
                            None,
                            std::ptr::null(),
                            0,
                        );
                    }
                    self.deadline = millis() + next;

                    ticks
                }
                None => {
                    unsafe {
                        CancelWaitableTimer(self.handle);
                    }
                    1
                }
            }
        }
    }

    impl Drop for Timer {
        fn drop(&mut self) {
            unsafe {
                CloseHandle(self.handle);
            }
        }
    }
}

#[cfg(all(test, target_os = "linux"))]
mod tests {
    use super::*;
    use crate::system::{poll, DescriptorSet};

    #[test]
    fn oneshot_timer_becomes_pollable_then_quiet() {
        let mut timer = Timer::new().unwrap();
        let mut set = DescriptorSet::new();
        timer.descriptors(&mut set, 3);

        timer.set(20, TimerMode::Oneshot).unwrap();
        assert_eq!(poll(&set, 1000).unwrap(), 3);

        assert!(timer.rearm() >= 1);
        assert_eq!(poll(&set, 0).unwrap(), 0);
    }

    #[test]
    fn setting_zero_cancels() {
        let mut timer = Timer::new().unwrap();
        let mut set = DescriptorSet::new();
        timer.descriptors(&mut set, 1);

        timer.set(10, TimerMode::Oneshot).unwrap();
        timer.set(0, TimerMode::Oneshot).unwrap();

        assert_eq!(poll(&set, 50).unwrap(), 0);
        assert_eq!(timer.rearm(), 0);
    }

    #[test]
    fn periodic_timer_accumulates_ticks() {
        let mut timer = Timer::new().unwrap();
        timer.set(10, TimerMode::Periodic).unwrap();

        crate::system::delay(55);
        assert!(timer.rearm() >= 3);
    }
}

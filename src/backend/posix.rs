//! POSIX serial I/O: termios attribute control plus poll-gated reads and
//! writes, shared by the Linux and macOS backends.

use std::os::unix::io::RawFd;
use std::sync::Arc;

use crate::device::{Device, FlowControl, Handle, HandleImpl, Parity, SerialAttributes};
use crate::error::{Error, ErrorKind, Result};
use crate::system::{adjust_timeout, millis, DescriptorSet};

/// Polls `fd` for readability. Returns false on timeout; restarts on EINTR
/// without overshooting the caller's deadline.
pub(crate) fn wait_readable(fd: RawFd, timeout: i32, path: &str) -> Result<bool> {
    wait_for(fd, libc::POLLIN, timeout, path)
}

pub(crate) fn wait_writable(fd: RawFd, timeout: i32, path: &str) -> Result<bool> {
    wait_for(fd, libc::POLLOUT, timeout, path)
}

fn wait_for(fd: RawFd, events: libc::c_short, timeout: i32, path: &str) -> Result<bool> {
    let mut pfd = libc::pollfd {
        fd,
        events,
        revents: 0,
    };

    let start = millis();
    loop {
        let r = unsafe { libc::poll(&mut pfd, 1, adjust_timeout(timeout, start)) };
        if r < 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                continue;
            }
            return Err(Error::new(
                ErrorKind::Io,
                format!("I/O error while polling '{}': {}", path, err),
            ));
        }
        return Ok(r > 0);
    }
}

fn baud_constant(rate: u32) -> Option<libc::speed_t> {
    Some(match rate {
        110 => libc::B110,
        134 => libc::B134,
        150 => libc::B150,
        200 => libc::B200,
        300 => libc::B300,
        600 => libc::B600,
        1200 => libc::B1200,
        1800 => libc::B1800,
        2400 => libc::B2400,
        4800 => libc::B4800,
        9600 => libc::B9600,
        19200 => libc::B19200,
        38400 => libc::B38400,
        57600 => libc::B57600,
        115200 => libc::B115200,
        _ => return None,
    })
}

/// An open serial node (tty on Linux, cu/tty on macOS).
#[derive(Debug)]
pub(crate) struct SerialHandle {
    fd: RawFd,
    path: String,
}

impl SerialHandle {
    pub(crate) fn open(dev: &Arc<Device>) -> Result<Handle> {
        let path = std::ffi::CString::new(dev.path())
            .map_err(|_| Error::new(ErrorKind::Param, "device path contains a NUL byte"))?;

        let fd = loop {
            let fd = unsafe {
                libc::open(
                    path.as_ptr(),
                    libc::O_RDWR | libc::O_CLOEXEC | libc::O_NONBLOCK | libc::O_NOCTTY,
                )
            };
            if fd >= 0 {
                break fd;
            }

            let err = std::io::Error::last_os_error();
            return Err(match err.raw_os_error() {
                Some(libc::EINTR) => continue,
                Some(libc::EACCES) => Error::new(
                    ErrorKind::Access,
                    format!("Permission denied for device '{}'", dev.path()),
                ),
                Some(libc::EIO) | Some(libc::ENXIO) | Some(libc::ENODEV) => Error::new(
                    ErrorKind::Io,
                    format!("I/O error while opening device '{}'", dev.path()),
                ),
                Some(libc::ENOENT) | Some(libc::ENOTDIR) => Error::new(
                    ErrorKind::NotFound,
                    format!("Device '{}' not found", dev.path()),
                ),
                _ => Error::new(
                    ErrorKind::System,
                    format!("open('{}') failed: {}", dev.path(), err),
                ),
            });
        };

        Ok(Handle {
            dev: Arc::clone(dev),
            imp: HandleImpl::PosixSerial(SerialHandle {
                fd,
                path: dev.path().to_string(),
            }),
        })
    }

    pub(crate) fn descriptors(&self, set: &mut DescriptorSet, id: i32) {
        set.add(self.fd, id);
    }

    pub(crate) fn set_attributes(&mut self, attrs: &SerialAttributes) -> Result<()> {
        let mut tio: libc::termios = unsafe { std::mem::zeroed() };

        let r = unsafe { libc::tcgetattr(self.fd, &mut tio) };
        if r < 0 {
            return Err(Error::new(
                ErrorKind::System,
                format!(
                    "Unable to read serial port settings: {}",
                    std::io::Error::last_os_error()
                ),
            ));
        }

        unsafe {
            libc::cfmakeraw(&mut tio);
        }
        tio.c_cc[libc::VMIN] = 1;
        tio.c_cc[libc::VTIME] = 0;
        tio.c_cflag |= libc::CLOCAL;

        let Some(rate) = baud_constant(attrs.baud) else {
            return Err(Error::new(
                ErrorKind::Unsupported,
                format!("Baud rate {} is not supported", attrs.baud),
            ));
        };
        unsafe {
            libc::cfsetispeed(&mut tio, rate);
            libc::cfsetospeed(&mut tio, rate);
        }

        tio.c_cflag &= !libc::CSIZE;
        tio.c_cflag |= match attrs.data_bits {
            5 => libc::CS5,
            6 => libc::CS6,
            7 => libc::CS7,
            8 => libc::CS8,
            n => {
                return Err(Error::new(
                    ErrorKind::Param,
                    format!("Invalid serial data size {}", n),
                ))
            }
        };

        tio.c_cflag &= !(libc::PARENB | libc::PARODD);
        #[cfg(target_os = "linux")]
        {
            tio.c_cflag &= !libc::CMSPAR;
        }
        match attrs.parity {
            Parity::None => {}
            Parity::Even => tio.c_cflag |= libc::PARENB,
            Parity::Odd => tio.c_cflag |= libc::PARENB | libc::PARODD,
            #[cfg(target_os = "linux")]
            Parity::Mark => tio.c_cflag |= libc::PARENB | libc::PARODD | libc::CMSPAR,
            #[cfg(target_os = "linux")]
            Parity::Space => tio.c_cflag |= libc::PARENB | libc::CMSPAR,
            #[cfg(not(target_os = "linux"))]
            Parity::Mark | Parity::Space => {
                return Err(Error::new(
                    ErrorKind::Unsupported,
                    "Mark and space parity are not supported on this platform",
                ))
            }
        }

        tio.c_cflag &= !libc::CSTOPB;
        match attrs.stop_bits {
            1 => {}
            2 => tio.c_cflag |= libc::CSTOPB,
            n => {
                return Err(Error::new(
                    ErrorKind::Param,
                    format!("Invalid serial stop bit count {}", n),
                ))
            }
        }

        tio.c_cflag &= !libc::CRTSCTS;
        tio.c_iflag &= !(libc::IXON | libc::IXOFF);
        match attrs.flow {
            FlowControl::None => {}
            FlowControl::XonXoff => tio.c_iflag |= libc::IXON | libc::IXOFF,
            FlowControl::RtsCts => tio.c_cflag |= libc::CRTSCTS,
        }

        tio.c_cflag &= !libc::HUPCL;
        if attrs.hupcl {
            tio.c_cflag |= libc::HUPCL;
        }

        let r = unsafe { libc::tcsetattr(self.fd, libc::TCSANOW, &tio) };
        if r < 0 {
            return Err(Error::new(
                ErrorKind::System,
                format!(
                    "Unable to change serial port settings: {}",
                    std::io::Error::last_os_error()
                ),
            ));
        }

        Ok(())
    }

    pub(crate) fn read(&mut self, buf: &mut [u8], timeout: i32) -> Result<usize> {
        assert!(!buf.is_empty());

        if timeout != 0 && !wait_readable(self.fd, timeout, &self.path)? {
            return Ok(0);
        }

        let r = unsafe { libc::read(self.fd, buf.as_mut_ptr().cast(), buf.len()) };
        if r < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::WouldBlock {
                return Ok(0);
            }
            return Err(Error::new(
                ErrorKind::Io,
                format!("I/O error while reading from '{}': {}", self.path, err),
            ));
        }

        Ok(r as usize)
    }

    pub(crate) fn write(&mut self, buf: &[u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        wait_writable(self.fd, -1, &self.path)?;

        let r = unsafe { libc::write(self.fd, buf.as_ptr().cast(), buf.len()) };
        if r < 0 {
            return Err(Error::new(
                ErrorKind::Io,
                format!(
                    "I/O error while writing to '{}': {}",
                    self.path,
                    std::io::Error::last_os_error()
                ),
            ));
        }

        Ok(r as usize)
    }
}

impl Drop for SerialHandle {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classic_baud_rates_are_covered() {
        for rate in [
            110, 134, 150, 200, 300, 600, 1200, 1800, 2400, 4800, 9600, 19200, 38400, 57600,
            115200,
        ] {
            assert!(baud_constant(rate).is_some(), "rate {} missing", rate);
        }

        assert!(baud_constant(31250).is_none());
    }

    #[test]
    fn wait_readable_honours_poll_timeouts() {
        let mut fds = [0 as libc::c_int; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);

        assert!(!wait_readable(fds[0], 10, "pipe").unwrap());

        assert_eq!(unsafe { libc::write(fds[1], b"!".as_ptr().cast(), 1) }, 1);
        assert!(wait_readable(fds[0], 10, "pipe").unwrap());

        unsafe {
            libc::close(fds[0]);
            libc::close(fds[1]);
        }
    }
}

// Unless explicitly stated otherwise all files in this repository are licensed
// under the MIT/Apache-2.0 License, at your convenience
//
// This product includes software developed at Datadog (https://www.datadoghq.com/). Copyright 2020 Datadog, Inc.
//
use std::{fmt, io, os::raw::c_int, os::unix::io::RawFd, time::Duration};

use log::debug;
use nix::poll::PollFd;

pub use nix::poll::PollFlags;

/// One slot of a poll set: a socket handle, the readiness the caller is
/// interested in, and the readiness observed by the last [`Poller::poll`].
#[derive(Debug)]
pub struct PollEntry {
    /// The watched socket handle.
    pub fd: RawFd,
    /// Readiness the owner of this entry wants to be woken for.
    pub interest: PollFlags,
    /// Readiness reported by the most recent poll. May be spurious; a
    /// handler woken through this entry must tolerate a zero-byte read.
    pub ready: PollFlags,
}

impl PollEntry {
    /// An entry watching `fd` for read readiness.
    pub fn readable(fd: RawFd) -> PollEntry {
        PollEntry {
            fd,
            interest: PollFlags::POLLIN,
            ready: PollFlags::empty(),
        }
    }

    /// True iff the last poll reported `fd` as read-ready.
    pub fn is_readable(&self) -> bool {
        self.ready.intersects(PollFlags::POLLIN)
    }
}

/// Thin abstraction over the socket-multiplexing primitive.
///
/// Implementations block for up to `timeout` (`None` means indefinitely)
/// until at least one entry's interest is satisfiable, fill in each
/// entry's `ready` mask and return the number of ready entries. Returning
/// early with zero ready entries is a spurious wake-up, which the reactor
/// tolerates.
pub trait Poller {
    /// Waits for readiness on `entries`, or for `timeout` to elapse.
    fn poll(&mut self, entries: &mut [PollEntry], timeout: Option<Duration>) -> io::Result<usize>;
}

/// The production [`Poller`], backed by `poll(2)`.
#[derive(Default)]
pub struct SysPoller {
    scratch: Vec<PollFd>,
}

impl SysPoller {
    /// Creates a poller with an empty scratch set.
    pub fn new() -> SysPoller {
        SysPoller::default()
    }
}

impl fmt::Debug for SysPoller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad("SysPoller { .. }")
    }
}

// poll(2) takes whole milliseconds. Round up so the reactor never wakes
// before the deadline it asked for and busy-spins on a sub-millisecond
// remainder.
fn timeout_millis(timeout: Option<Duration>) -> c_int {
    match timeout {
        Some(timeout) => {
            let millis = (timeout.as_nanos() + 999_999) / 1_000_000;
            millis.min(c_int::MAX as u128) as c_int
        }
        None => -1,
    }
}

impl Poller for SysPoller {
    fn poll(&mut self, entries: &mut [PollEntry], timeout: Option<Duration>) -> io::Result<usize> {
        self.scratch.clear();
        self.scratch
            .extend(entries.iter().map(|entry| PollFd::new(entry.fd, entry.interest)));

        match nix::poll::poll(&mut self.scratch, timeout_millis(timeout)) {
            Ok(ready) => {
                for (entry, fd) in entries.iter_mut().zip(self.scratch.iter()) {
                    entry.ready = fd.revents().unwrap_or_else(PollFlags::empty);
                }
                Ok(ready as usize)
            }
            Err(nix::errno::Errno::EINTR) => {
                debug!("poll(2) interrupted by a signal, reporting a spurious wake-up");
                for entry in entries.iter_mut() {
                    entry.ready = PollFlags::empty();
                }
                Ok(0)
            }
            Err(err) => Err(io::Error::from_raw_os_error(err as i32)),
        }
    }
}

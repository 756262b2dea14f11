use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use std::io::Result;
use std::os::fd::BorrowedFd;

/// Wait up to `timeout_ms` for any of `fds` to become readable.
/// Returns one flag per descriptor; hangup and error count as readable so
/// the following read reports them.
pub fn wait_readable(fds: &[BorrowedFd<'_>], timeout_ms: u16) -> Result<Vec<bool>> {
    let mut pfds: Vec<PollFd> = fds
        .iter()
        .map(|fd| PollFd::new(*fd, PollFlags::POLLIN))
        .collect();

    match poll(&mut pfds, PollTimeout::from(timeout_ms)) {
        Ok(_) => {}
        Err(Errno::EINTR) => return Ok(vec![false; fds.len()]),
        Err(e) => return Err(e.into()),
    }

    let ready = PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR;
    Ok(pfds
        .iter()
        .map(|p| p.revents().map_or(false, |r| r.intersects(ready)))
        .collect())
}

/// Zero-timeout readability check, so a following read does not block.
pub fn readable(fd: BorrowedFd<'_>) -> Result<bool> {
    Ok(wait_readable(&[fd], 0)?[0])
}

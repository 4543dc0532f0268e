//! Single-threaded readiness multiplexer.
//!
//! Thin wrapper over `mio::Poll` with the registration discipline the
//! main loop relies on: watches are single-shot (a fired watch is
//! removed before its tag is reported, and the handler re-arms at
//! entry), at most one watch exists per fd, and EINTR from the wait is
//! surfaced to the caller so the signal flag can be observed.

use std::collections::HashMap;
use std::io;
use std::os::fd::RawFd;
use std::time::Duration;

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};

pub struct Reactor<T> {
    poll: Poll,
    events: Events,
    watches: HashMap<Token, (RawFd, T)>,
    by_fd: HashMap<RawFd, Token>,
    next_token: usize,
}

impl<T: Copy> Reactor<T> {
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            poll: Poll::new()?,
            events: Events::with_capacity(16),
            watches: HashMap::new(),
            by_fd: HashMap::new(),
            next_token: 0,
        })
    }

    /// Watch `fd` for readability once. A previous watch on the same fd
    /// is replaced.
    pub fn on_read(&mut self, fd: RawFd, tag: T) -> io::Result<()> {
        self.forget(fd)?;
        let token = Token(self.next_token);
        self.next_token = self.next_token.wrapping_add(1);
        self.poll
            .registry()
            .register(&mut SourceFd(&fd), token, Interest::READABLE)?;
        self.watches.insert(token, (fd, tag));
        self.by_fd.insert(fd, token);
        Ok(())
    }

    /// Drop any pending watch for `fd`. Used during session teardown;
    /// unknown fds are a no-op.
    pub fn forget(&mut self, fd: RawFd) -> io::Result<()> {
        if let Some(token) = self.by_fd.remove(&fd) {
            self.watches.remove(&token);
            self.poll.registry().deregister(&mut SourceFd(&fd))?;
        }
        Ok(())
    }

    /// Wait for readiness and collect the tags of fired watches into
    /// `fired` (cleared first). Fired watches are removed before they
    /// are reported. EINTR is returned, not retried; the caller checks
    /// the shutdown flag and re-enters.
    pub fn iterate(&mut self, timeout: Option<Duration>, fired: &mut Vec<T>) -> io::Result<()> {
        fired.clear();
        self.poll.poll(&mut self.events, timeout)?;
        for event in self.events.iter() {
            if let Some((fd, tag)) = self.watches.remove(&event.token()) {
                self.by_fd.remove(&fd);
                // Deregistration can race a concurrent close of the fd;
                // the watch is gone either way.
                let _ = self.poll.registry().deregister(&mut SourceFd(&fd));
                fired.push(tag);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::AsRawFd;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Tag {
        A,
        B,
    }

    fn pipe() -> (rustix::fd::OwnedFd, rustix::fd::OwnedFd) {
        rustix::pipe::pipe().expect("pipe")
    }

    #[test]
    fn test_fires_on_readable() {
        let (rx, tx) = pipe();
        let mut reactor = Reactor::new().unwrap();
        reactor.on_read(rx.as_raw_fd(), Tag::A).unwrap();

        let mut fired = Vec::new();
        rustix::io::write(&tx, &[1]).unwrap();
        reactor
            .iterate(Some(Duration::from_secs(1)), &mut fired)
            .unwrap();
        assert_eq!(fired, vec![Tag::A]);
    }

    #[test]
    fn test_single_shot() {
        let (rx, tx) = pipe();
        let mut reactor = Reactor::new().unwrap();
        reactor.on_read(rx.as_raw_fd(), Tag::A).unwrap();
        rustix::io::write(&tx, &[1]).unwrap();

        let mut fired = Vec::new();
        reactor
            .iterate(Some(Duration::from_secs(1)), &mut fired)
            .unwrap();
        assert_eq!(fired.len(), 1);

        // Still readable, but the watch is gone until re-armed.
        reactor
            .iterate(Some(Duration::from_millis(10)), &mut fired)
            .unwrap();
        assert!(fired.is_empty());

        reactor.on_read(rx.as_raw_fd(), Tag::B).unwrap();
        reactor
            .iterate(Some(Duration::from_secs(1)), &mut fired)
            .unwrap();
        assert_eq!(fired, vec![Tag::B]);
    }

    #[test]
    fn test_forget_removes_watch() {
        let (rx, tx) = pipe();
        let mut reactor = Reactor::new().unwrap();
        reactor.on_read(rx.as_raw_fd(), Tag::A).unwrap();
        reactor.forget(rx.as_raw_fd()).unwrap();
        reactor.forget(rx.as_raw_fd()).unwrap(); // idempotent

        rustix::io::write(&tx, &[1]).unwrap();
        let mut fired = Vec::new();
        reactor
            .iterate(Some(Duration::from_millis(10)), &mut fired)
            .unwrap();
        assert!(fired.is_empty());
    }

    #[test]
    fn test_rearm_replaces_previous_watch() {
        let (rx, tx) = pipe();
        let mut reactor = Reactor::new().unwrap();
        reactor.on_read(rx.as_raw_fd(), Tag::A).unwrap();
        reactor.on_read(rx.as_raw_fd(), Tag::B).unwrap();

        rustix::io::write(&tx, &[1]).unwrap();
        let mut fired = Vec::new();
        reactor
            .iterate(Some(Duration::from_secs(1)), &mut fired)
            .unwrap();
        assert_eq!(fired, vec![Tag::B]);
    }

    #[test]
    fn test_multiple_fds_fire_together() {
        let (rx_a, tx_a) = pipe();
        let (rx_b, tx_b) = pipe();
        let mut reactor = Reactor::new().unwrap();
        reactor.on_read(rx_a.as_raw_fd(), Tag::A).unwrap();
        reactor.on_read(rx_b.as_raw_fd(), Tag::B).unwrap();

        rustix::io::write(&tx_a, &[1]).unwrap();
        rustix::io::write(&tx_b, &[1]).unwrap();
        let mut fired = Vec::new();
        reactor
            .iterate(Some(Duration::from_secs(1)), &mut fired)
            .unwrap();
        fired.sort_by_key(|tag| *tag == Tag::B);
        assert_eq!(fired, vec![Tag::A, Tag::B]);
    }
}

use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::Arc;

use crate::sys::EventFd;

/// Cross-thread wake channel for a worker's poller. Signals coalesce:
/// however many `wake` calls land before a `drain`, the poller observes a
/// single readable edge.
#[derive(Debug, Clone)]
pub struct Waker {
    inner: Arc<EventFd>,
}

impl Waker {
    pub fn new() -> io::Result<Waker> {
        let eventfd = EventFd::new()?;

        Ok(Waker {
            inner: Arc::new(eventfd),
        })
    }

    pub fn wake(&self) -> io::Result<()> {
        match self.inner.write(1) {
            Ok(_) => Ok(()),
            Err(e) => {
                if e.kind() == io::ErrorKind::WouldBlock {
                    Ok(())
                } else {
                    Err(e)
                }
            }
        }
    }

    pub fn drain(&self) -> io::Result<()> {
        match self.inner.read() {
            Ok(_) => Ok(()),
            Err(e) => {
                if e.kind() == io::ErrorKind::WouldBlock {
                    Ok(())
                } else {
                    Err(e)
                }
            }
        }
    }
}

impl AsRawFd for Waker {
    fn as_raw_fd(&self) -> RawFd {
        self.inner.as_raw_fd()
    }
}

#[cfg(test)]
mod test {
    use super::Waker;

    #[test]
    fn coalesce() {
        let waker = Waker::new().unwrap();

        waker.wake().unwrap();
        waker.wake().unwrap();
        waker.wake().unwrap();

        waker.drain().unwrap();
        // Nothing pending: drain absorbs WouldBlock.
        waker.drain().unwrap();
    }
}

use std::io;
use std::sync::Arc;
use std::time::Duration;

use crate::addr::Addr;
use crate::ctx::Ctx;
use crate::fsm::{EventKind, Token};
use crate::pipe::PipeEvents;

mod acceptor;
mod connector;

use acceptor::Acceptor;
use connector::Connector;

/// Upcalls an endpoint makes into the socket core that owns it.
pub trait EndpointBase: Send + Sync {
    /// The endpoint has fully torn down; it may now be freed.
    fn stopped(&self);
}

/// Everything an endpoint needs to know at creation. The address and
/// protocol id come from the owning socket; the rest has the defaults of
/// the wire protocol family.
#[derive(Debug, Clone)]
pub struct EndpointConfig {
    pub addr: Addr,
    /// Local protocol id sent in the header exchange.
    pub protocol: u16,
    pub hdr_timeout: Duration,
    pub backlog: i32,
    pub reconnect_ivl: Duration,
    pub reconnect_ivl_max: Duration,
}

impl EndpointConfig {
    pub fn new(addr: Addr, protocol: u16) -> EndpointConfig {
        EndpointConfig {
            addr,
            protocol,
            hdr_timeout: Duration::from_millis(1000),
            backlog: 10,
            reconnect_ivl: Duration::from_millis(100),
            reconnect_ivl_max: Duration::from_secs(1),
        }
    }
}

/// Doubling backoff between retries, capped and resettable.
pub(crate) struct Backoff {
    base: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Backoff {
        Backoff {
            base,
            max,
            current: base,
        }
    }

    pub fn next(&mut self) -> Duration {
        let delay = self.current;
        self.current = std::cmp::min(self.current * 2, self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.base;
    }
}

/// Caller's grip on a running endpoint: ask it to stop. Teardown is
/// asynchronous; [`EndpointBase::stopped`] fires when it is complete.
pub struct EndpointHandle {
    ctx: Ctx,
    ctl: Token,
}

impl EndpointHandle {
    pub fn stop(&self) {
        self.ctx.feed(self.ctl, EventKind::Stop);
    }
}

/// Create the bind-side endpoint: listen on `cfg.addr` and run one session
/// per accepted connection. Address and permanent listen errors surface
/// here; transient resource exhaustion is retried with backoff.
pub fn bind(
    ctx: &Ctx,
    cfg: EndpointConfig,
    shell: Arc<dyn PipeEvents>,
    base: Arc<dyn EndpointBase>,
) -> io::Result<EndpointHandle> {
    let ctl = ctx.spawn(move |r, ctl| Acceptor::create(r, ctl, cfg, shell, base))?;
    Ok(EndpointHandle {
        ctx: ctx.clone(),
        ctl,
    })
}

/// Create the connect-side endpoint: keep one session alive to `cfg.addr`,
/// reconnecting with backoff whenever it fails. Only address validation
/// errors surface here; connection failures are retried silently.
pub fn connect(
    ctx: &Ctx,
    cfg: EndpointConfig,
    shell: Arc<dyn PipeEvents>,
    base: Arc<dyn EndpointBase>,
) -> io::Result<EndpointHandle> {
    let ctl = ctx.spawn(move |r, ctl| Connector::create(r, ctl, cfg, shell, base))?;
    Ok(EndpointHandle {
        ctx: ctx.clone(),
        ctl,
    })
}

/// Errors worth retrying rather than surfacing: descriptor or buffer space
/// exhaustion that may clear up.
pub(crate) fn transient(e: &io::Error) -> bool {
    matches!(
        e.raw_os_error(),
        Some(libc::EMFILE) | Some(libc::ENFILE) | Some(libc::ENOBUFS) | Some(libc::ENOMEM)
    )
}

#[cfg(test)]
mod test {
    use super::Backoff;
    use std::time::Duration;

    #[test]
    fn backoff_doubles_to_cap() {
        let mut b = Backoff::new(Duration::from_millis(100), Duration::from_secs(1));

        assert_eq!(b.next(), Duration::from_millis(100));
        assert_eq!(b.next(), Duration::from_millis(200));
        assert_eq!(b.next(), Duration::from_millis(400));
        assert_eq!(b.next(), Duration::from_millis(800));
        assert_eq!(b.next(), Duration::from_secs(1));
        assert_eq!(b.next(), Duration::from_secs(1));

        b.reset();
        assert_eq!(b.next(), Duration::from_millis(100));
    }
}

use crate::poller::{Ready, Token};
use crate::sys;

/// One readiness notification: which fd (via its [`Token`]) and what
/// kinds of readiness it reported.
#[derive(Copy, Clone, Debug)]
pub struct Event {
    kind: Ready,
    token: Token,
}

impl Event {
    pub fn new(kind: Ready, token: Token) -> Event {
        Event { kind, token }
    }

    pub fn readiness(&self) -> Ready {
        self.kind
    }

    pub fn token(&self) -> Token {
        self.token
    }
}

/// Reusable buffer filled by [`Poller::wait`](crate::poller::Poller::wait).
pub struct Events {
    pub(crate) inner: sys::SysEvents,
}

impl Events {
    pub fn with_capacity(capacity: usize) -> Events {
        Events {
            inner: sys::SysEvents::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.len() == 0
    }

    pub fn get(&self, idx: usize) -> Option<Event> {
        self.inner.get(idx)
    }
}

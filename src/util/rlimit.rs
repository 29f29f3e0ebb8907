use std::sync::Mutex;

use libc::{rlim_t, RLIM_INFINITY};
use nix::sys::resource::{getrlimit, setrlimit, Resource};
use tracing::{debug, warn};

struct MemlockState {
    holders: usize,
    previous: Option<(rlim_t, rlim_t)>,
}

static MEMLOCK: Mutex<MemlockState> = Mutex::new(MemlockState {
    holders: 0,
    previous: None,
});

/// Keeps `RLIMIT_MEMLOCK` raised to infinity while alive.
///
/// Guards are reference counted process wide. The first one raises the limit
/// and the last one dropped restores the previous value.
pub struct MemlockGuard {
    counted: bool,
}

impl MemlockGuard {
    pub fn maximize() -> Result<Self, nix::Error> {
        let mut state = MEMLOCK.lock().unwrap_or_else(|e| e.into_inner());
        if state.holders == 0 {
            let (soft, hard) = getrlimit(Resource::RLIMIT_MEMLOCK)?;
            if soft != RLIM_INFINITY || hard != RLIM_INFINITY {
                setrlimit(Resource::RLIMIT_MEMLOCK, RLIM_INFINITY, RLIM_INFINITY)?;
                debug!("raised RLIMIT_MEMLOCK from soft={} hard={}", soft, hard);
                state.previous = Some((soft, hard));
            }
        }
        state.holders += 1;
        Ok(MemlockGuard { counted: true })
    }

    /// A guard that does not touch the limit, for backends that don't need it.
    pub fn noop() -> Self {
        MemlockGuard { counted: false }
    }
}

impl Drop for MemlockGuard {
    fn drop(&mut self) {
        if !self.counted {
            return;
        }

        let mut state = MEMLOCK.lock().unwrap_or_else(|e| e.into_inner());
        state.holders -= 1;
        if state.holders > 0 {
            return;
        }
        if let Some((soft, hard)) = state.previous.take() {
            if let Err(e) = setrlimit(Resource::RLIMIT_MEMLOCK, soft, hard) {
                warn!("failed to restore RLIMIT_MEMLOCK: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guard_restores_limit() {
        let before = getrlimit(Resource::RLIMIT_MEMLOCK).unwrap();
        // Unprivileged users can't raise the hard limit.
        let Ok(guard) = MemlockGuard::maximize() else {
            return;
        };
        let nested = MemlockGuard::maximize().unwrap();
        assert_eq!(
            getrlimit(Resource::RLIMIT_MEMLOCK).unwrap(),
            (RLIM_INFINITY, RLIM_INFINITY)
        );
        drop(guard);
        assert_eq!(
            getrlimit(Resource::RLIMIT_MEMLOCK).unwrap(),
            (RLIM_INFINITY, RLIM_INFINITY)
        );
        drop(nested);
        assert_eq!(getrlimit(Resource::RLIMIT_MEMLOCK).unwrap(), before);
    }
}

//! Connect hooks: decide whether an accepted local connection may be
//! forwarded.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Called for every connection accepted by a Forwarding Client.
///
/// Returning `Err(reason)` closes the local connection; the forwarder keeps
/// listening.
pub trait ConnectHook: Send + Sync {
    fn check(&self, peer: SocketAddr) -> Result<(), String>;
}

impl<F> ConnectHook for F
where
    F: Fn(SocketAddr) -> Result<(), String> + Send + Sync,
{
    fn check(&self, peer: SocketAddr) -> Result<(), String> {
        self(peer)
    }
}

/// Sliding-window limiter keyed by source IP.
#[derive(Debug)]
pub struct RateLimiter {
    /// Maximum attempts allowed within the window.
    max_attempts: u32,
    window: Duration,
    entries: HashMap<IpAddr, Vec<Instant>>,
}

impl RateLimiter {
    pub fn new(max_attempts: u32, window: Duration) -> Self {
        Self {
            max_attempts,
            window,
            entries: HashMap::new(),
        }
    }

    /// Check if an attempt is allowed for `key`, and record it if so.
    pub fn check_and_record(&mut self, key: IpAddr) -> bool {
        let now = Instant::now();
        let window = self.window;
        let attempts = self.entries.entry(key).or_default();

        // Remove expired entries
        attempts.retain(|t| now.duration_since(*t) < window);

        if attempts.len() as u32 >= self.max_attempts {
            return false;
        }
        attempts.push(now);
        true
    }

    /// Garbage-collect expired entries to prevent memory growth.
    pub fn gc(&mut self) {
        let now = Instant::now();
        let window = self.window;
        self.entries.retain(|_, attempts| {
            attempts.retain(|t| now.duration_since(*t) < window);
            !attempts.is_empty()
        });
    }

    pub fn tracked(&self) -> usize {
        self.entries.len()
    }
}

/// [`ConnectHook`] that admits at most `max_attempts` connections per source
/// IP within a rolling window.
#[derive(Debug)]
pub struct RateLimitHook {
    limiter: Mutex<RateLimiter>,
}

impl RateLimitHook {
    pub fn new(max_attempts: u32, window: Duration) -> Self {
        Self {
            limiter: Mutex::new(RateLimiter::new(max_attempts, window)),
        }
    }
}

impl ConnectHook for RateLimitHook {
    fn check(&self, peer: SocketAddr) -> Result<(), String> {
        let mut limiter = self
            .limiter
            .lock()
            .map_err(|_| "rate limiter poisoned".to_string())?;
        if limiter.tracked() > 4096 {
            limiter.gc();
        }
        if limiter.check_and_record(peer.ip()) {
            Ok(())
        } else {
            Err(format!("rate limit exceeded for {}", peer.ip()))
        }
    }
}

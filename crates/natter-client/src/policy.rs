//! Target policy for the Listening Client: which targets a forwarded session
//! may open, and how many sessions may run at once.
//!
//! The policy layer is split into two types:
//!
//! - [`TargetPolicy`]: a plain configuration struct holding the rules.
//! - [`TargetPolicyEnforcer`]: the runtime counterpart that owns the parsed
//!   rules plus an atomic session counter.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Static target access-control configuration.
///
/// `allowed_targets` supports these forms:
///
/// | Pattern             | Matches                               |
/// |---------------------|---------------------------------------|
/// | `"*"`               | Any host and port.                    |
/// | `"db.internal"`     | The exact host on **any** port.       |
/// | `"127.0.0.1:22"`    | The exact host **and** port pair.     |
/// | `"*:8080"`          | Any host on the given port.           |
/// | `"[::1]:22"`        | An IPv6 host and port.                |
///
/// `localhost`, `127.0.0.1`, `::1` and an empty host (as in the target
/// `:22`) all name the local machine and match each other. Other hosts are
/// compared case-insensitively, without DNS resolution.
///
/// An empty list allows no TCP targets.
#[derive(Debug, Clone)]
pub struct TargetPolicy {
    /// Target patterns, see the table above.
    pub allowed_targets: Vec<String>,
    /// Maximum concurrent sessions served by this listener.
    pub max_sessions: usize,
    /// Whether a forward may run a local command instead of dialing.
    pub allow_commands: bool,
}

/// Default policy: any TCP target, 256 sessions, no commands.
impl Default for TargetPolicy {
    fn default() -> Self {
        Self {
            allowed_targets: vec!["*".to_string()],
            max_sessions: 256,
            allow_commands: false,
        }
    }
}

/// One parsed `allowed_targets` entry. `None` means any.
#[derive(Debug, Clone, PartialEq, Eq)]
struct TargetPattern {
    host: Option<String>,
    port: Option<u16>,
}

impl TargetPattern {
    fn parse(pattern: &str) -> Self {
        let pattern = pattern.trim();
        if pattern == "*" {
            return Self { host: None, port: None };
        }
        // `[v6]:port` or `[v6]`
        if let Some(rest) = pattern.strip_prefix('[') {
            if let Some((host, tail)) = rest.split_once(']') {
                let port = tail.strip_prefix(':').and_then(|p| p.parse().ok());
                return Self::new(host, port);
            }
        }
        // A bare IPv6 address has several colons and no port.
        if pattern.matches(':').count() > 1 {
            return Self::new(pattern, None);
        }
        match pattern.rsplit_once(':') {
            Some((host, port)) => match port.parse() {
                Ok(port) => Self::new(host, Some(port)),
                Err(_) => Self::new(pattern, None),
            },
            None => Self::new(pattern, None),
        }
    }

    fn new(host: &str, port: Option<u16>) -> Self {
        let host = (host != "*").then(|| canonical_host(host));
        Self { host, port }
    }

    fn matches(&self, host: &str, port: u16) -> bool {
        self.host.as_ref().map_or(true, |h| *h == host) && self.port.map_or(true, |p| p == port)
    }
}

/// Lower-case `host`, folding every spelling of the local machine into one.
fn canonical_host(host: &str) -> String {
    let host = host.trim_start_matches('[').trim_end_matches(']');
    match host.to_ascii_lowercase().as_str() {
        "" | "localhost" | "127.0.0.1" | "::1" => "localhost".to_string(),
        other => other.to_string(),
    }
}

/// Runtime policy enforcer with atomic session tracking.
#[derive(Debug)]
pub struct TargetPolicyEnforcer {
    policy: TargetPolicy,
    patterns: Vec<TargetPattern>,
    active_sessions: Arc<AtomicUsize>,
}

impl TargetPolicyEnforcer {
    pub fn new(policy: TargetPolicy) -> Self {
        let patterns = policy
            .allowed_targets
            .iter()
            .map(|p| TargetPattern::parse(p))
            .collect();
        Self {
            policy,
            patterns,
            active_sessions: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Check if a session to `host:port` is allowed.
    ///
    /// # Arguments
    ///
    /// * `host` - target host as requested; empty means the local machine.
    /// * `port` - target port.
    ///
    /// # Errors
    ///
    /// Returns `Err(String)` if no `allowed_targets` entry matches.
    pub fn check_target(&self, host: &str, port: u16) -> Result<(), String> {
        let canonical = canonical_host(host);
        if self.patterns.iter().any(|p| p.matches(&canonical, port)) {
            return Ok(());
        }
        Err(format!("target not allowed: {canonical}:{port}"))
    }

    /// Check if a session may run `command`.
    ///
    /// # Errors
    ///
    /// Returns `Err(String)` if commands are disabled or `command` is empty.
    pub fn check_command(&self, command: &[String]) -> Result<(), String> {
        if !self.policy.allow_commands {
            return Err("target commands are disabled".to_string());
        }
        if command.first().map_or(true, |c| c.is_empty()) {
            return Err("empty target command".to_string());
        }
        Ok(())
    }

    /// Count one running session until the returned guard is dropped.
    ///
    /// The limit check and the increment are one atomic step, so concurrent
    /// sessions never exceed `max_sessions`.
    ///
    /// # Errors
    ///
    /// Returns `Err(String)` when `max_sessions` sessions are already running.
    pub fn try_acquire(&self) -> Result<SessionGuard, String> {
        let max = self.policy.max_sessions;
        self.active_sessions
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < max).then_some(n + 1)
            })
            .map_err(|current| format!("session limit reached ({current}/{max})"))?;
        Ok(SessionGuard {
            counter: self.active_sessions.clone(),
        })
    }

    pub fn active_sessions(&self) -> usize {
        self.active_sessions.load(Ordering::Acquire)
    }
}

/// RAII guard that decrements the session count on drop.
#[derive(Debug)]
pub struct SessionGuard {
    counter: Arc<AtomicUsize>,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::AcqRel);
    }
}

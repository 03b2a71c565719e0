//! Named fault-injection points used by crash and error-path tests.
//!
//! A point is active when it was enabled on the current thread or when it is
//! listed in the comma separated `STRATA_FAILPOINTS` environment variable.
use std::cell::RefCell;
use std::collections::HashSet;
use std::io;

pub const ENV_VAR: &str = "STRATA_FAILPOINTS";

thread_local! {
    static FAILPOINTS: RefCell<HashSet<String>> = RefCell::new(HashSet::new());
}

pub fn enable(name: &str) {
    FAILPOINTS.with(|set| {
        set.borrow_mut().insert(name.to_string());
    });
}

pub fn disable(name: &str) {
    FAILPOINTS.with(|set| {
        set.borrow_mut().remove(name);
    });
}

pub fn clear() {
    FAILPOINTS.with(|set| set.borrow_mut().clear());
}

pub fn is_enabled(name: &str) -> bool {
    if FAILPOINTS.with(|set| set.borrow().contains(name)) {
        return true;
    }
    std::env::var(ENV_VAR)
        .map(|raw| raw.split(',').any(|v| v.trim() == name))
        .unwrap_or(false)
}

pub fn maybe_fail(name: &str) -> io::Result<()> {
    if is_enabled(name) {
        Err(io::Error::other(format!("failpoint triggered: {name}")))
    } else {
        Ok(())
    }
}

/// Enables a point on the current thread until dropped.
#[must_use]
pub struct FailpointGuard {
    name: String,
}

impl FailpointGuard {
    pub fn new(name: &str) -> Self {
        enable(name);
        Self {
            name: name.to_string(),
        }
    }
}

impl Drop for FailpointGuard {
    fn drop(&mut self) {
        disable(&self.name);
    }
}

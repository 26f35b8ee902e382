//! Named failpoints for crash testing.
//!
//! A failpoint is armed per thread with [`enable`] (or process-wide through
//! the `LODEDB_FAILPOINTS` environment variable, a comma separated list).
//! Engine code calls [`maybe_fail`] at the point of interest; an armed
//! failpoint turns into an I/O error there.
//!
//! Failpoints used by the engine:
//!
//! | name                     | effect                                          |
//! |--------------------------|-------------------------------------------------|
//! | `commit.before_flush`    | commit fails after appending its record, before the log flush |
//! | `log.sync`               | the log flush fails (fatal)                     |
//! | `cache.write_page`       | page write-back fails                           |
//! | `checkpoint.before_record` | checkpoint fails after flushing pages         |

use std::cell::RefCell;
use std::collections::HashSet;
use std::io;

/// Environment variable listing failpoints armed for every thread.
pub const FAILPOINTS_ENV: &str = "LODEDB_FAILPOINTS";

thread_local! {
    static FAILPOINTS: RefCell<HashSet<String>> = RefCell::new(HashSet::new());
}

/// Arms a failpoint on the current thread.
pub fn enable(name: &str) {
    FAILPOINTS.with(|set| {
        set.borrow_mut().insert(name.to_string());
    });
}

/// Disarms a failpoint on the current thread.
pub fn disable(name: &str) {
    FAILPOINTS.with(|set| {
        set.borrow_mut().remove(name);
    });
}

/// Disarms every failpoint on the current thread.
pub fn clear() {
    FAILPOINTS.with(|set| {
        set.borrow_mut().clear();
    });
}

/// Returns true if the failpoint is armed for this thread.
#[must_use]
pub fn is_enabled(name: &str) -> bool {
    if FAILPOINTS.with(|set| set.borrow().contains(name)) {
        return true;
    }

    std::env::var(FAILPOINTS_ENV)
        .ok()
        .map(|raw| raw.split(',').any(|v| v.trim() == name))
        .unwrap_or(false)
}

/// Returns an error if the failpoint is armed.
///
/// # Errors
///
/// Returns an I/O error naming the failpoint.
pub fn maybe_fail(name: &str) -> io::Result<()> {
    if is_enabled(name) {
        Err(io::Error::other(format!("failpoint triggered: {name}")))
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enable_disable_is_thread_local() {
        enable("test.point");
        assert!(is_enabled("test.point"));
        assert!(maybe_fail("test.point").is_err());

        let other = std::thread::spawn(|| is_enabled("test.point"))
            .join()
            .unwrap();
        assert!(!other);

        disable("test.point");
        assert!(maybe_fail("test.point").is_ok());
    }

    #[test]
    fn clear_disarms_all() {
        enable("a");
        enable("b");
        clear();
        assert!(!is_enabled("a"));
        assert!(!is_enabled("b"));
    }
}

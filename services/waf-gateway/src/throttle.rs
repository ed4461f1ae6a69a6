use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

static LAST_EMIT: Lazy<Mutex<HashMap<&'static str, Instant>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

const EMIT_INTERVAL: Duration = Duration::from_secs(60);

/// Dependency failures fail open and can repeat on every request; cap the
/// resulting log volume to one record per failure class per minute.
pub fn should_log(class: &'static str) -> bool {
    let Ok(mut guard) = LAST_EMIT.lock() else {
        return true;
    };
    let now = Instant::now();
    match guard.get(class) {
        Some(last) if now.duration_since(*last) < EMIT_INTERVAL => false,
        _ => {
            guard.insert(class, now);
            true
        }
    }
}

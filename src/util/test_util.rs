use std::panic;
use std::sync::Mutex;

lazy_static! {
    static ref SERIAL_TEST_LOCK: Mutex<()> = Mutex::default();
}

// Tests that touch process-wide state (environment variables) run one at a time.
// A panicking test poisons the lock; later tests still get it.
pub fn serial_test<F>(f: F)
where
    F: FnOnce(),
{
    let _lock = SERIAL_TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    f();
}

// Always execute a cleanup closure no matter the test panics or not.
pub fn with_cleanup<T, C>(test: T, cleanup: C)
where
    T: FnOnce() + panic::UnwindSafe,
    C: FnOnce(),
{
    let res = panic::catch_unwind(test);
    cleanup();
    if let Err(e) = res {
        panic::resume_unwind(e);
    }
}

// Run `test` with the given environment variables set, and remove them afterwards.
pub fn with_env_vars<T>(vars: &[(&str, &str)], test: T)
where
    T: FnOnce() + panic::UnwindSafe,
{
    for (key, value) in vars {
        std::env::set_var(key, value);
    }
    with_cleanup(test, || {
        for (key, _) in vars {
            std::env::remove_var(key);
        }
    })
}

use std::sync::atomic::{AtomicBool, Ordering};

static ENABLED: AtomicBool = AtomicBool::new(true);

#[inline(always)]
pub fn is_enabled() -> bool {
    ENABLED.load(Ordering::SeqCst)
}

pub fn disable() {
    ENABLED.store(false, Ordering::SeqCst)
}

pub fn enable() {
    ENABLED.store(true, Ordering::SeqCst)
}

/// Install `env_logger` as a logging backend, `RUST_LOG` controls verbosity.
/// Safe to call more than once, only the first call takes effect.
pub fn init() {
    _ = env_logger::Builder::from_default_env()
        .format_timestamp_millis()
        .try_init();
}

#[macro_export]
macro_rules! rd_info {
    (target: $target:expr, $($arg:tt)+) => {
        if $crate::log::is_enabled() {
            ::log::info!(target: $target, $($arg)+)
        }
    };
    ($($arg:tt)+) => {
        if $crate::log::is_enabled() {
            ::log::info!($($arg)+)
        }
    };
}

#[macro_export]
macro_rules! rd_warn {
    (target: $target:expr, $($arg:tt)+) => {
        if $crate::log::is_enabled() {
            ::log::warn!(target: $target, $($arg)+)
        }
    };
    ($($arg:tt)+) => {
        if $crate::log::is_enabled() {
            ::log::warn!($($arg)+)
        }
    };
}

#[macro_export]
macro_rules! rd_error {
    (target: $target:expr, $($arg:tt)+) => {
        if $crate::log::is_enabled() {
            ::log::error!(target: $target, $($arg)+)
        }
    };
    ($($arg:tt)+) => {
        if $crate::log::is_enabled() {
            ::log::error!($($arg)+)
        }
    };
}

#[macro_export]
macro_rules! rd_debug {
    (target: $target:expr, $($arg:tt)+) => {
        if $crate::log::is_enabled() {
            ::log::debug!(target: $target, $($arg)+)
        }
    };
    ($($arg:tt)+) => {
        if $crate::log::is_enabled() {
            ::log::debug!($($arg)+)
        }
    };
}

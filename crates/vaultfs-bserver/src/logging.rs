//! Process-wide tracing subscriber setup.

use tracing::level_filters::LevelFilter;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Install a `fmt` subscriber filtered by `RUST_LOG`. With `debug` set,
/// debug-level events are enabled regardless of the environment.
///
/// Returns false if a global subscriber was already installed.
pub fn init_logging(debug: bool) -> bool {
    let mut filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();
    if debug {
        filter = filter.add_directive(LevelFilter::DEBUG.into());
    }
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .try_init()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_init_is_harmless() {
        let _ = init_logging(true);
        assert!(!init_logging(false));
    }
}

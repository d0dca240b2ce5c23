//! Logger initialization. Every worker thread and the producer-facing API
//! log through the `log` crate; nothing in the workspace calls `println!`
//! for anything other than test assertions.

use once_cell::sync::OnceCell;

static INIT: OnceCell<()> = OnceCell::new();

/// Initialize the process-wide logger. Safe to call more than once (and
/// from more than one thread); only the first call has an effect.
pub fn init() {
    INIT.get_or_init(|| {
        let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn"))
            .try_init();
    });
}

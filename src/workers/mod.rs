pub mod cleanup;
pub mod revoked_token_cleanup;

pub use cleanup::{run_handler_sweep, spawn_agent_cache_cleanup};
pub use revoked_token_cleanup::revoked_token_cleanup_worker;

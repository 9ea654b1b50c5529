pub mod inference;
pub mod info;
pub mod lifecycle;

// Re-export all handlers for easy route registration
pub use inference::{list_models_handler, ollama_handler};
pub use info::{debug_handler, metrics_handler, root_handler};
pub use lifecycle::{
    conditional_shutdown_handler, forced_shutdown_handler, init_handler,
    permanent_on_disable_handler, permanent_on_enable_handler, status_handler, test_handler,
    wake_handler,
};

pub mod bundle;
pub mod checkpoint;
pub mod config;
pub mod dag;
pub mod errors;
pub mod lifecycle;
pub mod loader;
pub mod logging;
pub mod state;
pub mod store;

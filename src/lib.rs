pub mod config;
pub mod errors;
pub mod integrations;
pub mod lock;
pub mod logging;
pub mod pipeline;
pub mod server;
pub mod store;
pub mod util;
pub mod worker;

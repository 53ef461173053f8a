//! CLI command implementations.
//!
//! | Module    | Commands handled      |
//! |-----------|-----------------------|
//! | `serve`   | `Serve`, `Sweep`      |
//! | `records` | `Jobs`, `Clones`      |
//! | `config`  | `Config`              |

pub mod config;
pub mod records;
pub mod serve;

pub use config::cmd_config;
pub use records::{cmd_clones, cmd_jobs};
pub use serve::{cmd_serve, cmd_sweep};

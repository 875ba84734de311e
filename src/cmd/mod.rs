//! CLI command implementations.
//!
//! | Module     | Commands handled                 |
//! |------------|----------------------------------|
//! | `sessions` | `Sessions`, `Status`, `History`  |
//! | `config`   | `Config`                         |

pub mod config;
pub mod sessions;

pub use config::cmd_config;
pub use sessions::{cmd_history, cmd_sessions, cmd_status};

//! CLI command implementations.
//!
//! Each submodule owns one `Commands` variant:
//!
//! | Module   | Commands handled |
//! |----------|------------------|
//! | `serve`  | `Serve`          |
//! | `watch`  | `Watch`          |
//! | `config` | `Config`         |

pub mod config;
pub mod serve;
pub mod watch;

pub use config::cmd_config;
pub use serve::cmd_serve;
pub use watch::cmd_watch;

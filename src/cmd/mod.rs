//! CLI command implementations.
//!
//! | Module     | Commands handled |
//! |------------|------------------|
//! | `serve`    | `Serve`          |
//! | `validate` | `Validate`       |

pub mod serve;
pub mod validate;

pub use serve::cmd_serve;
pub use validate::cmd_validate;

//! Testing infrastructure for Meridian Core
//!
//! Helpers shared by unit tests and the integration tests under `tests/`.
//!
//! - **TestContext**: temporary directory plus a manual clock; databases
//!   opened through it live under the directory and are removed on drop
//! - **ChunkedReader**: in-memory reader that hands out at most N bytes per
//!   `read` call, for exercising buffer refill boundaries
//!
//! # Usage
//!
//! ```rust,no_run
//! use meridian_core::testing::TestContext;
//!
//! let ctx = TestContext::new();
//! let database = ctx.database("db");
//! database.put_document("users/1", &serde_json::json!({"Name": "Ayende"})).unwrap();
//! ```

mod context;
mod io;

pub use context::TestContext;
pub use io::ChunkedReader;

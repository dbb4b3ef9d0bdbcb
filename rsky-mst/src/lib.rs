#[macro_use]
extern crate serde_derive;
extern crate serde;

pub mod block_map;
pub mod cid_set;
pub mod config;
pub mod data_diff;
pub mod error;
pub mod ipld;
pub mod mst;
pub mod storage;

pub use config::MstConfig;
pub use data_diff::DataDiff;
pub use error::{MstError, Result};
pub use mst::MST;

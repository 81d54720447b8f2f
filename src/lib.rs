pub mod config;
pub mod engine;
pub mod error;
pub mod protocol;
pub mod reduce;
pub mod tracker;
pub(crate) mod transport;
pub mod types;

pub use config::TenaxConfig;
pub use engine::TenaxEngine;
pub use error::{Result, TenaxError};
pub use protocol::TrackerMessage;
pub use reduce::{OpReducer, Reducer, reduce_slice};
pub use tracker::Tracker;
pub use types::{DataType, Rank, ReduceOp, SeqNo};

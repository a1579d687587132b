#![warn(missing_docs)]
#![doc = include_str!("../README.md")]

pub mod context;
pub mod dispatch;
pub mod error;
pub mod packet;
pub mod pipeline;
pub mod state;

pub use context::{Context, MAX_CONTEXT_SIZE};
pub use dispatch::{
    DispatchError, DispatchTable, DispatchTableBuilder, Disposition, Outcome, StageFn,
};
pub use error::Error;
pub use packet::{PacketError, PacketView};
pub use pipeline::{
    IngressMeta, Invocation, MAX_TAIL_CALL_CNT, Pipeline, PipelineConfig, PipelineConfigBuilder,
    Verdict,
};
pub use state::{AuxState, Counter, CounterArray};

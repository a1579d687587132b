//! The trampoline that drives a packet through a [`DispatchTable`]
//!
//! ```text
//!             ┌─────────┐ Continue(1, ctx) ┌─────────┐ Continue(4, ctx) ┌─────────┐
//! packet ───► │ stage 0 │ ───────────────► │ stage 1 │ ───────────────► │ stage 4 │ ───► Terminal
//!             └─────────┘                  └─────────┘                  └─────────┘
//! ```
//!
//! Every arrow goes through [`Pipeline::run`], which validates the requested
//! index before entering the next stage and bounds the number of transfers,
//! the same way the kernel bounds tail calls.

use crate::{
    context::Context,
    dispatch::{DispatchError, DispatchTable, Disposition, Outcome},
    error::{ConfigError, ConfigErrorKind},
    packet::PacketView,
    state::{AuxState, Counter},
};

/// The kernel's limit on the number of tail calls a single program invocation
/// can make (`MAX_TAIL_CALL_CNT`)
pub const MAX_TAIL_CALL_CNT: u32 = 33;

/// Metadata the host provides alongside the packet
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct IngressMeta {
    /// The index of the interface the packet was received on
    pub ifindex: u32,
    /// The receive queue the packet was received on
    pub rx_queue: u32,
}

/// Everything a stage can touch while it runs
pub struct Invocation<'view, 'buf> {
    /// The packet being processed
    pub packet: &'view mut PacketView<'buf>,
    /// Metadata about where the packet came from
    pub meta: IngressMeta,
    /// State shared with other invocations
    pub state: &'view dyn AuxState,
    stage: u32,
}

impl Invocation<'_, '_> {
    /// The index of the currently running stage
    #[inline]
    pub fn stage(&self) -> u32 {
        self.stage
    }
}

/// Configuration for a [`Pipeline`]
#[derive(Copy, Clone, Debug)]
pub struct PipelineConfig {
    max_transfers: u32,
    entry: u32,
}

impl PipelineConfig {
    /// The maximum number of transfers a single invocation can make
    #[inline]
    pub fn max_transfers(&self) -> u32 {
        self.max_transfers
    }

    /// The index of the stage every invocation starts at
    #[inline]
    pub fn entry(&self) -> u32 {
        self.entry
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_transfers: MAX_TAIL_CALL_CNT,
            entry: 0,
        }
    }
}

/// Builder for a [`PipelineConfig`]
pub struct PipelineConfigBuilder {
    /// The maximum number of transfers a single invocation can make before
    /// it is aborted, in `1..=`[`MAX_TAIL_CALL_CNT`]
    ///
    /// Defaults to [`MAX_TAIL_CALL_CNT`]
    pub max_transfers: u32,
    /// The index of the stage every invocation starts at, defaults to 0
    pub entry: u32,
}

impl Default for PipelineConfigBuilder {
    fn default() -> Self {
        Self {
            max_transfers: MAX_TAIL_CALL_CNT,
            entry: 0,
        }
    }
}

impl PipelineConfigBuilder {
    /// Sets [`Self::max_transfers`]
    #[inline]
    pub fn max_transfers(&mut self, max: u32) -> &mut Self {
        self.max_transfers = max;
        self
    }

    /// Sets [`Self::entry`]
    #[inline]
    pub fn entry(&mut self, entry: u32) -> &mut Self {
        self.entry = entry;
        self
    }

    /// Validates the configuration
    pub fn build(&self) -> Result<PipelineConfig, ConfigError> {
        let max_transfers = crate::within_range!(
            self,
            max_transfers,
            1..MAX_TAIL_CALL_CNT as usize + 1
        );

        Ok(PipelineConfig {
            max_transfers,
            entry: self.entry,
        })
    }
}

/// The result of running a packet through a [`Pipeline`]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Verdict {
    /// What should happen to the packet
    pub disposition: Disposition,
    /// The number of transfers that were made
    pub transfers: u32,
    /// The dispatch failure that ended processing, if any
    pub failure: Option<DispatchError>,
}

impl Verdict {
    /// True if processing was ended by a dispatch failure
    #[inline]
    pub fn is_failure(&self) -> bool {
        self.failure.is_some()
    }
}

/// A [`DispatchTable`] plus the trampoline that runs packets through it
///
/// The pipeline is immutable, and can be shared between threads each running
/// their own invocations
#[derive(Debug)]
pub struct Pipeline<C: Context, const N: usize> {
    table: DispatchTable<C, N>,
    config: PipelineConfig,
}

impl<C: Context, const N: usize> Pipeline<C, N> {
    /// Creates a pipeline
    ///
    /// # Errors
    ///
    /// The configured entry stage is not registered in the table
    pub fn new(table: DispatchTable<C, N>, config: PipelineConfig) -> Result<Self, ConfigError> {
        if !table.is_registered(config.entry) {
            return Err(ConfigError {
                name: "entry",
                kind: ConfigErrorKind::Unregistered {
                    index: config.entry,
                },
            });
        }

        Ok(Self { table, config })
    }

    /// The table of stages
    #[inline]
    pub fn table(&self) -> &DispatchTable<C, N> {
        &self.table
    }

    /// The configuration
    #[inline]
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Runs the packet through the pipeline, starting at the entry stage with
    /// a default context
    #[inline]
    pub fn run(
        &self,
        packet: &mut PacketView<'_>,
        meta: IngressMeta,
        state: &dyn AuxState,
    ) -> Verdict {
        self.run_with(packet, meta, state, C::default())
    }

    /// Runs the packet through the pipeline, starting at the entry stage with
    /// the specified context
    ///
    /// Transfers are executed until a stage returns a terminal outcome, a
    /// stage requests a transfer to an invalid index, or the number of
    /// transfers would exceed [`PipelineConfig::max_transfers`]. The latter
    /// two end with [`Disposition::Aborted`].
    pub fn run_with(
        &self,
        packet: &mut PacketView<'_>,
        meta: IngressMeta,
        state: &dyn AuxState,
        context: C,
    ) -> Verdict {
        let max = self.config.max_transfers;
        let mut index = self.config.entry;
        let mut context = context;
        let mut transfers = 0;

        let mut stage = match self.table.transfer(index) {
            Ok(stage) => stage,
            Err(err) => return Self::fail(state, err, transfers),
        };

        for _ in 0..=max {
            state.increment(Counter::Stage(index));

            let outcome = {
                let mut invocation = Invocation {
                    packet: &mut *packet,
                    meta,
                    state,
                    stage: index,
                };

                stage(&mut invocation, context)
            };

            match outcome {
                Outcome::Terminal(disposition) => {
                    state.increment(match disposition {
                        Disposition::Aborted => Counter::Aborted,
                        Disposition::Drop => Counter::Drop,
                        Disposition::Pass => Counter::Pass,
                        Disposition::Tx => Counter::Tx,
                        Disposition::Redirect { .. } => Counter::Redirect,
                    });

                    return Verdict {
                        disposition,
                        transfers,
                        failure: None,
                    };
                }
                Outcome::Continue {
                    next,
                    context: carried,
                } => {
                    if transfers == max {
                        let err = DispatchError::ChainLimit { limit: max };
                        return Self::fail(state, err, transfers);
                    }

                    stage = match self.table.transfer(next) {
                        Ok(stage) => stage,
                        Err(err) => return Self::fail(state, err, transfers),
                    };

                    log::trace!("stage {index} transferring to stage {next}");
                    index = next;
                    context = carried;
                    transfers += 1;
                }
            }
        }

        // Every iteration either returns or makes a transfer, and the transfer
        // count is checked before each transfer, so this is never reached
        Self::fail(state, DispatchError::ChainLimit { limit: max }, transfers)
    }

    #[inline]
    fn fail(state: &dyn AuxState, err: DispatchError, transfers: u32) -> Verdict {
        log::debug!("aborting after {transfers} transfer(s): {err}");

        state.increment(match err {
            DispatchError::ChainLimit { .. } => Counter::ChainLimit,
            DispatchError::InvalidIndex { .. } | DispatchError::AlreadyRegistered { .. } => {
                Counter::InvalidIndex
            }
        });
        state.increment(Counter::Aborted);

        Verdict {
            disposition: Disposition::Aborted,
            transfers,
            failure: Some(err),
        }
    }
}

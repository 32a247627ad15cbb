// SPDX-License-Identifier: AGPL-3.0-only

//! Split one force evaluation across every context of a [`PlatformData`].
//!
//! Each evaluation is a begin/finish pair:
//!
//! ```text
//!   begin    context 0 positions ──download──▶ staging
//!            every worker: (i > 0) upload staging → posq, evaluator.begin,
//!                          (periodic) read the neighbor-list tile count
//!   finish   every worker: evaluator.finish → context_energy[i],
//!                          (i > 0) force ──download──▶ staging slot i-1,
//!                          completion timestamp, neighbor-list overflow check
//!            sync, sum energies
//!            context 0: staging → force buffers 1..n, reduce into buffer 0
//!            early evaluations: shift 0.001 of the nonbonded work from the
//!                               slowest context to the fastest
//! ```
//!
//! A context whose neighbor list overflowed grows the list and clears the
//! caller's `valid` flag; the caller repeats the evaluation.

use crate::context::ComputeContext;
use crate::error::{ContextError, Result};
use crate::platform::PlatformData;
use crate::work::lock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

/// Largest share of the nonbonded work moved per rebalance.
const MAX_TRANSFER: f64 = 0.001;

/// The per-context half of a force evaluation.
pub trait ForceEvaluator: Send {
    /// Launch this context's share of the evaluation.
    ///
    /// # Errors
    ///
    /// Any device failure.
    fn begin(&mut self, ctx: &mut ComputeContext, include_forces: bool, include_energy: bool, groups: u32)
        -> Result<()>;

    /// Wait for this context's share and return its energy. Clear `valid`
    /// if the results must be recomputed.
    ///
    /// # Errors
    ///
    /// Any device failure.
    fn finish(
        &mut self,
        ctx: &mut ComputeContext,
        include_forces: bool,
        include_energy: bool,
        groups: u32,
        valid: &mut bool,
    ) -> Result<f64>;
}

/// Wall clock used to time when each context finished.
pub trait CompletionClock: Send + Sync {
    fn now_us(&self) -> i64;
}

/// Microseconds since the Unix epoch.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl CompletionClock for SystemClock {
    fn now_us(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| i64::try_from(d.as_micros()).unwrap_or(i64::MAX))
    }
}

/// Shares of the nonbonded work, one per context, summing to 1.
#[derive(Debug, Clone, PartialEq)]
pub struct PartitionBalancer {
    fractions: Vec<f64>,
}

impl PartitionBalancer {
    /// Equal shares for `contexts` contexts.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn new(contexts: usize) -> Self {
        let n = contexts.max(1);
        Self {
            fractions: vec![1.0 / n as f64; n],
        }
    }

    #[must_use]
    pub fn fractions(&self) -> &[f64] {
        &self.fractions
    }

    /// `[start, end)` per context; the last range always ends at exactly 1.
    #[must_use]
    pub fn boundaries(&self) -> Vec<(f64, f64)> {
        let last = self.fractions.len() - 1;
        let mut start = 0.0;
        self.fractions
            .iter()
            .enumerate()
            .map(|(i, f)| {
                let end = if i == last { 1.0 } else { (start + f).min(1.0) };
                let range = (start, end);
                start = end;
                range
            })
            .collect()
    }

    /// Move up to 0.001 of the work from the context that finished last to
    /// the one that finished first, and return the new boundaries.
    ///
    /// Ties move nothing.
    pub fn rebalance(&mut self, completion_us: &[i64]) -> Vec<(f64, f64)> {
        if completion_us.len() == self.fractions.len() {
            let (mut first, mut last) = (0, 0);
            for (i, &t) in completion_us.iter().enumerate() {
                if t < completion_us[first] {
                    first = i;
                }
                if t > completion_us[last] {
                    last = i;
                }
            }
            if first != last {
                let delta = self.fractions[last].min(MAX_TRANSFER);
                self.fractions[first] += delta;
                self.fractions[last] -= delta;
                log::debug!("rebalanced {delta} of nonbonded work from context {last} to {first}");
            }
        }
        self.boundaries()
    }
}

type SharedEvaluator = Arc<Mutex<Box<dyn ForceEvaluator>>>;

/// Runs one [`ForceEvaluator`] per context and merges their results.
pub struct ParallelCalcForcesAndEnergy {
    evaluators: Vec<SharedEvaluator>,
    balancer: PartitionBalancer,
    completion: Arc<Mutex<Vec<i64>>>,
    tile_counts: Arc<Mutex<Vec<Option<usize>>>>,
    position_staging: Arc<Mutex<Vec<u8>>>,
    force_staging: Vec<Arc<Mutex<Vec<u8>>>>,
    clock: Arc<dyn CompletionClock>,
}

impl ParallelCalcForcesAndEnergy {
    /// Pair `evaluators[i]` with context `i` and give every context an equal
    /// share of the nonbonded work.
    ///
    /// # Errors
    ///
    /// [`ContextError::IllegalArgument`] unless there is one evaluator per
    /// context.
    pub fn new(
        data: &PlatformData,
        evaluators: Vec<Box<dyn ForceEvaluator>>,
        clock: Arc<dyn CompletionClock>,
    ) -> Result<Self> {
        let n = data.context_count();
        if evaluators.len() != n {
            return Err(ContextError::IllegalArgument(format!(
                "{} force evaluators for {n} contexts",
                evaluators.len()
            )));
        }
        let balancer = PartitionBalancer::new(n);
        for (i, (start, end)) in balancer.boundaries().into_iter().enumerate() {
            data.thread(i)?
                .add_task(move |ctx| ctx.nonbonded_mut().set_atom_block_range(start, end))?;
        }
        Ok(Self {
            evaluators: evaluators
                .into_iter()
                .map(|e| Arc::new(Mutex::new(e)))
                .collect(),
            balancer,
            completion: Arc::new(Mutex::new(vec![0; n])),
            tile_counts: Arc::new(Mutex::new(vec![None; n])),
            position_staging: Arc::new(Mutex::new(Vec::new())),
            force_staging: (1..n).map(|_| Arc::new(Mutex::new(Vec::new()))).collect(),
            clock,
        })
    }

    #[must_use]
    pub const fn balancer(&self) -> &PartitionBalancer {
        &self.balancer
    }

    /// Completion timestamps of the last evaluation, in microseconds.
    ///
    /// # Errors
    ///
    /// [`ContextError::InvalidState`] if a worker panicked holding them.
    pub fn completion_times(&self) -> Result<Vec<i64>> {
        Ok(lock(&self.completion)?.clone())
    }

    /// Broadcast positions and start every context's share.
    ///
    /// # Errors
    ///
    /// Failures of the position download; task failures surface from
    /// [`Self::finish`].
    pub fn begin(&mut self, data: &PlatformData, include_forces: bool, include_energy: bool, groups: u32) -> Result<()> {
        lock(data.context_energy())?.fill(0.0);
        let n = data.context_count();
        if n > 1 {
            let staging = Arc::clone(&self.position_staging);
            data.thread(0)?.with_context(move |ctx| {
                let mut bytes = lock(&staging)?;
                bytes.resize(ctx.posq().byte_len(), 0);
                ctx.posq().download_bytes(&mut bytes[..])?;
                Ok(())
            })?;
        }
        for (i, evaluator) in self.evaluators.iter().enumerate() {
            let evaluator = Arc::clone(evaluator);
            let staging = Arc::clone(&self.position_staging);
            let tile_counts = Arc::clone(&self.tile_counts);
            data.thread(i)?.add_task(move |ctx| {
                if i > 0 {
                    let bytes = lock(&staging)?;
                    ctx.posq().upload_bytes(&bytes, false)?;
                }
                lock(&evaluator)?.begin(ctx, include_forces, include_energy, groups)?;
                let count = if ctx.nonbonded().periodic() {
                    Some(ctx.nonbonded().download_interaction_count()?)
                } else {
                    None
                };
                lock(&tile_counts)?[i] = count;
                Ok(())
            })?;
        }
        Ok(())
    }

    /// Wait for every context, merge forces into context 0 and return the
    /// total energy.
    ///
    /// # Errors
    ///
    /// The first task failure of this evaluation.
    pub fn finish(
        &mut self,
        data: &mut PlatformData,
        include_forces: bool,
        include_energy: bool,
        groups: u32,
        valid: &mut bool,
    ) -> Result<f64> {
        let n = data.context_count();
        let all_valid = Arc::new(AtomicBool::new(true));
        for (i, evaluator) in self.evaluators.iter().enumerate() {
            let evaluator = Arc::clone(evaluator);
            let energies = Arc::clone(data.context_energy());
            let staging = i.checked_sub(1).map(|slot| Arc::clone(&self.force_staging[slot]));
            let completion = Arc::clone(&self.completion);
            let tile_counts = Arc::clone(&self.tile_counts);
            let clock = Arc::clone(&self.clock);
            let all_valid = Arc::clone(&all_valid);
            data.thread(i)?.add_task(move |ctx| {
                let mut ok = true;
                let energy = lock(&evaluator)?.finish(ctx, include_forces, include_energy, groups, &mut ok)?;
                lock(&energies)?[i] += energy;
                if include_forces {
                    match &staging {
                        Some(slot) => {
                            let mut bytes = lock(slot)?;
                            bytes.resize(ctx.force().byte_len(), 0);
                            ctx.force().download_bytes(&mut bytes[..])?;
                        }
                        None => ctx.finish()?,
                    }
                }
                lock(&completion)?[i] = clock.now_us();
                let observed = lock(&tile_counts)?[i];
                if let Some(count) = observed {
                    if count > ctx.nonbonded().max_tiles() {
                        ok = false;
                        ctx.nonbonded_mut().update_neighbor_list_size(count)?;
                    }
                }
                if !ok {
                    all_valid.store(false, Ordering::SeqCst);
                }
                Ok(())
            })?;
        }
        data.sync_contexts()?;
        let energy = data.total_energy()?;
        *valid &= all_valid.load(Ordering::SeqCst);

        if include_forces && *valid {
            let slots = self.force_staging.clone();
            data.thread(0)?.with_context(move |ctx| {
                let padded = ctx.padded_atoms();
                let merged = ctx
                    .force_buffers()
                    .view(n * padded, ctx.precision().real4_size(), "contextForces")?;
                for (slot, staging) in slots.iter().enumerate() {
                    let bytes = lock(staging)?;
                    merged.upload_sub_bytes(&bytes, (slot + 1) * padded, padded, false)?;
                }
                ctx.reduce_buffer(&merged, ctx.long_force(), n)
            })?;

            if data.compute_force_count < u64::from(data.config().rebalance_cutoff) {
                let times = self.completion_times()?;
                for (i, (start, end)) in self.balancer.rebalance(&times).into_iter().enumerate() {
                    data.thread(i)?
                        .add_task(move |ctx| ctx.nonbonded_mut().set_atom_block_range(start, end))?;
                }
            }
        }
        data.compute_force_count += 1;
        Ok(energy)
    }
}

impl std::fmt::Debug for ParallelCalcForcesAndEnergy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParallelCalcForcesAndEnergy")
            .field("contexts", &self.evaluators.len())
            .field("balancer", &self.balancer)
            .finish_non_exhaustive()
    }
}

/// A force kernel that runs independently on each context.
pub trait ContextKernel: Send {
    /// Run on one context and return its energy contribution.
    ///
    /// # Errors
    ///
    /// Any device failure.
    fn execute(&mut self, ctx: &mut ComputeContext, include_forces: bool, include_energy: bool) -> Result<f64>;
}

/// Runs one [`ContextKernel`] per context. Energies land in
/// [`PlatformData::context_energy`] and are summed by the enclosing
/// [`ParallelCalcForcesAndEnergy::finish`].
pub struct ParallelKernel<K: ContextKernel + 'static> {
    kernels: Vec<Arc<Mutex<K>>>,
}

impl<K: ContextKernel + 'static> ParallelKernel<K> {
    /// # Errors
    ///
    /// [`ContextError::IllegalArgument`] unless there is one kernel per
    /// context.
    pub fn new(data: &PlatformData, kernels: Vec<K>) -> Result<Self> {
        if kernels.len() != data.context_count() {
            return Err(ContextError::IllegalArgument(format!(
                "{} kernels for {} contexts",
                kernels.len(),
                data.context_count()
            )));
        }
        Ok(Self {
            kernels: kernels.into_iter().map(|k| Arc::new(Mutex::new(k))).collect(),
        })
    }

    /// Queue the kernel on every context. Always returns 0; the energy is
    /// reported through the per-context totals.
    ///
    /// # Errors
    ///
    /// [`ContextError::Worker`] if a worker has exited.
    pub fn execute(&self, data: &PlatformData, include_forces: bool, include_energy: bool) -> Result<f64> {
        for (i, kernel) in self.kernels.iter().enumerate() {
            let kernel = Arc::clone(kernel);
            let energies = Arc::clone(data.context_energy());
            data.thread(i)?.add_task(move |ctx| {
                let energy = lock(&kernel)?.execute(ctx, include_forces, include_energy)?;
                lock(&energies)?[i] += energy;
                Ok(())
            })?;
        }
        Ok(0.0)
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::backend::HostProvider;
    use crate::config::ContextConfig;
    use crate::context::SystemLayout;
    use crate::platform::PlatformProperties;
    use proptest::prelude::*;

    #[test]
    fn equal_shares_cover_unit_interval() {
        let b = PartitionBalancer::new(3);
        let bounds = b.boundaries();
        assert_eq!(bounds.len(), 3);
        assert_eq!(bounds[0].0, 0.0);
        assert_eq!(bounds[2].1, 1.0);
        assert_eq!(bounds[0].1, bounds[1].0);
    }

    #[test]
    fn slowest_gives_work_to_fastest() {
        let mut b = PartitionBalancer::new(2);
        b.rebalance(&[100, 250]);
        assert!((b.fractions()[0] - 0.501).abs() < 1e-12);
        assert!((b.fractions()[1] - 0.499).abs() < 1e-12);
    }

    #[test]
    fn ties_move_nothing() {
        let mut b = PartitionBalancer::new(2);
        for _ in 0..10 {
            b.rebalance(&[7, 7]);
        }
        assert_eq!(b.fractions(), [0.5, 0.5]);
    }

    #[test]
    fn transfer_never_goes_negative() {
        let mut b = PartitionBalancer {
            fractions: vec![0.9995, 0.0005],
        };
        b.rebalance(&[1, 2]);
        assert_eq!(b.fractions()[1], 0.0);
        assert_eq!(b.boundaries()[1], (1.0, 1.0));
    }

    proptest! {
        #[test]
        fn shares_always_sum_to_one(times in prop::collection::vec(prop::collection::vec(0i64..1000, 4), 1..300)) {
            let mut b = PartitionBalancer::new(4);
            for t in &times {
                let bounds = b.rebalance(t);
                prop_assert!(b.fractions().iter().all(|&f| f >= 0.0));
                prop_assert!((b.fractions().iter().sum::<f64>() - 1.0).abs() < 1e-9);
                prop_assert_eq!(bounds[3].1, 1.0);
                prop_assert!(bounds.windows(2).all(|w| w[0].1 == w[1].0));
            }
        }
    }

    struct Constant(f64);

    impl ContextKernel for Constant {
        fn execute(&mut self, _: &mut ComputeContext, _: bool, _: bool) -> Result<f64> {
            Ok(self.0)
        }
    }

    #[test]
    fn parallel_kernel_energy_goes_to_context_totals() {
        let props = PlatformProperties::from_pairs([("DeviceIndex", "0,1")]).unwrap();
        let data = PlatformData::new(
            &SystemLayout::new(vec![1.0; 4]),
            &props,
            &ContextConfig::default(),
            &HostProvider::reference(2),
        )
        .unwrap();
        let k = ParallelKernel::new(&data, vec![Constant(1.5), Constant(2.0)]).unwrap();
        assert_eq!(k.execute(&data, true, true).unwrap(), 0.0);
        data.sync_contexts().unwrap();
        assert_eq!(*data.context_energy().lock().unwrap(), [1.5, 2.0]);
        assert_eq!(data.total_energy().unwrap(), 3.5);
        assert!(ParallelKernel::new(&data, vec![Constant(0.0)]).is_err());
    }
}

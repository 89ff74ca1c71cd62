/*!
# Distributing particles across cooperating ranks

A run is executed by `size` ranks that share no memory. Each rank owns a contiguous slice
of the global population (see [`partition`]); all exchange goes through the collective
operations of a [`Communicator`]. Rank 0 is the coordinator: gathers end there and
broadcasts start there.

Payloads are serialized with `bincode`, so floating-point values arrive bit-for-bit.

Two communicators are provided:

- [`SingleProcess`]: one rank, every collective is the identity.
- [`LocalCluster`]: `size` in-process ranks connected by channels, rank 0 acting as the hub.

```rust
use mini_smc::distributor::{Communicator, LocalCluster};

let sums = LocalCluster::run(3, |comm| {
    comm.all_reduce_sum(&[comm.rank() as f64, 1.0]).unwrap()
})
.unwrap();
assert!(sums.iter().all(|s| s == &vec![3.0, 3.0]));
```

The global statistics below ([`global_normalize`], [`global_ess`], [`global_moments`],
[`global_resample`]) are collective: every rank must call them in the same order. They are
computed once, on the coordinator, over the population in global particle order, and the
result is broadcast. A run therefore produces the same bits for any number of ranks.
*/

use ndarray::prelude::*;
use rand::Rng;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::mpsc::{channel, Receiver, Sender};

use crate::error::{Result, SmcError};
use crate::particle::Particle;
use crate::stats::log_sum_exp;
use crate::step::{effective_sample_size, SmcStep};

/// Rank of the coordinator.
pub const COORDINATOR: usize = 0;

/// Number of particles owned by each rank.
///
/// The split is as even as possible; the remainder goes to the lowest ranks, so the
/// counts always add up to `num_particles`.
pub fn partition(num_particles: usize, size: usize) -> Vec<usize> {
    if size == 0 {
        return Vec::new();
    }
    let base = num_particles / size;
    let remainder = num_particles % size;
    (0..size).map(|rank| base + usize::from(rank < remainder)).collect()
}

/// Global index of the first particle owned by `rank`.
pub fn partition_offset(num_particles: usize, size: usize, rank: usize) -> usize {
    partition(num_particles, size).iter().take(rank).sum()
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    bincode::serialize(value).map_err(|e| SmcError::Communication(format!("encode failed: {e}")))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    bincode::deserialize(bytes).map_err(|e| SmcError::Communication(format!("decode failed: {e}")))
}

/// Collective communication between the ranks of a run.
///
/// Implementations provide the two byte-level primitives; the typed collectives are built
/// on top of them. Every collective blocks until all ranks have taken part.
pub trait Communicator {
    fn rank(&self) -> usize;
    fn size(&self) -> usize;

    /// Collects one payload per rank on the coordinator, in rank order. Other ranks get
    /// `None`.
    fn gather_bytes(&self, payload: Vec<u8>) -> Result<Option<Vec<Vec<u8>>>>;

    /// Delivers the coordinator's payload to every rank. Only the coordinator's argument is
    /// read; it must be `Some`.
    fn broadcast_bytes(&self, payload: Option<Vec<u8>>) -> Result<Vec<u8>>;

    fn is_coordinator(&self) -> bool {
        self.rank() == COORDINATOR
    }

    fn gather<T>(&self, value: &T) -> Result<Option<Vec<T>>>
    where
        Self: Sized,
        T: Serialize + DeserializeOwned,
    {
        match self.gather_bytes(encode(value)?)? {
            Some(parts) => parts.iter().map(|p| decode(p)).collect::<Result<Vec<T>>>().map(Some),
            None => Ok(None),
        }
    }

    fn broadcast<T>(&self, value: Option<&T>) -> Result<T>
    where
        Self: Sized,
        T: Serialize + DeserializeOwned,
    {
        let payload = if self.is_coordinator() {
            let value = value.ok_or_else(|| {
                SmcError::Communication("coordinator has nothing to broadcast".to_string())
            })?;
            Some(encode(value)?)
        } else {
            None
        };
        decode(&self.broadcast_bytes(payload)?)
    }

    /// Every rank receives every rank's value, in rank order.
    fn all_gather<T>(&self, value: &T) -> Result<Vec<T>>
    where
        Self: Sized,
        T: Serialize + DeserializeOwned,
    {
        let gathered = self.gather(value)?;
        self.broadcast(gathered.as_ref())
    }

    /// Element-wise sum over ranks. The sum is formed once, on the coordinator, in rank
    /// order, so every rank receives the same bits.
    fn all_reduce_sum(&self, values: &[f64]) -> Result<Vec<f64>>
    where
        Self: Sized,
    {
        self.all_reduce(values, |acc, v| acc + v)
    }

    fn all_reduce_max(&self, values: &[f64]) -> Result<Vec<f64>>
    where
        Self: Sized,
    {
        self.all_reduce(values, f64::max)
    }

    fn all_reduce<F>(&self, values: &[f64], op: F) -> Result<Vec<f64>>
    where
        Self: Sized,
        F: Fn(f64, f64) -> f64,
    {
        let reduced = self.gather(&values.to_vec())?.map(|parts| {
            let mut parts = parts.into_iter();
            let first = parts.next().unwrap_or_default();
            parts.fold(first, |acc, part| {
                acc.into_iter().zip(part).map(|(a, b)| op(a, b)).collect()
            })
        });
        self.broadcast(reduced.as_ref())
    }

    fn barrier(&self) -> Result<()>
    where
        Self: Sized,
    {
        self.all_reduce_sum(&[]).map(|_| ())
    }
}

/// A run with a single rank, which is also the coordinator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SingleProcess;

impl Communicator for SingleProcess {
    fn rank(&self) -> usize {
        COORDINATOR
    }

    fn size(&self) -> usize {
        1
    }

    fn gather_bytes(&self, payload: Vec<u8>) -> Result<Option<Vec<Vec<u8>>>> {
        Ok(Some(vec![payload]))
    }

    fn broadcast_bytes(&self, payload: Option<Vec<u8>>) -> Result<Vec<u8>> {
        payload.ok_or_else(|| SmcError::Communication("nothing to broadcast".to_string()))
    }
}

enum Links {
    Hub {
        from_workers: Vec<Receiver<Vec<u8>>>,
        to_workers: Vec<Sender<Vec<u8>>>,
    },
    Spoke {
        to_hub: Sender<Vec<u8>>,
        from_hub: Receiver<Vec<u8>>,
    },
}

/// One rank of a [`LocalCluster`].
///
/// Dropping a rank disconnects its channels, so a rank that stops early makes the
/// others' next collective fail instead of blocking forever.
pub struct LocalCommunicator {
    rank: usize,
    size: usize,
    links: Links,
}

fn disconnected(rank: usize) -> SmcError {
    SmcError::Communication(format!("rank {rank} is no longer reachable"))
}

impl Communicator for LocalCommunicator {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    fn gather_bytes(&self, payload: Vec<u8>) -> Result<Option<Vec<Vec<u8>>>> {
        match &self.links {
            Links::Hub { from_workers, .. } => {
                let mut parts = Vec::with_capacity(self.size);
                parts.push(payload);
                for (i, rx) in from_workers.iter().enumerate() {
                    parts.push(rx.recv().map_err(|_| disconnected(i + 1))?);
                }
                Ok(Some(parts))
            }
            Links::Spoke { to_hub, .. } => {
                to_hub.send(payload).map_err(|_| disconnected(COORDINATOR))?;
                Ok(None)
            }
        }
    }

    fn broadcast_bytes(&self, payload: Option<Vec<u8>>) -> Result<Vec<u8>> {
        match &self.links {
            Links::Hub { to_workers, .. } => {
                let payload = payload
                    .ok_or_else(|| SmcError::Communication("nothing to broadcast".to_string()))?;
                for (i, tx) in to_workers.iter().enumerate() {
                    tx.send(payload.clone()).map_err(|_| disconnected(i + 1))?;
                }
                Ok(payload)
            }
            Links::Spoke { from_hub, .. } => {
                from_hub.recv().map_err(|_| disconnected(COORDINATOR))
            }
        }
    }
}

/// A group of in-process ranks exchanging messages over channels.
pub struct LocalCluster;

impl LocalCluster {
    /// Creates the `size` connected ranks, coordinator first.
    pub fn new(size: usize) -> Result<Vec<LocalCommunicator>> {
        if size == 0 {
            return Err(SmcError::value_error("size", "a cluster needs at least one rank"));
        }
        let mut from_workers = Vec::with_capacity(size - 1);
        let mut to_workers = Vec::with_capacity(size - 1);
        let mut spokes = Vec::with_capacity(size - 1);
        for rank in 1..size {
            let (up_tx, up_rx) = channel();
            let (down_tx, down_rx) = channel();
            from_workers.push(up_rx);
            to_workers.push(down_tx);
            spokes.push(LocalCommunicator {
                rank,
                size,
                links: Links::Spoke {
                    to_hub: up_tx,
                    from_hub: down_rx,
                },
            });
        }
        let hub = LocalCommunicator {
            rank: COORDINATOR,
            size,
            links: Links::Hub {
                from_workers,
                to_workers,
            },
        };
        Ok(std::iter::once(hub).chain(spokes).collect())
    }

    /// Runs `f` once per rank, each on its own thread, and returns the results in rank
    /// order.
    ///
    /// Ranks run on dedicated threads rather than the rayon pool: collectives block, and
    /// a pool smaller than the cluster would never let them complete.
    pub fn run<F, T>(size: usize, f: F) -> Result<Vec<T>>
    where
        F: Fn(LocalCommunicator) -> T + Sync,
        T: Send,
    {
        let ranks = Self::new(size)?;
        let f = &f;
        std::thread::scope(|scope| {
            let handles: Vec<_> = ranks
                .into_iter()
                .map(|comm| scope.spawn(move || f(comm)))
                .collect();
            // Join every rank before looking at the outcomes; an unjoined panicked thread
            // would make the scope itself panic.
            let joined: Vec<_> = handles.into_iter().map(|handle| handle.join()).collect();
            joined
                .into_iter()
                .enumerate()
                .map(|(rank, outcome)| {
                    outcome.map_err(|_| SmcError::Communication(format!("rank {rank} panicked")))
                })
                .collect()
        })
    }
}

/// Serializable form of an error raised on one rank, replayed on the others.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
enum RankFailure {
    Support { param: String, value: f64 },
    Value { field: String, reason: String },
    Key { field: String, key: String },
    Type { field: String, expected: String },
    Other(String),
}

impl RankFailure {
    fn from_error(error: &SmcError) -> Self {
        match error {
            SmcError::Support { param, value } => RankFailure::Support {
                param: param.clone(),
                value: *value,
            },
            SmcError::Value { field, reason } => RankFailure::Value {
                field: field.clone(),
                reason: reason.clone(),
            },
            SmcError::Key { field, key } => RankFailure::Key {
                field: field.clone(),
                key: key.clone(),
            },
            SmcError::Type { field, expected } => RankFailure::Type {
                field: field.clone(),
                expected: expected.clone(),
            },
            other => RankFailure::Other(other.to_string()),
        }
    }

    fn into_error(self, rank: usize) -> SmcError {
        match self {
            RankFailure::Support { param, value } => SmcError::Support { param, value },
            RankFailure::Value { field, reason } => SmcError::Value { field, reason },
            RankFailure::Key { field, key } => SmcError::Key { field, key },
            RankFailure::Type { field, expected } => SmcError::Type { field, expected },
            RankFailure::Other(message) => {
                SmcError::Communication(format!("rank {rank} failed: {message}"))
            }
        }
    }
}

/// Makes every rank fail if any rank failed.
///
/// A rank that failed returns its own error; the others return the error of the lowest
/// failing rank. Without this, healthy ranks would wait forever in their next collective.
pub fn agree<C: Communicator, T>(comm: &C, result: Result<T>) -> Result<T> {
    let failure = result.as_ref().err().map(RankFailure::from_error);
    let failures = comm.all_gather(&failure)?;
    let value = result?;
    match failures
        .into_iter()
        .enumerate()
        .find_map(|(rank, f)| f.map(|f| (rank, f)))
    {
        Some((rank, failure)) => Err(failure.into_error(rank)),
        None => Ok(value),
    }
}

/// Log-weights of the whole population in global particle order, on the coordinator.
fn gather_log_weights<C: Communicator>(comm: &C, step: &SmcStep) -> Result<Option<Vec<f64>>> {
    Ok(comm.gather(&step.get_log_weights())?.map(|parts| parts.concat()))
}

/// Normalizes the log-weights of the distributed population so that the weights of all
/// ranks together sum to one.
pub fn global_normalize<C: Communicator>(comm: &C, step: &mut SmcStep) -> Result<()> {
    let norm = gather_log_weights(comm, step)?.map(|all| (log_sum_exp(&all), all.len()));
    let (log_norm, total): (f64, usize) = comm.broadcast(norm.as_ref())?;
    if log_norm.is_finite() {
        step.shift_log_weights(log_norm);
    } else {
        log::warn!("all particle weights vanished; using uniform weights");
        step.fill_log_weights(-(total as f64).ln());
    }
    Ok(())
}

/// Effective sample size of the whole population.
pub fn global_ess<C: Communicator>(comm: &C, step: &SmcStep) -> Result<f64> {
    let ess = gather_log_weights(comm, step)?.map(|all| effective_sample_size(&all));
    comm.broadcast(ess.as_ref())
}

/// Weighted mean and covariance of the whole population over `dim` parameters.
///
/// The covariance falls back to the identity matrix when it is not positive-definite,
/// exactly as [`SmcStep::calculate_covariance`] does. An empty population has a zero mean.
pub fn global_moments<C: Communicator>(
    comm: &C,
    step: &SmcStep,
    dim: usize,
) -> Result<(Array1<f64>, Array2<f64>)> {
    let moments = assemble(comm, step)?.map(|full| {
        if full.is_empty() {
            (Array1::zeros(dim), Array2::eye(dim))
        } else {
            full.weighted_moments()
        }
    });
    comm.broadcast(moments.as_ref())
}

pub fn global_mean<C: Communicator>(comm: &C, step: &SmcStep, dim: usize) -> Result<Array1<f64>> {
    global_moments(comm, step, dim).map(|(mean, _)| mean)
}

pub fn global_covariance<C: Communicator>(
    comm: &C,
    step: &SmcStep,
    dim: usize,
) -> Result<Array2<f64>> {
    global_moments(comm, step, dim).map(|(_, cov)| cov)
}

/// Systematic resampling of the whole population.
///
/// Every rank receives the full population and resamples it with an identically seeded
/// `rng`, so all ranks agree on the ancestors without further messages. Each rank then
/// keeps its own slice of the result.
pub fn global_resample<C, R>(comm: &C, step: &SmcStep, rng: &mut R) -> Result<SmcStep>
where
    C: Communicator,
    R: Rng + ?Sized,
{
    let parts = comm.all_gather(&step.particles().to_vec())?;
    let population: Vec<Particle> = parts.into_iter().flatten().collect();
    let mut full = SmcStep::from_particles(population, step.temperature())?;
    full.resample(rng);
    Ok(local_slice(comm, full))
}

/// Gathers the distributed population on the coordinator; `None` on other ranks.
pub fn assemble<C: Communicator>(comm: &C, step: &SmcStep) -> Result<Option<SmcStep>> {
    match comm.gather(&step.particles().to_vec())? {
        Some(parts) => {
            let population = parts.into_iter().flatten().collect();
            SmcStep::from_particles(population, step.temperature()).map(Some)
        }
        None => Ok(None),
    }
}

/// This rank's share of a full population.
pub fn local_slice<C: Communicator>(comm: &C, full: SmcStep) -> SmcStep {
    let total = full.len();
    let offset = partition_offset(total, comm.size(), comm.rank());
    let count = partition(total, comm.size())[comm.rank()];
    let temperature = full.temperature();
    let particles: Vec<Particle> = full
        .into_particles()
        .into_iter()
        .skip(offset)
        .take(count)
        .collect();
    // A slice of a consistent population is itself consistent.
    SmcStep::from_particles(particles, temperature)
        .unwrap_or_else(|_| SmcStep::new().with_temperature(temperature))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::particle::Params;
    use approx::assert_abs_diff_eq;
    use rand::rngs::SmallRng;
    use rand::SeedableRng;

    fn population(n: usize) -> SmcStep {
        let particles = (0..n)
            .map(|i| {
                let x = i as f64;
                let params: Params = [("a".to_string(), x), ("b".to_string(), x * x)].into();
                Particle::new(params, -0.1 * x, -x)
            })
            .collect();
        SmcStep::from_particles(particles, 0.3).unwrap()
    }

    #[test]
    fn partition_preserves_count() {
        assert_eq!(partition(10, 3), vec![4, 3, 3]);
        assert_eq!(partition(2, 4), vec![1, 1, 0, 0]);
        assert_eq!(partition(12, 4), vec![3, 3, 3, 3]);
        for size in 1..9 {
            assert_eq!(partition(101, size).iter().sum::<usize>(), 101);
        }
        assert_eq!(partition_offset(10, 3, 0), 0);
        assert_eq!(partition_offset(10, 3, 2), 7);
    }

    #[test]
    fn single_process_collectives_are_identity() {
        let comm = SingleProcess;
        assert_eq!(comm.all_reduce_sum(&[1.0, 2.0]).unwrap(), vec![1.0, 2.0]);
        assert_eq!(comm.gather(&5u32).unwrap(), Some(vec![5]));
        assert_eq!(comm.broadcast(Some(&"x".to_string())).unwrap(), "x");
        assert!(comm.broadcast::<u8>(None).is_err());
        assert!(comm.is_coordinator());
    }

    #[test]
    fn cluster_gather_and_broadcast() {
        let results = LocalCluster::run(4, |comm| {
            let gathered = comm.gather(&(comm.rank() * 10)).unwrap();
            let value = comm.broadcast(Some(&"from root".to_string())).unwrap();
            let everyone = comm.all_gather(&comm.rank()).unwrap();
            let max = comm.all_reduce_max(&[comm.rank() as f64]).unwrap();
            comm.barrier().unwrap();
            (gathered, value, everyone, max)
        })
        .unwrap();
        assert_eq!(results[0].0, Some(vec![0, 10, 20, 30]));
        for (rank, (gathered, value, everyone, max)) in results.iter().enumerate() {
            if rank > 0 {
                assert!(gathered.is_none());
            }
            assert_eq!(value, "from root");
            assert_eq!(everyone, &vec![0, 1, 2, 3]);
            assert_eq!(max, &vec![3.0]);
        }
    }

    #[test]
    fn departed_rank_fails_collectives() {
        let results = LocalCluster::run(2, |comm| {
            if comm.rank() == 1 {
                return Ok(Vec::new());
            }
            comm.all_reduce_sum(&[1.0])
        })
        .unwrap();
        assert!(matches!(results[0], Err(SmcError::Communication(_))));
    }

    #[test]
    fn distributed_statistics_match_single_process() {
        let full = population(11);
        let mut reference = full.copy();
        reference.normalize_step_log_weights();
        let expected_ess = reference.compute_ess();
        let expected_cov = reference.calculate_covariance();
        let expected_mean = reference.get_mean();

        let results = LocalCluster::run(3, |comm| {
            let mut local = local_slice(&comm, full.copy());
            global_normalize(&comm, &mut local).unwrap();
            let ess = global_ess(&comm, &local).unwrap();
            let (mean, cov) = global_moments(&comm, &local, 2).unwrap();
            let assembled = assemble(&comm, &local).unwrap();
            (ess, mean, cov, assembled)
        })
        .unwrap();

        for (rank, (ess, mean, cov, assembled)) in results.into_iter().enumerate() {
            assert_eq!(ess, expected_ess);
            assert_eq!(mean[0], expected_mean["a"]);
            assert_eq!(mean[1], expected_mean["b"]);
            assert_eq!(cov, expected_cov);
            if rank == COORDINATOR {
                let assembled = assembled.unwrap();
                let total: f64 = assembled.get_weights().iter().sum();
                assert_abs_diff_eq!(total, 1.0, epsilon = 1e-10);
                assert_eq!(assembled, reference);
            } else {
                assert!(assembled.is_none());
            }
        }
    }

    #[test]
    fn statistics_do_not_depend_on_the_split() {
        let mut full = population(23);
        full.set_particles(
            full.particles()
                .iter()
                .enumerate()
                .map(|(i, p)| p.with_log_weight((i as f64 * 1.7).sin() * 40.0 - 300.0))
                .collect(),
        )
        .unwrap();
        let outcome = |size: usize| {
            LocalCluster::run(size, |comm| {
                let mut local = local_slice(&comm, full.copy());
                global_normalize(&comm, &mut local).unwrap();
                let ess = global_ess(&comm, &local).unwrap();
                let moments = global_moments(&comm, &local, 2).unwrap();
                (ess, moments, assemble(&comm, &local).unwrap())
            })
            .unwrap()
            .remove(0)
        };
        let single = outcome(1);
        for size in [2, 3, 5, 7] {
            assert_eq!(outcome(size), single, "{size} ranks");
        }
    }

    #[test]
    fn panicking_ranks_are_reported() {
        let results = LocalCluster::run(3, |comm| {
            if comm.rank() > 0 {
                panic!("rank {} stops", comm.rank());
            }
            comm.barrier()
        });
        assert!(matches!(results, Err(SmcError::Communication(_))));
    }

    #[test]
    fn ranks_agree_on_resampled_population() {
        let full = population(9);
        let results = LocalCluster::run(2, |comm| {
            let mut local = local_slice(&comm, full.copy());
            global_normalize(&comm, &mut local).unwrap();
            let mut rng = SmallRng::seed_from_u64(21);
            let resampled = global_resample(&comm, &local, &mut rng).unwrap();
            assemble(&comm, &resampled).unwrap()
        })
        .unwrap();
        let combined = results[0].clone().unwrap();

        let mut reference = full.copy();
        reference.normalize_step_log_weights();
        reference.resample(&mut SmallRng::seed_from_u64(21));
        assert_eq!(combined.get_param_dicts(), reference.get_param_dicts());
        assert_eq!(combined.len(), 9);
    }

    #[test]
    fn failures_are_shared_by_every_rank() {
        let results = LocalCluster::run(3, |comm| {
            let local: Result<usize> = if comm.rank() == 2 {
                Err(SmcError::Support {
                    param: "a".to_string(),
                    value: 11.0,
                })
            } else {
                Ok(comm.rank())
            };
            agree(&comm, local)
        })
        .unwrap();
        for result in results {
            assert!(matches!(result, Err(SmcError::Support { ref param, .. }) if param == "a"));
        }
        assert_eq!(agree(&SingleProcess, Ok(4)).unwrap(), 4);
    }

    #[test]
    fn empty_partitions_take_part() {
        let full = population(2);
        let results = LocalCluster::run(4, |comm| {
            let mut local = local_slice(&comm, full.copy());
            global_normalize(&comm, &mut local).unwrap();
            let ess = global_ess(&comm, &local).unwrap();
            let (mean, _) = global_moments(&comm, &local, 2).unwrap();
            (local.len(), ess, mean)
        })
        .unwrap();
        let counts: Vec<usize> = results.iter().map(|r| r.0).collect();
        assert_eq!(counts, vec![1, 1, 0, 0]);
        assert!(results.iter().all(|r| r.1 >= 1.0 && r.1 <= 2.0));
        assert!(results.iter().all(|r| r.2 == results[0].2));
    }
}

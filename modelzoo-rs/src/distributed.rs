//! Distributed context: process identity, device and a blocking sum
//! all-reduce.
//!
//! A process-wide context is created once by [`init`] from the launcher's
//! environment variables (`RANK`, `WORLD_SIZE`, `LOCAL_RANK`, `MASTER_ADDR`,
//! `MASTER_PORT`). Contexts can also be built explicitly, which is how tests
//! run several workers inside one process with [`ThreadGroup`].
//!
//! Every worker must issue the same collective calls in the same order with
//! vectors of the same length. A length mismatch is reported as
//! [`ZooError::CollectiveMismatch`] by the backends that can observe it.

use std::fmt;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::{Arc, Condvar, Mutex, OnceLock};
use std::time::Duration;

use candle_core::Device;

use crate::error::{Result, ZooError};

static CONTEXT: OnceLock<DistributedContext> = OnceLock::new();

const CONNECT_ATTEMPTS: usize = 600;
const CONNECT_BACKOFF: Duration = Duration::from_millis(100);
const MISMATCH_FRAME: u32 = u32::MAX;

/// A blocking sum reduction shared by every worker of a run.
pub trait Collective: Send + Sync + fmt::Debug {
    /// Elementwise sum of `values` across all workers. Every worker receives
    /// the same result.
    ///
    /// # Errors
    ///
    /// Returns [`ZooError::CollectiveMismatch`] on length disagreement and
    /// [`ZooError::Distributed`] on transport failure.
    fn all_reduce_sum(&self, values: &[f64]) -> Result<Vec<f64>>;

    /// Backend name for logs.
    fn name(&self) -> &'static str;
}

/// Backend for a run with a single worker.
#[derive(Debug, Default, Clone, Copy)]
pub struct SingleProcess;

impl Collective for SingleProcess {
    fn all_reduce_sum(&self, values: &[f64]) -> Result<Vec<f64>> {
        Ok(values.to_vec())
    }

    fn name(&self) -> &'static str {
        "single"
    }
}

#[derive(Debug, Default)]
struct Round {
    generation: u64,
    arrived: usize,
    sum: Vec<f64>,
    mismatch: Option<(usize, usize)>,
    outcome: Option<std::result::Result<Vec<f64>, (usize, usize)>>,
}

#[derive(Debug, Default)]
struct Rendezvous {
    round: Mutex<Round>,
    done: Condvar,
}

/// In-process group of `world_size` workers, one per thread.
#[derive(Debug, Clone)]
pub struct ThreadGroup {
    world_size: usize,
    shared: Arc<Rendezvous>,
}

impl ThreadGroup {
    /// One backend handle per worker, all sharing the same rendezvous.
    #[must_use]
    pub fn members(world_size: usize) -> Vec<ThreadGroup> {
        let shared = Arc::new(Rendezvous::default());
        (0..world_size)
            .map(|_| ThreadGroup {
                world_size,
                shared: Arc::clone(&shared),
            })
            .collect()
    }
}

impl Collective for ThreadGroup {
    fn all_reduce_sum(&self, values: &[f64]) -> Result<Vec<f64>> {
        let mut round = self
            .shared
            .round
            .lock()
            .map_err(|_| ZooError::Distributed("thread group poisoned".into()))?;
        let generation = round.generation;

        if round.arrived == 0 {
            round.sum = values.to_vec();
            round.mismatch = None;
        } else if round.sum.len() != values.len() {
            if round.mismatch.is_none() {
                round.mismatch = Some((round.sum.len(), values.len()));
            }
        } else {
            for (acc, v) in round.sum.iter_mut().zip(values) {
                *acc += v;
            }
        }
        round.arrived += 1;

        if round.arrived == self.world_size {
            let outcome = match round.mismatch {
                Some(pair) => Err(pair),
                None => Ok(std::mem::take(&mut round.sum)),
            };
            round.outcome = Some(outcome);
            round.arrived = 0;
            round.generation += 1;
            self.shared.done.notify_all();
        } else {
            while round.generation == generation {
                round = self
                    .shared
                    .done
                    .wait(round)
                    .map_err(|_| ZooError::Distributed("thread group poisoned".into()))?;
            }
        }

        match &round.outcome {
            Some(Ok(sum)) => Ok(sum.clone()),
            Some(Err((expected, actual))) => Err(ZooError::CollectiveMismatch {
                expected: *expected,
                actual: *actual,
            }),
            None => Err(ZooError::Distributed("collective finished without a result".into())),
        }
    }

    fn name(&self) -> &'static str {
        "thread-group"
    }
}

#[derive(Debug)]
enum TcpRole {
    Root(Vec<TcpStream>),
    Worker(TcpStream),
}

/// Star-topology TCP backend: every worker sends its vector to rank 0,
/// which sums and broadcasts the result.
///
/// Frames are a little-endian `u32` element count followed by little-endian
/// `f64` values.
#[derive(Debug)]
pub struct Tcp {
    role: Mutex<TcpRole>,
}

impl Tcp {
    /// Connect the group. Rank 0 listens on `addr` and accepts
    /// `world_size - 1` workers; other ranks connect to it.
    ///
    /// # Errors
    ///
    /// Returns [`ZooError::Distributed`] if the group cannot be formed.
    pub fn connect(addr: &str, rank: usize, world_size: usize) -> Result<Self> {
        let role = if rank == 0 {
            let listener = TcpListener::bind(addr)
                .map_err(|e| ZooError::Distributed(format!("bind {addr}: {e}")))?;
            let mut peers: Vec<Option<TcpStream>> = (1..world_size).map(|_| None).collect();
            for _ in 1..world_size {
                let (mut stream, peer) = listener.accept()?;
                stream.set_nodelay(true)?;
                let mut buf = [0u8; 4];
                stream.read_exact(&mut buf)?;
                let peer_rank = u32::from_le_bytes(buf) as usize;
                if peer_rank == 0 || peer_rank >= world_size || peers[peer_rank - 1].is_some() {
                    return Err(ZooError::Distributed(format!(
                        "unexpected rank {peer_rank} from {peer}"
                    )));
                }
                tracing::debug!(rank = peer_rank, %peer, "Worker joined");
                peers[peer_rank - 1] = Some(stream);
            }
            TcpRole::Root(peers.into_iter().flatten().collect())
        } else {
            let mut stream = connect_with_retry(addr)?;
            stream.set_nodelay(true)?;
            let rank = u32::try_from(rank)
                .map_err(|_| ZooError::Distributed(format!("rank {rank} out of range")))?;
            stream.write_all(&rank.to_le_bytes())?;
            TcpRole::Worker(stream)
        };
        Ok(Self {
            role: Mutex::new(role),
        })
    }
}

fn connect_with_retry(addr: &str) -> Result<TcpStream> {
    let mut last_err = None;
    for _ in 0..CONNECT_ATTEMPTS {
        match TcpStream::connect(addr) {
            Ok(stream) => return Ok(stream),
            Err(e) => {
                last_err = Some(e);
                std::thread::sleep(CONNECT_BACKOFF);
            }
        }
    }
    Err(ZooError::Distributed(format!(
        "could not reach {addr}: {}",
        last_err.map_or_else(|| "no attempt".to_string(), |e| e.to_string())
    )))
}

fn write_frame<W: Write>(out: &mut W, values: &[f64]) -> Result<()> {
    let len = u32::try_from(values.len())
        .ok()
        .filter(|len| *len != MISMATCH_FRAME)
        .ok_or_else(|| ZooError::Distributed("frame too large".into()))?;
    let mut buf = Vec::with_capacity(4 + values.len() * 8);
    buf.extend_from_slice(&len.to_le_bytes());
    for v in values {
        buf.extend_from_slice(&v.to_le_bytes());
    }
    out.write_all(&buf)?;
    out.flush()?;
    Ok(())
}

fn write_mismatch<W: Write>(out: &mut W, expected: usize, actual: usize) -> Result<()> {
    let mut buf = Vec::with_capacity(20);
    buf.extend_from_slice(&MISMATCH_FRAME.to_le_bytes());
    buf.extend_from_slice(&(expected as u64).to_le_bytes());
    buf.extend_from_slice(&(actual as u64).to_le_bytes());
    out.write_all(&buf)?;
    out.flush()?;
    Ok(())
}

fn read_u32<R: Read>(input: &mut R) -> Result<u32> {
    let mut buf = [0u8; 4];
    input.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_u64<R: Read>(input: &mut R) -> Result<u64> {
    let mut buf = [0u8; 8];
    input.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

fn read_frame<R: Read>(input: &mut R) -> Result<Vec<f64>> {
    let len = read_u32(input)?;
    if len == MISMATCH_FRAME {
        let expected = read_u64(input)? as usize;
        let actual = read_u64(input)? as usize;
        return Err(ZooError::CollectiveMismatch { expected, actual });
    }
    let mut payload = vec![0u8; len as usize * 8];
    input.read_exact(&mut payload)?;
    Ok(payload
        .chunks_exact(8)
        .map(|chunk| {
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(chunk);
            f64::from_le_bytes(bytes)
        })
        .collect())
}

impl Collective for Tcp {
    fn all_reduce_sum(&self, values: &[f64]) -> Result<Vec<f64>> {
        let mut role = self
            .role
            .lock()
            .map_err(|_| ZooError::Distributed("tcp backend poisoned".into()))?;
        match &mut *role {
            TcpRole::Root(peers) => {
                let mut sum = values.to_vec();
                let mut mismatch = None;
                for peer in peers.iter_mut() {
                    let frame = read_frame(peer)?;
                    if frame.len() != sum.len() {
                        mismatch.get_or_insert((sum.len(), frame.len()));
                        continue;
                    }
                    for (acc, v) in sum.iter_mut().zip(&frame) {
                        *acc += v;
                    }
                }
                if let Some((expected, actual)) = mismatch {
                    for peer in peers.iter_mut() {
                        write_mismatch(peer, expected, actual)?;
                    }
                    return Err(ZooError::CollectiveMismatch { expected, actual });
                }
                for peer in peers.iter_mut() {
                    write_frame(peer, &sum)?;
                }
                Ok(sum)
            }
            TcpRole::Worker(stream) => {
                write_frame(stream, values)?;
                read_frame(stream)
            }
        }
    }

    fn name(&self) -> &'static str {
        "tcp"
    }
}

/// Launch parameters of one worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchEnv {
    /// Global rank.
    pub rank: usize,
    /// Number of workers.
    pub world_size: usize,
    /// Rank on this host; selects the accelerator.
    pub local_rank: usize,
    /// Rendezvous host.
    pub master_addr: String,
    /// Rendezvous port.
    pub master_port: u16,
}

impl LaunchEnv {
    /// Read the launch variables from the process environment.
    ///
    /// # Errors
    ///
    /// Returns [`ZooError::Distributed`] for unparsable values.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read the launch variables through `lookup`. Missing variables mean a
    /// single-process run.
    ///
    /// # Errors
    ///
    /// Returns [`ZooError::Distributed`] for unparsable or inconsistent
    /// values.
    pub fn from_lookup<F: Fn(&str) -> Option<String>>(lookup: F) -> Result<Self> {
        fn parse<T: std::str::FromStr>(key: &str, value: Option<String>, default: T) -> Result<T> {
            match value {
                Some(raw) => raw
                    .trim()
                    .parse()
                    .map_err(|_| ZooError::Distributed(format!("invalid {key}: {raw}"))),
                None => Ok(default),
            }
        }

        let rank = parse("RANK", lookup("RANK"), 0usize)?;
        let world_size = parse("WORLD_SIZE", lookup("WORLD_SIZE"), 1usize)?;
        let local_rank = parse("LOCAL_RANK", lookup("LOCAL_RANK"), rank)?;
        let master_port = parse("MASTER_PORT", lookup("MASTER_PORT"), 29500u16)?;
        let master_addr = lookup("MASTER_ADDR").unwrap_or_else(|| "127.0.0.1".into());

        if world_size == 0 || rank >= world_size {
            return Err(ZooError::Distributed(format!(
                "rank {rank} is outside world size {world_size}"
            )));
        }
        Ok(Self {
            rank,
            world_size,
            local_rank,
            master_addr,
            master_port,
        })
    }
}

/// Identity of this worker plus its collective backend.
#[derive(Debug, Clone)]
pub struct DistributedContext {
    rank: usize,
    world_size: usize,
    local_rank: usize,
    device: Device,
    backend: Arc<dyn Collective>,
}

impl DistributedContext {
    /// Context for a run with one worker.
    #[must_use]
    pub fn single_process(device: Device) -> Self {
        Self {
            rank: 0,
            world_size: 1,
            local_rank: 0,
            device,
            backend: Arc::new(SingleProcess),
        }
    }

    /// One context per in-process worker, ranks `0..world_size`.
    #[must_use]
    pub fn thread_group(world_size: usize, device: &Device) -> Vec<Self> {
        ThreadGroup::members(world_size)
            .into_iter()
            .enumerate()
            .map(|(rank, member)| Self {
                rank,
                world_size,
                local_rank: rank,
                device: device.clone(),
                backend: Arc::new(member),
            })
            .collect()
    }

    /// Context over an explicit backend.
    #[must_use]
    pub fn with_backend(
        rank: usize,
        world_size: usize,
        device: Device,
        backend: Arc<dyn Collective>,
    ) -> Self {
        Self {
            rank,
            world_size,
            local_rank: rank,
            device,
            backend,
        }
    }

    /// Build a context from launch parameters, connecting the TCP group when
    /// there is more than one worker.
    ///
    /// # Errors
    ///
    /// Returns an error if the group cannot be formed.
    pub fn from_launch(env: &LaunchEnv) -> Result<Self> {
        let device = select_device(env.local_rank);
        let backend: Arc<dyn Collective> = if env.world_size == 1 {
            Arc::new(SingleProcess)
        } else {
            let addr = format!("{}:{}", env.master_addr, env.master_port);
            Arc::new(Tcp::connect(&addr, env.rank, env.world_size)?)
        };
        tracing::info!(
            rank = env.rank,
            world_size = env.world_size,
            backend = backend.name(),
            "Distributed context ready"
        );
        Ok(Self {
            rank: env.rank,
            world_size: env.world_size,
            local_rank: env.local_rank,
            device,
            backend,
        })
    }

    /// Global rank.
    #[must_use]
    pub fn rank(&self) -> usize {
        self.rank
    }

    /// Number of workers.
    #[must_use]
    pub fn world_size(&self) -> usize {
        self.world_size
    }

    /// Rank on this host.
    #[must_use]
    pub fn local_rank(&self) -> usize {
        self.local_rank
    }

    /// Compute device of this worker.
    #[must_use]
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Rank 0 owns checkpoint writes, logs and metric emission.
    #[must_use]
    pub fn is_main_process(&self) -> bool {
        self.rank == 0
    }

    /// Elementwise sum across workers. With one worker the input is returned
    /// without touching the backend.
    ///
    /// # Errors
    ///
    /// Propagates backend errors.
    pub fn all_reduce_sum(&self, values: &[f64]) -> Result<Vec<f64>> {
        if self.world_size == 1 {
            return Ok(values.to_vec());
        }
        self.backend.all_reduce_sum(values)
    }

    /// Block until every worker arrives.
    ///
    /// # Errors
    ///
    /// Propagates backend errors.
    pub fn barrier(&self) -> Result<()> {
        self.all_reduce_sum(&[]).map(|_| ())
    }
}

/// Pick the device for a worker: CUDA ordinal `local_rank` with the `cuda`
/// feature, CPU otherwise or when `MODELZOO_FORCE_CPU` is set.
#[must_use]
pub fn select_device(local_rank: usize) -> Device {
    let force_cpu = std::env::var("MODELZOO_FORCE_CPU")
        .ok()
        .is_some_and(|v| v == "1" || v.eq_ignore_ascii_case("true"));
    if !force_cpu && cfg!(feature = "cuda") {
        match Device::cuda_if_available(local_rank) {
            Ok(device @ Device::Cuda(_)) => {
                tracing::info!("Training device: CUDA (device {})", local_rank);
                device
            }
            Ok(_) => {
                tracing::warn!("CUDA not available; falling back to CPU");
                Device::Cpu
            }
            Err(err) => {
                tracing::warn!("CUDA init failed ({err}); falling back to CPU");
                Device::Cpu
            }
        }
    } else {
        if force_cpu {
            tracing::info!("CPU mode forced via MODELZOO_FORCE_CPU");
        }
        Device::Cpu
    }
}

/// Establish the process-wide context from the launch environment. Later
/// calls return the same context.
///
/// # Errors
///
/// Returns an error if the launch variables are invalid or the group cannot
/// be formed.
pub fn init() -> Result<DistributedContext> {
    if let Some(ctx) = CONTEXT.get() {
        return Ok(ctx.clone());
    }
    let ctx = DistributedContext::from_launch(&LaunchEnv::from_env()?)?;
    Ok(CONTEXT.get_or_init(|| ctx).clone())
}

/// The process-wide context.
///
/// # Errors
///
/// Returns [`ZooError::Distributed`] if [`init`] has not run.
pub fn current() -> Result<DistributedContext> {
    CONTEXT
        .get()
        .cloned()
        .ok_or_else(|| ZooError::Distributed("distributed context not initialized".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::thread;

    #[test]
    fn test_single_process_identity() {
        let ctx = DistributedContext::single_process(Device::Cpu);
        let values = vec![1.5, -2.0, 3.25];
        assert_eq!(ctx.all_reduce_sum(&values).unwrap(), values);
        assert!(ctx.is_main_process());
        ctx.barrier().unwrap();
    }

    #[test]
    fn test_thread_group_sums() {
        let contexts = DistributedContext::thread_group(4, &Device::Cpu);
        let handles: Vec<_> = contexts
            .into_iter()
            .map(|ctx| {
                thread::spawn(move || {
                    let r = ctx.rank() as f64;
                    let first = ctx.all_reduce_sum(&[r, 1.0]).unwrap();
                    let second = ctx.all_reduce_sum(&[2.0 * r]).unwrap();
                    (first, second)
                })
            })
            .collect();
        for handle in handles {
            let (first, second) = handle.join().unwrap();
            assert_eq!(first, vec![6.0, 4.0]);
            assert_eq!(second, vec![12.0]);
        }
    }

    #[test]
    fn test_thread_group_length_mismatch() {
        let contexts = DistributedContext::thread_group(2, &Device::Cpu);
        let handles: Vec<_> = contexts
            .into_iter()
            .map(|ctx| {
                thread::spawn(move || {
                    let values = vec![1.0; ctx.rank() + 2];
                    ctx.all_reduce_sum(&values)
                })
            })
            .collect();
        for handle in handles {
            let err = handle.join().unwrap().unwrap_err();
            assert!(matches!(err, ZooError::CollectiveMismatch { .. }));
        }
    }

    #[test]
    fn test_tcp_group_sums() {
        let port = {
            let probe = TcpListener::bind("127.0.0.1:0").unwrap();
            probe.local_addr().unwrap().port()
        };
        let addr = format!("127.0.0.1:{port}");
        let handles: Vec<_> = (0..3)
            .map(|rank| {
                let addr = addr.clone();
                thread::spawn(move || {
                    let tcp = Tcp::connect(&addr, rank, 3).unwrap();
                    let ctx =
                        DistributedContext::with_backend(rank, 3, Device::Cpu, Arc::new(tcp));
                    ctx.all_reduce_sum(&[rank as f64, 0.5]).unwrap()
                })
            })
            .collect();
        for handle in handles {
            assert_eq!(handle.join().unwrap(), vec![3.0, 1.5]);
        }
    }

    #[test]
    fn test_frame_roundtrip_through_buffer() {
        let mut buf = Vec::new();
        write_frame(&mut buf, &[0.25, -1.0]).unwrap();
        assert_eq!(buf.len(), 4 + 16);
        let values = read_frame(&mut buf.as_slice()).unwrap();
        assert_eq!(values, vec![0.25, -1.0]);
    }

    #[test]
    fn test_launch_env_defaults_to_single_process() {
        let env = LaunchEnv::from_lookup(|_| None).unwrap();
        assert_eq!(env.rank, 0);
        assert_eq!(env.world_size, 1);
        assert_eq!(env.master_port, 29500);
    }

    #[test]
    fn test_launch_env_parses_launcher_variables() {
        let vars: HashMap<&str, &str> = [
            ("RANK", "3"),
            ("WORLD_SIZE", "4"),
            ("LOCAL_RANK", "1"),
            ("MASTER_ADDR", "10.0.0.2"),
            ("MASTER_PORT", "29600"),
        ]
        .into_iter()
        .collect();
        let env = LaunchEnv::from_lookup(|k| vars.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(env.rank, 3);
        assert_eq!(env.local_rank, 1);
        assert_eq!(env.master_addr, "10.0.0.2");

        let bad = LaunchEnv::from_lookup(|k| match k {
            "RANK" => Some("4".into()),
            "WORLD_SIZE" => Some("4".into()),
            _ => None,
        });
        assert!(bad.is_err());
    }
}

//! State owned by one executing worker

use rand::SeedableRng;
use rand::rngs::SmallRng;
use sieve_bytecode::MAX_BPF_STACK;

use crate::redirect::RedirectInfo;
use crate::vm::MAX_CALL_FRAMES;

/// Per-worker environment visible to helpers
#[derive(Debug)]
pub struct WorkerEnv {
    /// Worker id, reported by `get_smp_processor_id`
    pub id: u32,
    /// Source for `get_prandom_u32`
    pub rng: SmallRng,
    /// Pending redirect decision
    pub redirect: RedirectInfo,
}

/// Everything one invocation needs that outlives it
#[derive(Debug)]
pub struct WorkerState {
    /// Helper-visible environment
    pub env: WorkerEnv,
    /// Program stack, one frame per nested call
    pub(crate) stack: Box<[u8]>,
}

impl WorkerState {
    /// Fresh state for worker `id`
    pub fn new(id: u32) -> Self {
        Self {
            env: WorkerEnv {
                id,
                rng: SmallRng::from_os_rng(),
                redirect: RedirectInfo::default(),
            },
            stack: vec![0u8; MAX_BPF_STACK * MAX_CALL_FRAMES].into_boxed_slice(),
        }
    }

    /// Fresh state with a reproducible random stream
    pub fn with_seed(id: u32, seed: u64) -> Self {
        let mut state = Self::new(id);
        state.env.rng = SmallRng::seed_from_u64(seed);
        state
    }
}

//! In-process group: one member per thread.
//!
//! Members exchange buffers through shared slots and synchronize with a
//! two-phase barrier: publish, wait, read, wait. The second wait keeps a fast
//! member from overwriting its slot before slower members have read it.
//!
//! Dropping a member breaks the group: every barrier that has not completed
//! yet, and every later one, fails with [`CollectiveError::PeerDisconnected`]
//! instead of waiting for a member that will never arrive.

use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use crate::communicator::{check_root, Communicator};
use crate::types::CollectiveError;

struct State {
    slots: Vec<Vec<f32>>,
    /// Members waiting in the current barrier generation.
    arrived: usize,
    generation: u64,
    /// First member that left the group.
    departed: Option<usize>,
}

struct Shared {
    world_size: usize,
    state: Mutex<State>,
    turnstile: Condvar,
}

impl Shared {
    fn lock(&self) -> Result<MutexGuard<'_, State>, CollectiveError> {
        self.state.lock().map_err(|_| CollectiveError::Poisoned)
    }

    /// Block until all members arrive or one of them leaves.
    fn wait(&self) -> Result<(), CollectiveError> {
        let mut state = self.lock()?;
        if let Some(rank) = state.departed {
            return Err(CollectiveError::PeerDisconnected(rank));
        }
        let generation = state.generation;
        state.arrived += 1;
        if state.arrived == self.world_size {
            state.arrived = 0;
            state.generation += 1;
            self.turnstile.notify_all();
            return Ok(());
        }
        while state.generation == generation && state.departed.is_none() {
            state = self
                .turnstile
                .wait(state)
                .map_err(|_| CollectiveError::Poisoned)?;
        }
        match state.departed {
            Some(rank) if state.generation == generation => {
                Err(CollectiveError::PeerDisconnected(rank))
            }
            _ => Ok(()),
        }
    }
}

/// Constructor for in-process groups.
pub struct LocalGroup;

impl LocalGroup {
    /// Create a group of `world_size` members, returned in rank order.
    ///
    /// # Panics
    /// Panics if `world_size` is zero.
    pub fn new(world_size: usize) -> Vec<LocalMember> {
        assert!(world_size > 0, "world_size must be at least 1");
        let shared = Arc::new(Shared {
            world_size,
            state: Mutex::new(State {
                slots: vec![Vec::new(); world_size],
                arrived: 0,
                generation: 0,
                departed: None,
            }),
            turnstile: Condvar::new(),
        });
        (0..world_size)
            .map(|rank| LocalMember {
                rank,
                shared: Arc::clone(&shared),
            })
            .collect()
    }
}

/// One member of a [`LocalGroup`]. Move it into the thread that owns the rank.
pub struct LocalMember {
    rank: usize,
    shared: Arc<Shared>,
}

impl LocalMember {
    fn publish(&self, slot: usize, values: &[f32]) -> Result<(), CollectiveError> {
        let mut state = self.shared.lock()?;
        state.slots[slot].clear();
        state.slots[slot].extend_from_slice(values);
        Ok(())
    }
}

impl Drop for LocalMember {
    fn drop(&mut self) {
        // a member that panicked mid-collective poisons the lock; still report the departure
        let mut state = self
            .shared
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if state.departed.is_none() {
            state.departed = Some(self.rank);
            if self.shared.world_size > 1 {
                tracing::debug!(rank = self.rank, "Member left the local group");
            }
        }
        self.shared.turnstile.notify_all();
    }
}

impl Communicator for LocalMember {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.shared.world_size
    }

    fn barrier(&self) -> Result<(), CollectiveError> {
        self.shared.wait()
    }

    fn broadcast(&self, values: &mut [f32], root: usize) -> Result<(), CollectiveError> {
        check_root(root, self.shared.world_size)?;
        let published = if self.rank == root {
            self.publish(root, values)
        } else {
            Ok(())
        };
        self.shared.wait()?;

        let read = if self.rank == root {
            published
        } else {
            self.shared.lock().and_then(|state| {
                let src = &state.slots[root];
                if src.len() != values.len() {
                    return Err(CollectiveError::LengthMismatch {
                        rank: root,
                        expected: values.len(),
                        got: src.len(),
                    });
                }
                values.copy_from_slice(src);
                Ok(())
            })
        };
        self.shared.wait()?;
        read
    }

    fn all_reduce_sum(&self, values: &mut [f32]) -> Result<(), CollectiveError> {
        let published = self.publish(self.rank, values);
        self.shared.wait()?;

        let reduced = published.and_then(|()| {
            let state = self.shared.lock()?;
            let mut out = vec![0.0_f32; values.len()];
            for (rank, slot) in state.slots.iter().enumerate() {
                if slot.len() != values.len() {
                    return Err(CollectiveError::LengthMismatch {
                        rank,
                        expected: values.len(),
                        got: slot.len(),
                    });
                }
                for (acc, v) in out.iter_mut().zip(slot) {
                    *acc += *v;
                }
            }
            Ok(out)
        });
        self.shared.wait()?;

        values.copy_from_slice(&reduced?);
        Ok(())
    }
}

use crate::types::CollectiveError;

/// A member's handle on a process group.
///
/// All methods block until every member of the group has made the matching
/// call. Members must issue collective calls in the same order with buffers of
/// the same length; anything else is a protocol error (or a hang).
pub trait Communicator: Send + Sync {
    /// This member's rank in `0..world_size()`.
    fn rank(&self) -> usize;

    /// Number of members in the group.
    fn world_size(&self) -> usize;

    /// Block until every member has reached this point.
    fn barrier(&self) -> Result<(), CollectiveError>;

    /// Overwrite `values` on every member with the root's `values`.
    fn broadcast(&self, values: &mut [f32], root: usize) -> Result<(), CollectiveError>;

    /// Replace `values` on every member with the element-wise sum over all
    /// members. The sum is taken in rank order so every member receives
    /// bit-identical results.
    fn all_reduce_sum(&self, values: &mut [f32]) -> Result<(), CollectiveError>;

    /// Element-wise mean over all members.
    fn all_reduce_mean(&self, values: &mut [f32]) -> Result<(), CollectiveError> {
        self.all_reduce_sum(values)?;
        let world = self.world_size() as f32;
        if world > 1.0 {
            for v in values.iter_mut() {
                *v /= world;
            }
        }
        Ok(())
    }

    /// Whether this member is the designated root (rank 0).
    fn is_root(&self) -> bool {
        self.rank() == 0
    }
}

/// A group of exactly one member. Every collective is a no-op.
#[derive(Debug, Default, Clone, Copy)]
pub struct Solo;

impl Communicator for Solo {
    fn rank(&self) -> usize {
        0
    }

    fn world_size(&self) -> usize {
        1
    }

    fn barrier(&self) -> Result<(), CollectiveError> {
        Ok(())
    }

    fn broadcast(&self, _values: &mut [f32], root: usize) -> Result<(), CollectiveError> {
        if root != 0 {
            return Err(CollectiveError::InvalidRoot {
                root,
                world_size: 1,
            });
        }
        Ok(())
    }

    fn all_reduce_sum(&self, _values: &mut [f32]) -> Result<(), CollectiveError> {
        Ok(())
    }
}

/// Validate a broadcast root against the world size.
pub(crate) fn check_root(root: usize, world_size: usize) -> Result<(), CollectiveError> {
    if root >= world_size {
        return Err(CollectiveError::InvalidRoot { root, world_size });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_solo_is_identity() {
        let solo = Solo;
        let mut values = vec![1.0_f32, -2.0, 3.5];
        solo.all_reduce_mean(&mut values).unwrap();
        assert_eq!(values, vec![1.0, -2.0, 3.5]);
        solo.broadcast(&mut values, 0).unwrap();
        assert_eq!(values, vec![1.0, -2.0, 3.5]);
        assert!(solo.is_root());
    }

    #[test]
    fn test_solo_rejects_foreign_root() {
        let err = Solo.broadcast(&mut [0.0], 1).unwrap_err();
        assert!(matches!(err, CollectiveError::InvalidRoot { root: 1, world_size: 1 }));
    }
}

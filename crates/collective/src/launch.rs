//! Launcher environment: how a process learns its place in the job.
//!
//! Follows the torchrun convention. A process started by the launcher sees
//! `RANK`, `WORLD_SIZE`, `MASTER_ADDR` and `MASTER_PORT` (and usually
//! `LOCAL_RANK`); a process started by hand sees none of them and runs solo.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::communicator::{Communicator, Solo};
use crate::tcp::TcpGroup;
use crate::types::CollectiveError;

/// Rank assignment handed to this process by the launcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchEnv {
    pub rank: usize,
    pub world_size: usize,
    /// Rank on this host. Defaults to `rank` when the launcher omits it.
    pub local_rank: usize,
    pub master_addr: String,
    pub master_port: u16,
}

impl LaunchEnv {
    /// Read the launcher variables from the process environment.
    ///
    /// Returns `Ok(None)` when `WORLD_SIZE` is unset (not launched).
    pub fn from_env() -> Result<Option<Self>, CollectiveError> {
        let vars: HashMap<String, String> = std::env::vars().collect();
        Self::from_vars(&vars)
    }

    /// Parse launcher variables from an explicit map.
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Option<Self>, CollectiveError> {
        let Some(world_size) = vars.get("WORLD_SIZE") else {
            return Ok(None);
        };
        let world_size: usize = parse_var("WORLD_SIZE", world_size)?;
        let rank: usize = parse_var(
            "RANK",
            vars.get("RANK")
                .ok_or_else(|| CollectiveError::Launch("WORLD_SIZE set but RANK missing".into()))?,
        )?;
        let local_rank = match vars.get("LOCAL_RANK") {
            Some(v) => parse_var("LOCAL_RANK", v)?,
            None => rank,
        };
        let master_addr = vars
            .get("MASTER_ADDR")
            .cloned()
            .unwrap_or_else(|| "127.0.0.1".to_string());
        let master_port = match vars.get("MASTER_PORT") {
            Some(v) => parse_var("MASTER_PORT", v)?,
            None => 29500,
        };

        if world_size == 0 {
            return Err(CollectiveError::Launch("WORLD_SIZE must be at least 1".into()));
        }
        if rank >= world_size {
            return Err(CollectiveError::Launch(format!(
                "RANK {rank} out of range for WORLD_SIZE {world_size}"
            )));
        }

        Ok(Some(Self {
            rank,
            world_size,
            local_rank,
            master_addr,
            master_port,
        }))
    }

    /// `host:port` of the rank-0 hub.
    pub fn master_endpoint(&self) -> String {
        format!("{}:{}", self.master_addr, self.master_port)
    }

    /// Join the process group described by this environment.
    pub fn connect(&self, timeout: Duration) -> Result<Arc<dyn Communicator>, CollectiveError> {
        if self.world_size == 1 {
            return Ok(Arc::new(Solo));
        }
        let group = TcpGroup::connect(&self.master_endpoint(), self.rank, self.world_size, timeout)?;
        Ok(Arc::new(group))
    }
}

fn parse_var<T: std::str::FromStr>(name: &str, value: &str) -> Result<T, CollectiveError> {
    value
        .trim()
        .parse()
        .map_err(|_| CollectiveError::Launch(format!("{name}={value:?} is not a valid number")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_not_launched() {
        assert_eq!(LaunchEnv::from_vars(&vars(&[])).unwrap(), None);
    }

    #[test]
    fn test_full_environment() {
        let env = LaunchEnv::from_vars(&vars(&[
            ("WORLD_SIZE", "4"),
            ("RANK", "2"),
            ("LOCAL_RANK", "0"),
            ("MASTER_ADDR", "10.0.0.1"),
            ("MASTER_PORT", "1234"),
        ]))
        .unwrap()
        .unwrap();
        assert_eq!(env.rank, 2);
        assert_eq!(env.world_size, 4);
        assert_eq!(env.local_rank, 0);
        assert_eq!(env.master_endpoint(), "10.0.0.1:1234");
    }

    #[test]
    fn test_defaults_for_optional_vars() {
        let env = LaunchEnv::from_vars(&vars(&[("WORLD_SIZE", "2"), ("RANK", "1")]))
            .unwrap()
            .unwrap();
        assert_eq!(env.local_rank, 1);
        assert_eq!(env.master_endpoint(), "127.0.0.1:29500");
    }

    #[test]
    fn test_rank_out_of_range() {
        let err = LaunchEnv::from_vars(&vars(&[("WORLD_SIZE", "2"), ("RANK", "2")]));
        assert!(matches!(err, Err(CollectiveError::Launch(_))));
    }

    #[test]
    fn test_missing_rank() {
        let err = LaunchEnv::from_vars(&vars(&[("WORLD_SIZE", "2")]));
        assert!(err.is_err());
    }

    #[test]
    fn test_single_process_world_is_solo() {
        let env = LaunchEnv::from_vars(&vars(&[("WORLD_SIZE", "1"), ("RANK", "0")]))
            .unwrap()
            .unwrap();
        let comm = env.connect(Duration::from_secs(1)).unwrap();
        assert_eq!(comm.world_size(), 1);
    }
}

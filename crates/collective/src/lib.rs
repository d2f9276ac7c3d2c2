//! Blocking collective communication for data-parallel training.
//!
//! Each participant (a process, or a thread in tests and `--spawn-workers`
//! runs) holds one [`Communicator`] handle. Every operation is a barrier:
//! it returns only after all members of the group have issued the same call.
//! There is no timeout and no partial-failure tolerance: a member that never
//! arrives stalls everyone, a member that disconnects fails everyone.
//!
//! # Quick Start
//!
//! ```rust
//! use collective::{Communicator, LocalGroup};
//!
//! let members = LocalGroup::new(2);
//! let handles: Vec<_> = members
//!     .into_iter()
//!     .map(|member| {
//!         std::thread::spawn(move || {
//!             let mut grads = vec![member.rank() as f32 + 1.0; 4];
//!             member.all_reduce_mean(&mut grads).unwrap();
//!             grads
//!         })
//!     })
//!     .collect();
//! for handle in handles {
//!     assert_eq!(handle.join().unwrap(), vec![1.5; 4]);
//! }
//! ```

pub mod communicator;
pub mod launch;
pub mod local;
pub mod tcp;
pub mod types;

pub use communicator::{Communicator, Solo};
pub use launch::LaunchEnv;
pub use local::{LocalGroup, LocalMember};
pub use tcp::TcpGroup;
pub use types::CollectiveError;

//! Multi-process group over TCP in a star topology.
//!
//! Rank 0 is the hub: it listens on the master address, accepts one
//! connection per peer and performs every reduction itself, summing in rank
//! order before fanning the result back out. Peers only ever talk to the hub.
//!
//! Every message is a postcard-encoded `Hello`, `Contribution` or `Response`
//! behind a little-endian `u32` byte length.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::communicator::{check_root, Communicator};
use crate::types::CollectiveError;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

enum Role {
    /// Rank 0. Streams are indexed by `rank - 1`.
    Hub { peers: Mutex<Vec<TcpStream>> },
    Peer { hub: Mutex<TcpStream> },
}

/// A member of a TCP process group.
pub struct TcpGroup {
    rank: usize,
    world_size: usize,
    role: Role,
}

impl TcpGroup {
    /// Form (or join) the group at `master`. Rank 0 binds, everyone else connects.
    pub fn connect(
        master: &str,
        rank: usize,
        world_size: usize,
        timeout: Duration,
    ) -> Result<Self, CollectiveError> {
        let addr = master
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| CollectiveError::Launch(format!("cannot resolve {master}")))?;
        if rank == 0 {
            let listener = TcpListener::bind(addr)?;
            Self::host(listener, world_size, timeout)
        } else {
            Self::join(addr, rank, world_size, timeout)
        }
    }

    /// Rank 0: accept `world_size - 1` peers on an already-bound listener.
    pub fn host(
        listener: TcpListener,
        world_size: usize,
        timeout: Duration,
    ) -> Result<Self, CollectiveError> {
        if world_size == 0 {
            return Err(CollectiveError::Launch("world_size must be at least 1".into()));
        }
        listener.set_nonblocking(true)?;
        let deadline = Instant::now() + timeout;
        let mut slots: Vec<Option<TcpStream>> = (1..world_size).map(|_| None).collect();
        let mut joined = 0;

        while joined < world_size - 1 {
            match listener.accept() {
                Ok((mut stream, remote)) => {
                    stream.set_nonblocking(false)?;
                    stream.set_nodelay(true)?;
                    let Hello {
                        rank: peer_rank,
                        world_size: peer_world,
                    } = recv(&mut stream, usize::MAX)?;
                    if peer_world != world_size {
                        return Err(CollectiveError::Launch(format!(
                            "rank {peer_rank} at {remote} expects world size {peer_world}, hub has {world_size}"
                        )));
                    }
                    if peer_rank == 0 || peer_rank >= world_size {
                        return Err(CollectiveError::Launch(format!(
                            "peer at {remote} announced invalid rank {peer_rank}"
                        )));
                    }
                    let slot = &mut slots[peer_rank - 1];
                    if slot.is_some() {
                        return Err(CollectiveError::Launch(format!(
                            "rank {peer_rank} joined twice"
                        )));
                    }
                    tracing::debug!(peer_rank, %remote, "Peer joined process group");
                    *slot = Some(stream);
                    joined += 1;
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    if Instant::now() >= deadline {
                        return Err(CollectiveError::ConnectTimeout(timeout.as_secs()));
                    }
                    std::thread::sleep(POLL_INTERVAL);
                }
                Err(e) => return Err(e.into()),
            }
        }

        let mut peers: Vec<TcpStream> = slots.into_iter().flatten().collect();
        for stream in peers.iter_mut() {
            send(stream, &Response::Ready)?;
        }
        tracing::info!(world_size, "Process group formed (hub)");
        Ok(Self {
            rank: 0,
            world_size,
            role: Role::Hub {
                peers: Mutex::new(peers),
            },
        })
    }

    /// Rank > 0: connect to the hub, retrying until `timeout` elapses.
    pub fn join(
        addr: SocketAddr,
        rank: usize,
        world_size: usize,
        timeout: Duration,
    ) -> Result<Self, CollectiveError> {
        if rank == 0 || rank >= world_size {
            return Err(CollectiveError::Launch(format!(
                "rank {rank} cannot join as a peer of a group of {world_size}"
            )));
        }
        let deadline = Instant::now() + timeout;
        let mut stream = loop {
            match TcpStream::connect(addr) {
                Ok(stream) => break stream,
                Err(e) => {
                    if Instant::now() >= deadline {
                        tracing::warn!(%addr, error = %e, "Giving up on process group hub");
                        return Err(CollectiveError::ConnectTimeout(timeout.as_secs()));
                    }
                    std::thread::sleep(POLL_INTERVAL);
                }
            }
        };
        stream.set_nodelay(true)?;

        send(&mut stream, &Hello { rank, world_size })?;
        match recv::<Response>(&mut stream, 0)? {
            Response::Ready => {}
            other => {
                return Err(CollectiveError::Launch(format!(
                    "unexpected handshake reply {other:?} from hub"
                )))
            }
        }
        tracing::info!(rank, world_size, "Joined process group");
        Ok(Self {
            rank,
            world_size,
            role: Role::Peer {
                hub: Mutex::new(stream),
            },
        })
    }
}

impl Communicator for TcpGroup {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    fn barrier(&self) -> Result<(), CollectiveError> {
        self.all_reduce_sum(&mut [])
    }

    fn broadcast(&self, values: &mut [f32], root: usize) -> Result<(), CollectiveError> {
        check_root(root, self.world_size)?;
        match &self.role {
            Role::Hub { peers } => {
                let mut peers = peers.lock().map_err(|_| CollectiveError::Poisoned)?;
                if root != 0 {
                    let Contribution(incoming) = recv(&mut peers[root - 1], root)?;
                    if incoming.len() != values.len() {
                        return Err(CollectiveError::LengthMismatch {
                            rank: root,
                            expected: values.len(),
                            got: incoming.len(),
                        });
                    }
                    values.copy_from_slice(&incoming);
                }
                let response = Response::Ok(values.to_vec());
                for stream in peers.iter_mut() {
                    send(stream, &response)?;
                }
                Ok(())
            }
            Role::Peer { hub } => {
                let mut hub = hub.lock().map_err(|_| CollectiveError::Poisoned)?;
                if root == self.rank {
                    send(&mut hub, &Contribution(values.to_vec()))?;
                }
                let incoming = recv_result(&mut hub)?;
                if root == self.rank {
                    return Ok(());
                }
                if incoming.len() != values.len() {
                    return Err(CollectiveError::LengthMismatch {
                        rank: root,
                        expected: values.len(),
                        got: incoming.len(),
                    });
                }
                values.copy_from_slice(&incoming);
                Ok(())
            }
        }
    }

    fn all_reduce_sum(&self, values: &mut [f32]) -> Result<(), CollectiveError> {
        match &self.role {
            Role::Hub { peers } => {
                let mut peers = peers.lock().map_err(|_| CollectiveError::Poisoned)?;
                let mut out = vec![0.0_f32; values.len()];
                for (acc, v) in out.iter_mut().zip(values.iter()) {
                    *acc += *v;
                }
                let mut mismatch = None;
                for (i, stream) in peers.iter_mut().enumerate() {
                    let rank = i + 1;
                    let Contribution(incoming) = recv(stream, rank)?;
                    if incoming.len() != values.len() {
                        mismatch.get_or_insert((rank, incoming.len()));
                        continue;
                    }
                    for (acc, v) in out.iter_mut().zip(&incoming) {
                        *acc += *v;
                    }
                }

                if let Some((rank, got)) = mismatch {
                    let response = Response::LengthMismatch {
                        rank,
                        expected: values.len(),
                        got,
                    };
                    for stream in peers.iter_mut() {
                        send(stream, &response)?;
                    }
                    return Err(CollectiveError::LengthMismatch {
                        rank,
                        expected: values.len(),
                        got,
                    });
                }

                let response = Response::Ok(out.clone());
                for stream in peers.iter_mut() {
                    send(stream, &response)?;
                }
                values.copy_from_slice(&out);
                Ok(())
            }
            Role::Peer { hub } => {
                let mut hub = hub.lock().map_err(|_| CollectiveError::Poisoned)?;
                send(&mut hub, &Contribution(values.to_vec()))?;
                let reduced = recv_result(&mut hub)?;
                if reduced.len() != values.len() {
                    return Err(CollectiveError::LengthMismatch {
                        rank: 0,
                        expected: values.len(),
                        got: reduced.len(),
                    });
                }
                values.copy_from_slice(&reduced);
                Ok(())
            }
        }
    }
}

/// Peer -> hub, once, right after connecting.
#[derive(Debug, PartialEq, Serialize, Deserialize)]
struct Hello {
    rank: usize,
    world_size: usize,
}

/// Hub -> peer.
#[derive(Debug, PartialEq, Serialize, Deserialize)]
enum Response {
    /// Every peer has joined.
    Ready,
    /// Result of a collective.
    Ok(Vec<f32>),
    LengthMismatch {
        rank: usize,
        expected: usize,
        got: usize,
    },
}

/// Peer -> hub: this member's contribution to a collective.
#[derive(Debug, PartialEq, Serialize, Deserialize)]
struct Contribution(Vec<f32>);

/// Write `message` as a `u32` length prefix followed by its postcard encoding.
fn send<T: Serialize>(stream: &mut TcpStream, message: &T) -> Result<(), CollectiveError> {
    let body = postcard::to_allocvec(message)?;
    let len = u32::try_from(body.len())
        .map_err(|_| CollectiveError::Launch(format!("frame of {} bytes too large", body.len())))?;
    let mut frame = Vec::with_capacity(4 + body.len());
    frame.extend_from_slice(&len.to_le_bytes());
    frame.extend_from_slice(&body);
    stream.write_all(&frame)?;
    Ok(())
}

/// Read one frame written by [`send`] from the member at `rank`.
fn recv<T: DeserializeOwned>(stream: &mut TcpStream, rank: usize) -> Result<T, CollectiveError> {
    let mut len = [0_u8; 4];
    read_exact(stream, &mut len, rank)?;
    let mut body = vec![0_u8; u32::from_le_bytes(len) as usize];
    read_exact(stream, &mut body, rank)?;
    Ok(postcard::from_bytes(&body)?)
}

/// Read the hub's answer to a collective call.
fn recv_result(stream: &mut TcpStream) -> Result<Vec<f32>, CollectiveError> {
    match recv::<Response>(stream, 0)? {
        Response::Ok(values) => Ok(values),
        Response::LengthMismatch {
            rank,
            expected,
            got,
        } => Err(CollectiveError::LengthMismatch {
            rank,
            expected,
            got,
        }),
        Response::Ready => Err(CollectiveError::Launch(
            "hub sent a handshake in the middle of a collective".into(),
        )),
    }
}

/// `read_exact` that maps a closed socket to [`CollectiveError::PeerDisconnected`].
fn read_exact(stream: &mut TcpStream, buf: &mut [u8], rank: usize) -> Result<(), CollectiveError> {
    stream.read_exact(buf).map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            CollectiveError::PeerDisconnected(rank)
        } else {
            CollectiveError::Io(e)
        }
    })
}

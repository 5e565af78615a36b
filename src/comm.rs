//! Collective communication between replica processes.
//!
//! The run loop only ever needs broadcast, gather, scatter and a barrier, so
//! that is the whole contract. The default implementation runs the replicas
//! as threads of one process wired up with crossbeam channels in a star
//! around rank 0; a single-replica run uses the trivial implementation.
//!
//! Collectives must be entered by every rank. A disconnected channel means a
//! peer died mid-run, which is unrecoverable; we panic with a clear message,
//! taking the process down like an aborted communicator would.

use crossbeam_channel::{unbounded, Receiver, Sender};

#[derive(Clone, Debug)]
enum Payload {
    Bool(bool),
    U32(u32),
    F64(f64),
    F64Vec(Vec<f64>),
    Usize(usize),
    Bytes(Vec<u8>),
    Unit,
}

const DEAD_PEER: &str = "replica peer disconnected during a collective";

pub trait Communicator: Send {
    fn rank(&self) -> usize;
    fn size(&self) -> usize;

    /// Root's value wins and is returned on every rank.
    fn broadcast_bool(&self, v: bool) -> bool;
    fn broadcast_u32(&self, v: u32) -> u32;

    /// Returns `Some(values in rank order)` at root, `None` elsewhere.
    fn gather_f64(&self, v: f64) -> Option<Vec<f64>>;
    fn gather_f64_vec(&self, v: &[f64]) -> Option<Vec<Vec<f64>>>;
    fn gather_usize(&self, v: usize) -> Option<Vec<usize>>;
    fn gather_bytes(&self, v: &[u8]) -> Option<Vec<Vec<u8>>>;

    /// Root supplies one value per rank; every rank gets its own.
    fn scatter_usize(&self, v: Option<&[usize]>) -> usize;
    fn scatter_bytes(&self, v: Option<&[Vec<u8>]>) -> Vec<u8>;

    fn barrier(&self);
}

/// The P = 1 case: every collective is local.
pub struct SingleProcess;

impl Communicator for SingleProcess {
    fn rank(&self) -> usize {
        0
    }
    fn size(&self) -> usize {
        1
    }
    fn broadcast_bool(&self, v: bool) -> bool {
        v
    }
    fn broadcast_u32(&self, v: u32) -> u32 {
        v
    }
    fn gather_f64(&self, v: f64) -> Option<Vec<f64>> {
        Some(vec![v])
    }
    fn gather_f64_vec(&self, v: &[f64]) -> Option<Vec<Vec<f64>>> {
        Some(vec![v.to_vec()])
    }
    fn gather_usize(&self, v: usize) -> Option<Vec<usize>> {
        Some(vec![v])
    }
    fn gather_bytes(&self, v: &[u8]) -> Option<Vec<Vec<u8>>> {
        Some(vec![v.to_vec()])
    }
    fn scatter_usize(&self, v: Option<&[usize]>) -> usize {
        v.expect("root must supply scatter values")[0]
    }
    fn scatter_bytes(&self, v: Option<&[Vec<u8>]>) -> Vec<u8> {
        v.expect("root must supply scatter values")[0].clone()
    }
    fn barrier(&self) {}
}

enum Role {
    Root {
        /// Indexed by rank − 1.
        up: Vec<Receiver<Payload>>,
        down: Vec<Sender<Payload>>,
    },
    Worker {
        up: Sender<Payload>,
        down: Receiver<Payload>,
    },
}

/// Channel-backed communicator for replicas running as threads.
pub struct ChannelCommunicator {
    rank: usize,
    size: usize,
    role: Role,
}

impl ChannelCommunicator {
    /// Build the full star of P communicators; hand one to each thread.
    pub fn create(p: usize) -> Vec<ChannelCommunicator> {
        assert!(p >= 1);
        let mut up_txs = Vec::with_capacity(p.saturating_sub(1));
        let mut up_rxs = Vec::with_capacity(p.saturating_sub(1));
        let mut down_txs = Vec::with_capacity(p.saturating_sub(1));
        let mut down_rxs = Vec::with_capacity(p.saturating_sub(1));
        for _ in 1..p {
            let (utx, urx) = unbounded();
            let (dtx, drx) = unbounded();
            up_txs.push(utx);
            up_rxs.push(urx);
            down_txs.push(dtx);
            down_rxs.push(drx);
        }

        let mut comms = Vec::with_capacity(p);
        comms.push(ChannelCommunicator {
            rank: 0,
            size: p,
            role: Role::Root {
                up: up_rxs,
                down: down_txs,
            },
        });
        for (rank, (up, down)) in up_txs.into_iter().zip(down_rxs).enumerate() {
            comms.push(ChannelCommunicator {
                rank: rank + 1,
                size: p,
                role: Role::Worker { up, down },
            });
        }
        comms
    }

    fn broadcast_payload(&self, v: Payload) -> Payload {
        match &self.role {
            Role::Root { down, .. } => {
                for tx in down {
                    tx.send(v.clone()).expect(DEAD_PEER);
                }
                v
            }
            Role::Worker { down, .. } => down.recv().expect(DEAD_PEER),
        }
    }

    fn gather_payload(&self, v: Payload) -> Option<Vec<Payload>> {
        match &self.role {
            Role::Root { up, .. } => {
                let mut all = Vec::with_capacity(self.size);
                all.push(v);
                for rx in up {
                    all.push(rx.recv().expect(DEAD_PEER));
                }
                Some(all)
            }
            Role::Worker { up, .. } => {
                up.send(v).expect(DEAD_PEER);
                None
            }
        }
    }

    fn scatter_payload(&self, v: Option<Vec<Payload>>) -> Payload {
        match &self.role {
            Role::Root { down, .. } => {
                let mut v = v.expect("root must supply scatter values");
                assert_eq!(v.len(), self.size, "scatter needs one value per rank");
                for (tx, val) in down.iter().zip(v.drain(1..)) {
                    tx.send(val).expect(DEAD_PEER);
                }
                v.pop().expect("own scatter value")
            }
            Role::Worker { down, .. } => down.recv().expect(DEAD_PEER),
        }
    }
}

impl Communicator for ChannelCommunicator {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    fn broadcast_bool(&self, v: bool) -> bool {
        match self.broadcast_payload(Payload::Bool(v)) {
            Payload::Bool(b) => b,
            _ => unreachable!("payload type confusion in broadcast"),
        }
    }

    fn broadcast_u32(&self, v: u32) -> u32 {
        match self.broadcast_payload(Payload::U32(v)) {
            Payload::U32(x) => x,
            _ => unreachable!("payload type confusion in broadcast"),
        }
    }

    fn gather_f64(&self, v: f64) -> Option<Vec<f64>> {
        self.gather_payload(Payload::F64(v)).map(|all| {
            all.into_iter()
                .map(|p| match p {
                    Payload::F64(x) => x,
                    _ => unreachable!("payload type confusion in gather"),
                })
                .collect()
        })
    }

    fn gather_f64_vec(&self, v: &[f64]) -> Option<Vec<Vec<f64>>> {
        self.gather_payload(Payload::F64Vec(v.to_vec())).map(|all| {
            all.into_iter()
                .map(|p| match p {
                    Payload::F64Vec(x) => x,
                    _ => unreachable!("payload type confusion in gather"),
                })
                .collect()
        })
    }

    fn gather_usize(&self, v: usize) -> Option<Vec<usize>> {
        self.gather_payload(Payload::Usize(v)).map(|all| {
            all.into_iter()
                .map(|p| match p {
                    Payload::Usize(x) => x,
                    _ => unreachable!("payload type confusion in gather"),
                })
                .collect()
        })
    }

    fn gather_bytes(&self, v: &[u8]) -> Option<Vec<Vec<u8>>> {
        self.gather_payload(Payload::Bytes(v.to_vec())).map(|all| {
            all.into_iter()
                .map(|p| match p {
                    Payload::Bytes(x) => x,
                    _ => unreachable!("payload type confusion in gather"),
                })
                .collect()
        })
    }

    fn scatter_usize(&self, v: Option<&[usize]>) -> usize {
        let payloads = v.map(|vals| vals.iter().map(|&x| Payload::Usize(x)).collect());
        match self.scatter_payload(payloads) {
            Payload::Usize(x) => x,
            _ => unreachable!("payload type confusion in scatter"),
        }
    }

    fn scatter_bytes(&self, v: Option<&[Vec<u8>]>) -> Vec<u8> {
        let payloads = v.map(|vals| vals.iter().map(|x| Payload::Bytes(x.clone())).collect());
        match self.scatter_payload(payloads) {
            Payload::Bytes(x) => x,
            _ => unreachable!("payload type confusion in scatter"),
        }
    }

    fn barrier(&self) {
        self.gather_payload(Payload::Unit);
        self.broadcast_payload(Payload::Unit);
    }
}

//! The transfer coordinator: the per-rank chunk registry, the event loop
//! that dispatches inbound protocol messages to chunk state, and the
//! top-level state machine sequencing registration, broad phase, routing,
//! narrow phase, writeback, and quiescence.
//!
//! Every public operation is a *collective*: all ranks call it in the same
//! order with rank-appropriate arguments, and it runs the protocol to its
//! final rendezvous before returning. Within a rank, chunks are
//! cooperatively scheduled: a dispatched message runs one chunk handler to
//! completion, and progress between handlers comes only from further
//! messages. A chunk never blocks, and neither does anything else except
//! the transport receive at the bottom of the loop.

use crate::coder::{CborCoder, Coder};
use crate::config::Config;
use crate::error::{ConfigError, NumericError, ProtocolError, TransferError};
use crate::hashgrid::{self, Flush};
use crate::mapper::{self, MapperRun};
use crate::message::Communicator;
use crate::partition::{Chunk, ChunkInput, MeshHandle, MeshRole};
use crate::protocol::{Collision, GridBox, Msg};
use crate::reduction::{Payload, Reductions};
use crate::router;
use crate::transfer::{self, TransferStats, MAX_SKIP_RATIO, SENTINEL};
use log::{debug, info, warn};
use std::collections::{BTreeMap, VecDeque};

const ROOT: usize = 0;

struct MeshRecord {
    handle: MeshHandle,
    chunks: BTreeMap<u32, Chunk>,
}

/// Per-rank state of one transfer in flight.
struct Flight {
    flush: Flush,
    /// Source-side boxes kept for the extent diagnostics.
    src_boxes: Vec<GridBox>,
    /// Collision batches received so far; router rank only.
    collision_batches: usize,
    pairs: Vec<Collision>,
    /// Local destination chunks the router has served.
    candidates_seen: usize,
    stats: TransferStats,
}

/// The per-rank library object. One lives on every rank of the pool; the
/// registry maps opaque mesh handles to the chunks hosted here, and all
/// cross-chunk traffic carries `(mesh, chunk)` identities resolved through
/// it on receipt.
pub struct Exchange<C: Communicator> {
    comm: C,
    coder: CborCoder<Msg>,
    config: Config,
    /// Self-addressed messages; never touch the transport.
    inbox: VecDeque<Msg>,
    meshes: BTreeMap<u32, MeshRecord>,
    next_chunk_base: u64,
    next_seq: u64,
    reductions: Reductions,
    mapper: Option<MapperRun>,
    flight: Option<Flight>,
}

impl<C: Communicator> Exchange<C> {
    pub fn new(comm: C, config: Config) -> Result<Self, ConfigError> {
        config.validate()?;
        let reductions = Reductions::new(comm.size());
        Ok(Self {
            comm,
            coder: CborCoder::new(),
            config,
            inbox: VecDeque::new(),
            meshes: BTreeMap::new(),
            next_chunk_base: 0,
            next_seq: 0,
            reductions,
            mapper: None,
            flight: None,
        })
    }

    pub fn rank(&self) -> usize {
        self.comm.rank()
    }

    /// The placement rule: mesh-local chunk `c` lives on rank `c % size`.
    /// Callers hand `register_mesh` the inputs for exactly the chunks this
    /// maps to their rank.
    pub fn rank_of_chunk(&self, chunk: u32) -> usize {
        chunk as usize % self.comm.size()
    }

    // ------------------------------------------------------------------
    // Event loop plumbing.

    fn post(&mut self, rank: usize, msg: Msg) {
        if rank == self.comm.rank() {
            self.inbox.push_back(msg);
        } else {
            self.comm.send(rank, self.coder.encode(msg));
        }
    }

    /// Delivers exactly one message to its handler, blocking on the
    /// transport when the local inbox is dry.
    fn step(&mut self) -> Result<(), TransferError> {
        let msg = match self.inbox.pop_front() {
            Some(msg) => msg,
            None => self.coder.decode(self.comm.recv()),
        };
        self.dispatch(msg)
    }

    fn take_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    fn contribute(&mut self, seq: u64, payload: Payload) -> Result<(), TransferError> {
        if self.comm.rank() == ROOT {
            self.absorb(seq, payload)
        } else {
            self.post(ROOT, Msg::Contribute { seq, payload });
            Ok(())
        }
    }

    /// Root side of a rendezvous: merge one contribution and, once every
    /// rank is in, review the result and broadcast the advance.
    fn absorb(&mut self, seq: u64, payload: Payload) -> Result<(), TransferError> {
        if let Some(mut merged) = self.reductions.absorb(seq, payload)? {
            root_review(&mut merged);
            for rank in 1..self.comm.size() {
                self.post(
                    rank,
                    Msg::Advance {
                        seq,
                        payload: merged.clone(),
                    },
                );
            }
            self.reductions.deliver(seq, merged);
        }
        Ok(())
    }

    /// Root-only broadcast with no inbound contributions, used for the
    /// routing outcome.
    fn broadcast(&mut self, seq: u64, payload: Payload) {
        debug_assert_eq!(self.comm.rank(), ROOT);
        for rank in 1..self.comm.size() {
            self.post(
                rank,
                Msg::Advance {
                    seq,
                    payload: payload.clone(),
                },
            );
        }
        self.reductions.deliver(seq, payload);
    }

    fn wait_advance(&mut self, seq: u64) -> Result<Payload, TransferError> {
        loop {
            if let Some(payload) = self.reductions.take(seq) {
                return Ok(payload);
            }
            self.step()?;
        }
    }

    // ------------------------------------------------------------------
    // Registry lookups.

    fn record(&self, mesh: u32) -> Result<&MeshRecord, ProtocolError> {
        self.meshes
            .get(&mesh)
            .ok_or(ProtocolError::UnknownMesh { mesh })
    }

    fn handle(&self, mesh: u32) -> Result<MeshHandle, ProtocolError> {
        Ok(self.record(mesh)?.handle)
    }

    /// Resolves a global chunk id to its (mesh, chunk index) identity.
    fn locate(&self, chunk_id: u64) -> Result<(u32, u32), ProtocolError> {
        for record in self.meshes.values() {
            if record.handle.owns_chunk_id(chunk_id) {
                let index = (chunk_id - record.handle.chunk_id_base) as u32;
                return Ok((record.handle.id, index));
            }
        }
        Err(ProtocolError::UnroutableChunk { chunk: chunk_id })
    }

    fn rank_of_chunk_id(&self, chunk_id: u64) -> Result<usize, ProtocolError> {
        let (_, index) = self.locate(chunk_id)?;
        Ok(self.rank_of_chunk(index))
    }

    /// The chunk data for a registered (mesh, chunk) pair hosted here.
    pub fn chunk(&self, mesh: u32, chunk: u32) -> Result<&Chunk, TransferError> {
        self.record(mesh)?
            .chunks
            .get(&chunk)
            .ok_or_else(|| ProtocolError::MisplacedChunk {
                mesh,
                chunk,
                expected: self.rank_of_chunk(chunk),
                got: self.comm.rank(),
            }.into())
    }

    /// The nodal field of a chunk hosted here.
    pub fn field(&self, mesh: u32, chunk: u32) -> Result<&[f64], TransferError> {
        Ok(&self.chunk(mesh, chunk)?.u)
    }

    fn chunk_mut(&mut self, mesh: u32, chunk: u32) -> Result<&mut Chunk, ProtocolError> {
        let expected = self.rank_of_chunk(chunk);
        let got = self.comm.rank();
        self.meshes
            .get_mut(&mesh)
            .ok_or(ProtocolError::UnknownMesh { mesh })?
            .chunks
            .get_mut(&chunk)
            .ok_or(ProtocolError::MisplacedChunk {
                mesh,
                chunk,
                expected,
                got,
            })
    }

    // ------------------------------------------------------------------
    // Registration.

    /// Registers a mesh across the pool: builds the chunks hosted on this
    /// rank from `inputs` and runs the mapper protocol that assembles
    /// every chunk's node and edge communication maps. Collective; returns
    /// the same handle on every rank, or the same error.
    pub fn register_mesh(
        &mut self,
        mesh_id: u32,
        role: MeshRole,
        n_chunks: u32,
        inputs: Vec<ChunkInput>,
    ) -> Result<MeshHandle, TransferError> {
        assert!(n_chunks > 0, "a mesh has at least one chunk");
        let handle = MeshHandle {
            id: mesh_id,
            n_chunks,
            chunk_id_base: self.next_chunk_base,
            role,
        };
        self.next_chunk_base += n_chunks as u64;

        // Build and validate local chunks; the first fault rides the
        // registration rendezvous so every rank fails identically.
        let mut fault: Option<TransferError> = if self.meshes.contains_key(&mesh_id) {
            Some(ProtocolError::MeshExists { mesh: mesh_id }.into())
        } else {
            None
        };
        let mut chunks = BTreeMap::new();
        let mut max_gid = 0;
        for input in &inputs {
            let expected = self.rank_of_chunk(input.chunk);
            if input.chunk >= n_chunks || expected != self.comm.rank() {
                fault.get_or_insert(
                    ProtocolError::MisplacedChunk {
                        mesh: mesh_id,
                        chunk: input.chunk,
                        expected,
                        got: self.comm.rank(),
                    }
                    .into(),
                );
                continue;
            }
            match Chunk::new(mesh_id, handle.chunk_id_base, input) {
                Ok(chunk) => {
                    max_gid = max_gid.max(*chunk.gid.last().unwrap());
                    chunks.insert(input.chunk, chunk);
                }
                Err(e) => {
                    fault.get_or_insert(e);
                }
            }
        }
        for chunk in (0..n_chunks).filter(|&c| self.rank_of_chunk(c) == self.comm.rank()) {
            if fault.is_none() && !chunks.contains_key(&chunk) {
                fault = Some(TransferError::EmptyPartition {
                    mesh: mesh_id,
                    chunk,
                });
            }
        }

        // The mapper run must exist before this rank signals readiness:
        // queries from faster ranks can arrive while we wait.
        self.mapper = Some(MapperRun::new(mesh_id, n_chunks, chunks));

        let seq = self.take_seq();
        self.contribute(seq, Payload::Register { max_gid, fault })?;
        let npoin = match self.wait_advance(seq)? {
            Payload::Register {
                fault: Some(fault), ..
            } => {
                self.mapper = None;
                return Err(fault);
            }
            Payload::Register { max_gid, .. } => max_gid + 1,
            _ => unreachable!("registration rendezvous yields a Register payload"),
        };

        self.mapper_queries(mesh_id, npoin, n_chunks)?;
        self.mapper_responses(mesh_id)?;

        // Both rendezvous are behind us: put the chunks into service.
        let run = self.mapper.take().unwrap();
        let mut chunks = run.chunks;
        for chunk in chunks.values_mut() {
            chunk.derive_ownership();
        }
        info!(
            "rank {}: mesh {} registered with {} local chunks of {}",
            self.comm.rank(),
            mesh_id,
            chunks.len(),
            n_chunks,
        );
        self.meshes.insert(mesh_id, MeshRecord { handle, chunks });
        self.comm.next_time_stamp();
        Ok(handle)
    }

    /// Phase one of the mapper: every chunk reports its chunk-boundary
    /// entities to the bucket chunks, and the `queried` rendezvous closes
    /// once every report has been acknowledged.
    fn mapper_queries(
        &mut self,
        mesh: u32,
        npoin: u64,
        n_chunks: u32,
    ) -> Result<(), TransferError> {
        let mut posts = Vec::new();
        {
            let run = self.mapper.as_mut().unwrap();
            for (&from, chunk) in &run.chunks {
                let bins = mapper::boundary_bins(chunk, npoin, n_chunks);
                run.pending_acks += bins.len();
                for (to, (nodes, edges)) in bins {
                    posts.push(Msg::MapperQuery {
                        mesh,
                        to,
                        from,
                        nodes: nodes.into_iter().collect(),
                        edges: edges.into_iter().collect(),
                    });
                }
            }
        }
        for msg in posts {
            let rank = match &msg {
                Msg::MapperQuery { to, .. } => self.rank_of_chunk(*to),
                _ => unreachable!(),
            };
            self.post(rank, msg);
        }

        let seq = self.take_seq();
        while self.mapper.as_ref().unwrap().pending_acks > 0 {
            self.step()?;
        }
        self.contribute(seq, Payload::Unit)?;
        self.wait_advance(seq)?;
        Ok(())
    }

    /// Phase two: bucket chunks answer every reporter with the other
    /// chunks sharing its entities; the `responded` rendezvous closes once
    /// every answer has been acknowledged.
    fn mapper_responses(&mut self, mesh: u32) -> Result<(), TransferError> {
        let mut posts = Vec::new();
        {
            let run = self.mapper.as_mut().unwrap();
            for (&from, seat) in &run.seats {
                let exports = seat.exports();
                run.pending_bnd_acks += exports.len();
                for (to, maps) in exports {
                    posts.push(Msg::MapperBnd {
                        mesh,
                        to,
                        from,
                        maps,
                    });
                }
            }
        }
        for msg in posts {
            let rank = match &msg {
                Msg::MapperBnd { to, .. } => self.rank_of_chunk(*to),
                _ => unreachable!(),
            };
            self.post(rank, msg);
        }

        let seq = self.take_seq();
        while self.mapper.as_ref().unwrap().pending_bnd_acks > 0 {
            self.step()?;
        }
        self.contribute(seq, Payload::Unit)?;
        self.wait_advance(seq)?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Field setup.

    /// Replaces the nodal field of a source chunk hosted here.
    pub fn set_source_field(
        &mut self,
        mesh: u32,
        chunk: u32,
        u: Vec<f64>,
    ) -> Result<(), TransferError> {
        self.expect_role(mesh, MeshRole::Source)?;
        let chunk = self.chunk_mut(mesh, chunk)?;
        if u.len() != chunk.npoin() {
            return Err(ProtocolError::FieldLength {
                got: u.len(),
                want: chunk.npoin(),
            }
            .into());
        }
        chunk.u = u;
        Ok(())
    }

    /// Marks a destination chunk hosted here as input-ready; its node
    /// coordinates are the points to be interpolated.
    pub fn set_destination_points(&mut self, mesh: u32, chunk: u32) -> Result<(), TransferError> {
        self.expect_role(mesh, MeshRole::Destination)?;
        self.chunk_mut(mesh, chunk)?.dest_ready = true;
        Ok(())
    }

    fn expect_role(&self, mesh: u32, expected: MeshRole) -> Result<(), ProtocolError> {
        let handle = self.record(mesh)?.handle;
        if handle.role != expected {
            return Err(ProtocolError::RoleMismatch {
                mesh,
                actual: handle.role,
                expected,
            });
        }
        Ok(())
    }

    /// Drops a mesh from the pool. The chunk-id range is retired, never
    /// reused.
    pub fn unregister_mesh(&mut self, handle: MeshHandle) -> Result<(), TransferError> {
        self.meshes
            .remove(&handle.id)
            .map(|_| ())
            .ok_or_else(|| ProtocolError::UnknownMesh { mesh: handle.id }.into())
    }

    // ------------------------------------------------------------------
    // Transfer.

    /// Runs one transfer from `src` to `dst`. Collective; on success the
    /// destination chunks hosted here hold the interpolated field in `u`,
    /// and the returned statistics are global.
    pub fn transfer(&mut self, src: u32, dst: u32) -> Result<TransferStats, TransferError> {
        self.expect_role(src, MeshRole::Source)?;
        self.expect_role(dst, MeshRole::Destination)?;
        let src = self.handle(src)?;
        let dst = self.handle(dst)?;
        for (&index, chunk) in &self.record(dst.id)?.chunks {
            if !chunk.dest_ready {
                return Err(ProtocolError::DestinationNotReady {
                    mesh: dst.id,
                    chunk: index,
                }
                .into());
            }
        }

        self.broad_phase(src, dst)?;
        self.route_phase(src, dst)?;
        self.narrow_phase(dst)?;
        let stats = self.done_phase(dst)?;
        self.halo_phase(dst)?;

        if self.comm.rank() == ROOT {
            info!(
                "transfer complete: {} dest points, {} source tets, \
                 {} candidates, {} containments, {} orphans, {} numeric skips",
                stats.dest_points,
                stats.source_tets,
                stats.candidates,
                stats.containments,
                stats.orphans,
                stats.numeric_skips,
            );
            if stats.orphans > 0 {
                warn!("{} destination points found no source tet", stats.orphans);
            }
        }
        self.flight = None;
        self.comm.next_time_stamp();
        Ok(stats)
    }

    /// Contributes every local box to the grid and closes the first flush
    /// barrier once all ranks' batches have arrived.
    fn broad_phase(&mut self, src: MeshHandle, dst: MeshHandle) -> Result<(), TransferError> {
        let mut stats = TransferStats::default();
        let mut src_boxes = Vec::new();
        let mut all_boxes = Vec::new();
        {
            let record = self.record(src.id)?;
            for chunk in record.chunks.values() {
                stats.source_tets += chunk.ntets() as u64;
                src_boxes.extend(transfer::tet_boxes(chunk, src.chunk_id_base));
            }
        }
        all_boxes.extend_from_slice(&src_boxes);
        {
            let record = self.record(dst.id)?;
            for chunk in record.chunks.values() {
                all_boxes.extend(transfer::point_boxes(chunk, dst.chunk_id_base));
            }
        }
        debug!(
            "rank {}: contributing {} boxes to the broad phase",
            self.comm.rank(),
            all_boxes.len(),
        );

        // Destination chunks are reset only now: the sentinel goes in and
        // the per-transfer counters come back to zero.
        let dst_chunks: Vec<u32> = self.record(dst.id)?.chunks.keys().copied().collect();
        for index in dst_chunks {
            self.chunk_mut(dst.id, index)?.reset_transfer(SENTINEL);
        }

        self.flight = Some(Flight {
            flush: Flush::new(),
            src_boxes,
            collision_batches: 0,
            pairs: Vec::new(),
            candidates_seen: 0,
            stats,
        });

        let batches = hashgrid::bin_boxes(self.config.cell, &all_boxes, self.comm.size());
        for (rank, cells) in batches.into_iter().enumerate() {
            self.post(rank, Msg::GridBoxes { cells });
        }

        let seq = self.take_seq();
        while self.flight.as_ref().unwrap().flush.batches < self.comm.size() {
            self.step()?;
        }
        let (ext_min, ext_max) = transfer::extent_bounds(&self.flight.as_ref().unwrap().src_boxes);
        self.contribute(seq, Payload::Boxes { ext_min, ext_max })?;
        let (ext_min, ext_max) = match self.wait_advance(seq)? {
            Payload::Boxes { ext_min, ext_max } => (ext_min, ext_max),
            _ => unreachable!("broad-phase rendezvous yields a Boxes payload"),
        };

        // Second flush stage: cells owned here emit their pairs to the
        // router, and the extent histogram rides the closing rendezvous.
        let flight = self.flight.as_ref().unwrap();
        let pairs = flight.flush.emit(self.config.cell);
        let hist = transfer::extent_histogram(
            &flight.src_boxes,
            ext_min,
            ext_max,
            self.config.buckets,
        );
        self.post(ROOT, Msg::Collisions { pairs });
        let seq = self.take_seq();
        self.contribute(seq, Payload::Hist { counts: hist })?;
        match self.wait_advance(seq)? {
            Payload::Hist { counts } => {
                if self.comm.rank() == ROOT {
                    log_histogram(&counts, ext_min, ext_max, self.config.buckets);
                }
            }
            _ => unreachable!("grid-done rendezvous yields a Hist payload"),
        }
        Ok(())
    }

    /// Root routes the collected pairs to the destination chunks; the
    /// outcome is broadcast so a routing fault aborts every rank.
    fn route_phase(&mut self, src: MeshHandle, dst: MeshHandle) -> Result<(), TransferError> {
        let seq = self.take_seq();
        if self.comm.rank() == ROOT {
            // Remote batches arrived ahead of the rendezvous contributions
            // just absorbed (pairwise FIFO); the root's own batch may still
            // be sitting in its inbox.
            while self.flight.as_ref().unwrap().collision_batches < self.comm.size() {
                self.step()?;
            }
            let pairs = std::mem::take(&mut self.flight.as_mut().unwrap().pairs);
            info!("collisions found: {}", pairs.len());
            match router::route(&pairs, &src, &dst) {
                Err(e) => {
                    self.broadcast(
                        seq,
                        Payload::Route {
                            fault: Some(e.into()),
                        },
                    );
                }
                Ok(per_dest) => {
                    self.flight.as_mut().unwrap().stats.candidates = pairs.len() as u64;
                    let mut posts = Vec::new();
                    for (dest_chunk, pairs) in per_dest {
                        debug!("dest chunk {} has {} candidates", dest_chunk, pairs.len());
                        posts.push((
                            self.rank_of_chunk_id(dest_chunk)?,
                            Msg::Candidates { dest_chunk, pairs },
                        ));
                    }
                    for (rank, msg) in posts {
                        self.post(rank, msg);
                    }
                    self.broadcast(seq, Payload::Route { fault: None });
                }
            }
        }
        match self.wait_advance(seq)? {
            Payload::Route { fault: Some(fault) } => Err(fault),
            Payload::Route { fault: None } => Ok(()),
            _ => unreachable!("routing broadcast yields a Route payload"),
        }
    }

    /// True once every local destination chunk has its candidate list and
    /// as many replies as batches it dispatched.
    fn narrow_done(&self, dst: &MeshHandle) -> bool {
        let flight = self.flight.as_ref().unwrap();
        let record = &self.meshes[&dst.id];
        flight.candidates_seen == record.chunks.len()
            && record
                .chunks
                .values()
                .all(|chunk| chunk.got_candidates && chunk.replies == chunk.dispatched)
    }

    fn narrow_phase(&mut self, dst: MeshHandle) -> Result<(), TransferError> {
        let seq = self.take_seq();
        while !self.narrow_done(&dst) {
            self.step()?;
        }
        self.contribute(seq, Payload::Unit)?;
        // Source chunks hosted here keep serving potentials while the
        // slower destination ranks finish.
        self.wait_advance(seq)?;
        Ok(())
    }

    /// Tallies the destination side, closes the statistics rendezvous,
    /// and applies the global numeric verdict.
    fn done_phase(&mut self, dst: MeshHandle) -> Result<TransferStats, TransferError> {
        {
            let record = &self.meshes[&dst.id];
            let mut dest_points = 0;
            let mut orphans = 0;
            for chunk in record.chunks.values() {
                let (owned, lost) = transfer::tally_orphans(chunk);
                dest_points += owned;
                orphans += lost;
            }
            let stats = &mut self.flight.as_mut().unwrap().stats;
            stats.dest_points = dest_points;
            stats.orphans = orphans;
        }

        let seq = self.take_seq();
        let local = self.flight.as_ref().unwrap().stats;
        self.contribute(
            seq,
            Payload::Stats {
                stats: local,
                fault: None,
            },
        )?;
        match self.wait_advance(seq)? {
            Payload::Stats {
                fault: Some(fault), ..
            } => Err(fault),
            Payload::Stats { stats, .. } => Ok(stats),
            _ => unreachable!("final rendezvous yields a Stats payload"),
        }
    }

    /// Copies owned shared-node values to comm-map neighbors so every
    /// destination chunk ends with a complete field, then drains the
    /// batches owed to this rank.
    fn halo_phase(&mut self, dst: MeshHandle) -> Result<(), TransferError> {
        let mut posts = Vec::new();
        {
            let record = &self.meshes[&dst.id];
            for chunk in record.chunks.values() {
                for (&neighbor, shared) in &chunk.node_comm_map {
                    posts.push((
                        self.rank_of_chunk(neighbor),
                        Msg::Halo {
                            mesh: dst.id,
                            to: neighbor,
                            values: transfer::halo_values(chunk, shared),
                        },
                    ));
                }
            }
        }
        for (rank, msg) in posts {
            self.post(rank, msg);
        }
        while self
            .meshes[&dst.id]
            .chunks
            .values()
            .any(|chunk| chunk.halo_pending > 0)
        {
            self.step()?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Dispatch.

    fn dispatch(&mut self, msg: Msg) -> Result<(), TransferError> {
        match msg {
            Msg::MapperQuery {
                mesh,
                to,
                from,
                nodes,
                edges,
            } => {
                let run = self.mapper.as_mut().expect("a registration is in flight");
                run.seats
                    .get_mut(&to)
                    .expect("query addressed to a local bucket chunk")
                    .query(from, &nodes, &edges);
                let rank = self.rank_of_chunk(from);
                self.post(rank, Msg::MapperQueryAck { mesh, to: from });
            }
            Msg::MapperQueryAck { .. } => {
                self.mapper.as_mut().expect("a registration is in flight").pending_acks -= 1;
            }
            Msg::MapperBnd {
                mesh,
                to,
                from,
                maps,
            } => {
                self.mapper
                    .as_mut()
                    .expect("a registration is in flight")
                    .merge_bnd(to, maps);
                let rank = self.rank_of_chunk(from);
                self.post(rank, Msg::MapperBndAck { mesh, to: from });
            }
            Msg::MapperBndAck { .. } => {
                self.mapper
                    .as_mut()
                    .expect("a registration is in flight")
                    .pending_bnd_acks -= 1;
            }

            Msg::Contribute { seq, payload } => {
                debug_assert_eq!(self.comm.rank(), ROOT);
                self.absorb(seq, payload)?;
            }
            Msg::Advance { seq, payload } => {
                self.reductions.deliver(seq, payload);
            }

            Msg::GridBoxes { cells } => {
                self.flight
                    .as_mut()
                    .expect("a transfer is in flight")
                    .flush
                    .absorb(cells);
            }
            Msg::Collisions { pairs } => {
                debug_assert_eq!(self.comm.rank(), ROOT);
                let flight = self.flight.as_mut().expect("a transfer is in flight");
                flight.collision_batches += 1;
                flight.pairs.extend(pairs);
            }
            Msg::Candidates { dest_chunk, pairs } => {
                let (mesh, index) = self.locate(dest_chunk)?;
                let groups = {
                    let chunk = self.chunk_mut(mesh, index)?;
                    chunk.got_candidates = true;
                    let groups = transfer::candidate_groups(chunk, &pairs);
                    chunk.dispatched = groups.len();
                    groups
                };
                self.flight
                    .as_mut()
                    .expect("a transfer is in flight")
                    .candidates_seen += 1;
                for (source_chunk, records) in groups {
                    let rank = self.rank_of_chunk_id(source_chunk)?;
                    self.post(
                        rank,
                        Msg::Potentials {
                            source_chunk,
                            dest_chunk,
                            records,
                        },
                    );
                }
            }
            Msg::Potentials {
                source_chunk,
                dest_chunk,
                records,
            } => {
                let (mesh, index) = self.locate(source_chunk)?;
                let (data, skips) = {
                    let chunk = self.chunk(mesh, index)?;
                    transfer::evaluate(chunk, &records)
                };
                debug!(
                    "source chunk {} found {}/{} actual collisions",
                    source_chunk,
                    data.len(),
                    records.len(),
                );
                {
                    let stats = &mut self.flight.as_mut().expect("a transfer is in flight").stats;
                    stats.containments += data.len() as u64;
                    stats.numeric_skips += skips;
                }
                let rank = self.rank_of_chunk_id(dest_chunk)?;
                self.post(rank, Msg::Solutions { dest_chunk, data });
            }
            Msg::Solutions { dest_chunk, data } => {
                let (mesh, index) = self.locate(dest_chunk)?;
                let chunk = self.chunk_mut(mesh, index)?;
                transfer::write_solutions(chunk, &data);
                chunk.replies += 1;
            }
            Msg::Halo { mesh, to, values } => {
                let chunk = self.chunk_mut(mesh, to)?;
                transfer::apply_halo(chunk, &values);
                chunk.halo_pending -= 1;
            }
        }
        Ok(())
    }
}

/// Root-side review of a completed rendezvous before it is broadcast: the
/// global degenerate-tet budget is enforced here, once, on the merged
/// statistics.
fn root_review(payload: &mut Payload) {
    if let Payload::Stats { stats, fault } = payload {
        let budget = MAX_SKIP_RATIO * stats.candidates as f64;
        if fault.is_none() && stats.numeric_skips as f64 > budget {
            *fault = Some(
                NumericError::DegenerateRatio {
                    skips: stats.numeric_skips,
                    evaluations: stats.candidates,
                }
                .into(),
            );
        }
    }
}

fn log_histogram(counts: &[u64], lo: [f64; 3], hi: [f64; 3], buckets: usize) {
    info!("tet bounding-box extent histogram, {} buckets per axis", buckets);
    for (axis, name) in ["x", "y", "z"].iter().enumerate() {
        let width = (hi[axis] - lo[axis]) / buckets as f64;
        for k in 0..buckets {
            let low = lo[axis] + k as f64 * width;
            info!(
                "  {} [{:.6}, {:.6}]: {}",
                name,
                low,
                low + width,
                counts[axis * buckets + k],
            );
        }
    }
}

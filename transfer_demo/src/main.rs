//! Test driver: stands up an in-process rank pool over TCP, registers a
//! source and a destination box mesh, plants a Gaussian field on the
//! source, and runs one transfer.
//!
//! Exit codes: 0 success, 1 usage error, 2 I/O error, 3 partition error,
//! 4 numeric error.

use clap::Parser;
use crossmesh::boxmesh::{box_mesh, partition_slabs};
use crossmesh::config::{overdecompose, Config};
use crossmesh::coordinator::Exchange;
use crossmesh::error::TransferError;
use crossmesh::message::{Communicator, TcpCommunicator};
use crossmesh::partition::{ChunkInput, MeshRole};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::process::exit;
use std::thread;

#[derive(Debug, Clone, Parser)]
#[clap(version, about = "Solution transfer between two overlapping tet meshes")]
struct Opts {
    /// Source mesh, `box:NX,NY,NZ[:OX,OY,OZ[:H]]`.
    source: String,

    /// Destination mesh, same syntax.
    dest: String,

    /// Virtualization in [0.0, 1.0]; biases the decomposition toward more
    /// chunks per rank.
    #[clap(default_value = "0.0")]
    virtualization: f64,

    /// Number of ranks to spawn.
    #[clap(short, long, default_value = "4")]
    ranks: usize,

    /// First TCP port; rank i listens on port + i.
    #[clap(short, long, default_value = "9380")]
    port: u16,

    /// Configuration entries, e.g. -c grid.cell_x=0.25 -c collision.buckets=8.
    #[clap(short = 'c', long = "config")]
    entries: Vec<String>,
}

/// Parses a `box:NX,NY,NZ[:OX,OY,OZ[:H]]` mesh spec into chunk inputs.
/// Anything else (an ExodusII path, say) belongs to the mesh reader
/// collaborator and is an I/O error here.
fn parse_mesh(spec: &str, n_chunks: u32) -> Result<Vec<ChunkInput>, String> {
    let body = spec
        .strip_prefix("box:")
        .ok_or_else(|| format!("unreadable mesh {:?}: only box:NX,NY,NZ[:OX,OY,OZ[:H]] specs are generated here", spec))?;
    let fields: Vec<&str> = body.split(':').collect();
    if fields.is_empty() || fields.len() > 3 {
        return Err(format!("malformed mesh spec {:?}", spec));
    }

    let triple = |s: &str| -> Result<Vec<f64>, String> {
        let v: Result<Vec<f64>, _> = s.split(',').map(str::parse).collect();
        match v {
            Ok(v) if v.len() == 3 => Ok(v),
            _ => Err(format!("expected three comma-separated values in {:?}", s)),
        }
    };

    let shape = triple(fields[0])?;
    let cells = [shape[0] as usize, shape[1] as usize, shape[2] as usize];
    if cells.iter().any(|&n| n == 0) {
        return Err(format!("degenerate box shape in {:?}", spec));
    }
    let origin = if fields.len() > 1 {
        let o = triple(fields[1])?;
        [o[0], o[1], o[2]]
    } else {
        [0.0; 3]
    };
    let spacing = if fields.len() > 2 {
        fields[2]
            .parse()
            .map_err(|_| format!("bad cell spacing in {:?}", spec))?
    } else {
        1.0
    };

    Ok(partition_slabs(&box_mesh(cells, origin, spacing), n_chunks))
}

/// The initial source field, a Gaussian bump at the origin.
fn gaussian(input: &ChunkInput) -> Vec<f64> {
    let coord: HashMap<u64, [f64; 3]> = input.coords.iter().copied().collect();
    let mut gids: Vec<u64> = input.ginpoel.clone();
    gids.sort_unstable();
    gids.dedup();
    gids.into_iter()
        .map(|g| {
            let [x, y, z] = coord[&g];
            (-(x * x + y * y + z * z) / (2.0 * 0.05)).exp()
        })
        .collect()
}

fn exit_code(e: &TransferError) -> i32 {
    match e {
        TransferError::Config(_) => 1,
        TransferError::MalformedConnectivity { .. } => 2,
        TransferError::MissingCoordinate { .. } => 2,
        TransferError::EmptyPartition { .. } => 3,
        TransferError::Numeric(_) => 4,
        TransferError::Protocol(_) => 4,
        TransferError::Checkpoint(_) => 4,
    }
}

fn run(
    comm: TcpCommunicator,
    config: Config,
    n_chunks: u32,
    src_inputs: Vec<ChunkInput>,
    dst_inputs: Vec<ChunkInput>,
) -> Result<(), TransferError> {
    let rank = comm.rank();
    let mut ex = Exchange::new(comm, config)?;

    let mine = |inputs: Vec<ChunkInput>| -> Vec<ChunkInput> {
        inputs
            .into_iter()
            .filter(|c| ex.rank_of_chunk(c.chunk) == rank)
            .collect()
    };
    let src_inputs = mine(src_inputs);
    let dst_inputs = mine(dst_inputs);

    ex.register_mesh(0, MeshRole::Source, n_chunks, src_inputs.clone())?;
    ex.register_mesh(1, MeshRole::Destination, n_chunks, dst_inputs.clone())?;
    for input in &src_inputs {
        ex.set_source_field(0, input.chunk, gaussian(input))?;
    }
    for input in &dst_inputs {
        ex.set_destination_points(1, input.chunk)?;
    }

    let stats = ex.transfer(0, 1)?;
    if rank == 0 {
        println!(
            "transfer done: {} dest points, {} source tets, {} candidates, \
             {} containments, {} orphans, {} numeric skips",
            stats.dest_points,
            stats.source_tets,
            stats.candidates,
            stats.containments,
            stats.orphans,
            stats.numeric_skips,
        );
    }
    Ok(())
}

fn main() {
    env_logger::init();

    let opts = match Opts::try_parse() {
        Ok(opts) => opts,
        Err(e) => {
            eprintln!("{}", e);
            exit(1);
        }
    };

    let n_chunks = match overdecompose(opts.ranks, opts.virtualization) {
        Ok(n) => n as u32,
        Err(e) => {
            eprintln!("error: {}", e);
            exit(1);
        }
    };
    let config = match Config::from_entries(&opts.entries) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {}", e);
            exit(1);
        }
    };
    let src_inputs = match parse_mesh(&opts.source, n_chunks) {
        Ok(inputs) => inputs,
        Err(e) => {
            eprintln!("error: {}", e);
            exit(2);
        }
    };
    let dst_inputs = match parse_mesh(&opts.dest, n_chunks) {
        Ok(inputs) => inputs,
        Err(e) => {
            eprintln!("error: {}", e);
            exit(2);
        }
    };

    let peers: Vec<SocketAddr> = (0..opts.ranks)
        .map(|rank| {
            SocketAddr::new(
                IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)),
                opts.port + rank as u16,
            )
        })
        .collect();
    let comms: Vec<_> = (0..opts.ranks)
        .map(|rank| TcpCommunicator::new(rank, peers.clone()))
        .collect();

    let workers: Vec<_> = comms
        .into_iter()
        .map(|comm| {
            let (config, src, dst) = (config, src_inputs.clone(), dst_inputs.clone());
            thread::spawn(move || run(comm, config, n_chunks, src, dst))
        })
        .collect();

    let mut status = 0;
    for worker in workers {
        if let Err(e) = worker.join().unwrap() {
            eprintln!("error: {}", e);
            status = exit_code(&e);
        }
    }
    exit(status);
}

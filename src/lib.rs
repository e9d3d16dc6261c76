//! A small-scale distributed MapReduce engine over on-disk pair relations.
//!
//! A master splits an input relation into M SQLite shards and hands map and
//! reduce tasks to workers over gRPC. Workers materialize intermediate
//! partitions as local relations and serve them over HTTP so peers can pull
//! them; the master merges the R reduce outputs into the final relation.

use anyhow::Result;

pub mod cmd;
pub mod coordinator;
pub mod master;
pub mod relation;
pub mod rpc;
pub mod task;
pub mod transport;
pub mod worker;
pub mod workload;

/////////////////////////////////////////////////////////////////////////////
// MapReduce application types
/////////////////////////////////////////////////////////////////////////////

/// The output of an application map function.
///
/// There are 2 layers of [`anyhow::Result`]s here. The outer layer
/// accounts for errors that arise while creating the iterator.
/// The inner layer accounts for errors that occur during iteration.
///
/// This accomodates both batch (all pairs emitted at once) and lazy
/// (pairs only emitted when the iterator is consumed) map operations.
pub type MapOutput = Result<Box<dyn Iterator<Item = Result<Pair>>>>;

/// The output of an application reduce function, shaped like [`MapOutput`].
pub type ReduceOutput = Result<Box<dyn Iterator<Item = Result<Pair>>>>;

/// A map function takes one input pair and returns an iterator that
/// yields new key-value pairs. Each emitted pair lands in the reduce
/// partition chosen by [`ihash`]` % R`.
pub type MapFn = fn(key: String, value: String) -> MapOutput;

/// A reduce function takes a key and an iterator over every value stored
/// under that key, in ascending `(key, value)` order. The `values`
/// iterator is exhausted during the call; the returned iterator may emit
/// zero or more output pairs.
pub type ReduceFn =
    fn(key: String, values: Box<dyn Iterator<Item = String> + '_>) -> ReduceOutput;

/// A map reduce application.
#[derive(Copy, Clone)]
pub struct Workload {
    pub map_fn: MapFn,
    pub reduce_fn: ReduceFn,
}

/////////////////////////////////////////////////////////////////////////////
// Key-value pairs
/////////////////////////////////////////////////////////////////////////////

/// A single key-value pair, the unit of data everywhere in the engine.
/// Both fields are opaque text as far as the engine is concerned.
#[derive(Clone, Eq, PartialEq, Hash, Debug)]
pub struct Pair {
    /// The key.
    pub key: String,
    /// The value.
    pub value: String,
}

impl Pair {
    /// Construct a new key-value pair from the given key and value.
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Hashes an intermediate key with 32-bit FNV-1a over its UTF-8 bytes.
/// Compute a reduce bucket for a given key by calculating
/// `ihash(key) % n_reduce`; every node agrees on this contract, so all
/// values for one key land in the same reduce partition.
pub fn ihash(key: &str) -> u32 {
    const OFFSET_BASIS: u32 = 0x811c_9dc5;
    const PRIME: u32 = 0x0100_0193;
    key.bytes()
        .fold(OFFSET_BASIS, |hash, byte| (hash ^ u32::from(byte)).wrapping_mul(PRIME))
}

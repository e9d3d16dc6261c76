//! Map and reduce task execution.
//!
//! A map task downloads its source shard from the master, streams every
//! input pair through the user map, and partitions emitted pairs into R
//! output relations by `ihash(key) % R`. A reduce task pulls its N-th
//! partition from all M map workers, merges them, and drives the user
//! reduce once per distinct key of the sorted merged relation.

use std::path::Path;

use anyhow::{Context, Result};
use tracing::info;

use crate::relation::{self, Inserter, Relation, ScanOrder};
use crate::rpc;
use crate::{ihash, transport, MapFn, ReduceFn, Workload};

pub fn map_source_file(m: u32) -> String {
    format!("map_{m}_source.db")
}
pub fn map_input_file(m: u32) -> String {
    format!("map_{m}_input.db")
}
pub fn map_output_file(m: u32, r: u32) -> String {
    format!("map_{m}_output_{r}.db")
}
pub fn reduce_input_file(r: u32) -> String {
    format!("reduce_{r}_input.db")
}
pub fn reduce_output_file(r: u32) -> String {
    format!("reduce_{r}_output.db")
}
pub fn reduce_temp_file(r: u32) -> String {
    format!("reduce_{r}_temp.db")
}

/// The port-scoped temp directory a node keeps its relations in.
pub fn temp_dir(port: u16) -> String {
    format!("tmp{port}")
}

/// URL of `file` inside the temp directory served by `host:port`.
pub fn make_url(host: &str, port: u16, file: &str) -> String {
    format!("http://{host}:{port}/data/tmp{port}/{file}")
}

/// One of the M per-shard input transformations.
#[derive(Clone, Debug)]
pub struct MapTask {
    pub m: u32,
    pub r: u32,
    /// Partition index in `[0, M)`.
    pub n: u32,
    /// HTTP endpoint of the master hosting `map_<n>_source.db`.
    pub source_host: String,
    pub source_port: u16,
    pub distributed: bool,
    pub finished: bool,
}

/// One of the R per-partition groupings.
#[derive(Clone, Debug)]
pub struct ReduceTask {
    pub m: u32,
    pub r: u32,
    /// Partition index in `[0, R)`.
    pub n: u32,
    /// HTTP endpoints of the workers hosting `map_<i>_output_<n>.db`,
    /// slot `i` filled in when map task `i` finishes.
    pub source_hosts: Vec<String>,
    pub source_ports: Vec<u16>,
    pub distributed: bool,
    pub finished: bool,
    /// Worker that completed this task, recorded for the final merge.
    pub finished_by: String,
    pub finished_by_port: u16,
}

impl MapTask {
    pub fn new(m: u32, r: u32, n: u32, source_host: impl Into<String>, source_port: u16) -> Self {
        Self {
            m,
            r,
            n,
            source_host: source_host.into(),
            source_port,
            distributed: false,
            finished: false,
        }
    }

    /// Run this map task against the relations in `local_dir`.
    pub async fn process(&self, local_dir: &Path, workload: &Workload) -> Result<MapStats> {
        let url = make_url(&self.source_host, self.source_port, &map_source_file(self.n));
        let input_path = local_dir.join(map_input_file(self.n));
        transport::fetch(&url, &input_path)
            .await
            .with_context(|| format!("downloading source for map task {}", self.n))?;

        let input = Relation::open(&input_path)?;
        let outputs = (0..self.r)
            .map(|r| Relation::create(local_dir.join(map_output_file(self.n, r))))
            .collect::<Result<Vec<_>>>()?;

        let stats = run_map(&input, &outputs, workload.map_fn)?;
        info!(
            task = self.n,
            pairs_in = stats.pairs_in,
            pairs_out = stats.pairs_out,
            "map task processed"
        );
        Ok(stats)
    }
}

impl ReduceTask {
    pub fn new(m: u32, r: u32, n: u32) -> Self {
        Self {
            m,
            r,
            n,
            source_hosts: vec![String::new(); m as usize],
            source_ports: vec![0; m as usize],
            distributed: false,
            finished: false,
            finished_by: String::new(),
            finished_by_port: 0,
        }
    }

    /// Run this reduce task against the relations in `local_dir`.
    pub async fn process(&self, local_dir: &Path, workload: &Workload) -> Result<ReduceStats> {
        let urls: Vec<String> = (0..self.m as usize)
            .map(|i| {
                make_url(
                    &self.source_hosts[i],
                    self.source_ports[i],
                    &map_output_file(i as u32, self.n),
                )
            })
            .collect();
        let input = relation::merge(
            &urls,
            &local_dir.join(reduce_input_file(self.n)),
            &local_dir.join(reduce_temp_file(self.n)),
        )
        .await
        .with_context(|| format!("assembling input for reduce task {}", self.n))?;

        let output = Relation::create(local_dir.join(reduce_output_file(self.n)))?;
        let stats = run_reduce(&input, &output, workload.reduce_fn)?;
        info!(
            task = self.n,
            keys = stats.keys,
            values = stats.values,
            pairs_out = stats.pairs_out,
            "reduce task processed"
        );
        Ok(stats)
    }
}

/// Counters logged after a map task.
#[derive(Debug, Default, Clone, Copy)]
pub struct MapStats {
    pub pairs_in: u64,
    pub pairs_out: u64,
}

/// Counters logged after a reduce task.
#[derive(Debug, Default, Clone, Copy)]
pub struct ReduceStats {
    pub keys: u64,
    pub values: u64,
    pub pairs_out: u64,
}

fn run_map(input: &Relation, outputs: &[Relation], map_fn: MapFn) -> Result<MapStats> {
    let mut inserters = outputs
        .iter()
        .map(Relation::inserter)
        .collect::<Result<Vec<_>>>()?;
    let r = outputs.len() as u32;
    let mut pairs_out = 0u64;
    let pairs_in = input.scan(ScanOrder::Stored, |key, value| {
        for emitted in map_fn(key, value)? {
            let pair = emitted?;
            let bucket = ihash(&pair.key) % r;
            inserters[bucket as usize].insert(&pair.key, &pair.value)?;
            pairs_out += 1;
        }
        Ok(())
    })?;
    Ok(MapStats { pairs_in, pairs_out })
}

fn run_reduce(input: &Relation, output: &Relation, reduce_fn: ReduceFn) -> Result<ReduceStats> {
    let mut inserter = output.inserter()?;
    let mut stats = ReduceStats::default();
    // The sorted scan makes equal keys contiguous; buffer one group at a
    // time and hand it to the user reduce on every key change.
    let mut current: Option<String> = None;
    let mut group: Vec<String> = Vec::new();
    input.scan(ScanOrder::KeyValue, |key, value| {
        if current.as_deref() != Some(key.as_str()) {
            if let Some(done) = current.take() {
                flush_group(reduce_fn, done, std::mem::take(&mut group), &mut inserter, &mut stats)?;
            }
            current = Some(key);
        }
        group.push(value);
        Ok(())
    })?;
    if let Some(done) = current.take() {
        flush_group(reduce_fn, done, group, &mut inserter, &mut stats)?;
    }
    Ok(stats)
}

fn flush_group(
    reduce_fn: ReduceFn,
    key: String,
    values: Vec<String>,
    inserter: &mut Inserter<'_>,
    stats: &mut ReduceStats,
) -> Result<()> {
    stats.keys += 1;
    stats.values += values.len() as u64;
    for emitted in reduce_fn(key, Box::new(values.into_iter()))? {
        let pair = emitted?;
        inserter.insert(&pair.key, &pair.value)?;
        stats.pairs_out += 1;
    }
    Ok(())
}

/////////////////////////////////////////////////////////////////////////////
// Wire conversions
/////////////////////////////////////////////////////////////////////////////

impl From<&MapTask> for rpc::MapTask {
    fn from(task: &MapTask) -> Self {
        Self {
            m: task.m,
            r: task.r,
            n: task.n,
            source_host: task.source_host.clone(),
            source_port: u32::from(task.source_port),
        }
    }
}

impl From<rpc::MapTask> for MapTask {
    fn from(msg: rpc::MapTask) -> Self {
        let mut task = Self::new(msg.m, msg.r, msg.n, msg.source_host, msg.source_port as u16);
        task.distributed = true;
        task
    }
}

impl From<&ReduceTask> for rpc::ReduceTask {
    fn from(task: &ReduceTask) -> Self {
        Self {
            m: task.m,
            r: task.r,
            n: task.n,
            source_hosts: task.source_hosts.clone(),
            source_ports: task.source_ports.iter().copied().map(u32::from).collect(),
        }
    }
}

impl From<rpc::ReduceTask> for ReduceTask {
    fn from(msg: rpc::ReduceTask) -> Self {
        let mut task = Self::new(msg.m, msg.r, msg.n);
        task.source_hosts = msg.source_hosts;
        task.source_ports = msg.source_ports.into_iter().map(|p| p as u16).collect();
        task.distributed = true;
        task
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{workload, Pair};
    use std::fs;
    use std::path::PathBuf;

    fn scratch_dir(test: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("mrdb-task-{test}-{}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn keys_of(relation: &Relation) -> Vec<String> {
        let mut keys = Vec::new();
        relation
            .scan(ScanOrder::KeyValue, |key, _| {
                keys.push(key);
                Ok(())
            })
            .unwrap();
        keys
    }

    #[test]
    fn map_partitions_tokens_by_fnv1a_mod_r() {
        let dir = scratch_dir("map-partition");
        let input = Relation::create(dir.join("input.db")).unwrap();
        input.insert(&Pair::new("_", "a b c d e")).unwrap();
        let outputs = (0..3)
            .map(|r| Relation::create(dir.join(map_output_file(0, r))).unwrap())
            .collect::<Vec<_>>();

        let wc = workload::named("wc").unwrap();
        let stats = run_map(&input, &outputs, wc.map_fn).unwrap();
        assert_eq!(stats.pairs_in, 1);
        assert_eq!(stats.pairs_out, 5);

        // Buckets precomputed from the FNV-1a 32 hash of each token.
        assert!(keys_of(&outputs[0]).is_empty());
        assert_eq!(keys_of(&outputs[1]), vec!["a", "b", "d"]);
        assert_eq!(keys_of(&outputs[2]), vec!["c", "e"]);
    }

    #[test]
    fn reduce_groups_contiguous_keys_from_the_sorted_scan() {
        let dir = scratch_dir("reduce-group");
        let input = Relation::create(dir.join("input.db")).unwrap();
        for token in ["a", "a", "b", "a", "b", "c"] {
            input.insert(&Pair::new(token, "1")).unwrap();
        }
        let output = Relation::create(dir.join("output.db")).unwrap();

        let wc = workload::named("wc").unwrap();
        let stats = run_reduce(&input, &output, wc.reduce_fn).unwrap();
        assert_eq!(stats.keys, 3);
        assert_eq!(stats.values, 6);
        assert_eq!(stats.pairs_out, 3);

        let mut rows = Vec::new();
        output
            .scan(ScanOrder::KeyValue, |key, value| {
                rows.push((key, value));
                Ok(())
            })
            .unwrap();
        assert_eq!(
            rows,
            [("a", "3"), ("b", "2"), ("c", "1")].map(|(k, v)| (k.to_string(), v.to_string()))
        );
    }

    #[test]
    fn reduce_of_empty_input_emits_nothing() {
        let dir = scratch_dir("reduce-empty");
        let input = Relation::create(dir.join("input.db")).unwrap();
        let output = Relation::create(dir.join("output.db")).unwrap();

        let wc = workload::named("wc").unwrap();
        let stats = run_reduce(&input, &output, wc.reduce_fn).unwrap();
        assert_eq!(stats.keys, 0);
        assert_eq!(output.count().unwrap(), 0);
    }

    #[test]
    fn url_layout_matches_the_served_temp_dir() {
        assert_eq!(
            make_url("localhost", 3410, &map_source_file(0)),
            "http://localhost:3410/data/tmp3410/map_0_source.db"
        );
        assert_eq!(map_output_file(2, 1), "map_2_output_1.db");
        assert_eq!(reduce_output_file(4), "reduce_4_output.db");
    }
}

//! On-disk pair relations backed by SQLite.
//!
//! A relation is a single `pairs (key text, value text)` table in its own
//! database file. The engine only ever scans it (optionally ordered by
//! `(key, value)`), inserts into it, and bulk-copies another relation into
//! it by attaching the other file. Relations are addressable by file path
//! and, once placed under a node's data directory, servable by URL.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use rusqlite::Connection;

use crate::transport;
use crate::Pair;

/// Row order for [`Relation::scan`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ScanOrder {
    /// Whatever order the rows come back in.
    Stored,
    /// Ascending `(key, value)`; reduce grouping depends on this.
    KeyValue,
}

/// An open pair relation.
pub struct Relation {
    conn: Connection,
    path: PathBuf,
}

impl Relation {
    /// Open an existing relation file.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let conn = Connection::open(&path)
            .with_context(|| format!("opening relation {}", path.display()))?;
        conn.busy_timeout(Duration::from_millis(10_000))?;
        conn.pragma_update(None, "synchronous", "OFF")?;
        // journal_mode hands back the new mode as a row, so query it.
        conn.query_row("PRAGMA journal_mode = OFF", [], |_| Ok(()))?;
        Ok(Self { conn, path })
    }

    /// Create a fresh relation at `path`, removing any prior file.
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            fs::remove_file(path)
                .with_context(|| format!("removing stale relation {}", path.display()))?;
        }
        let relation = Self::open(path)?;
        relation
            .conn
            .execute("CREATE TABLE pairs (key text, value text)", [])?;
        Ok(relation)
    }

    /// The file this relation lives in.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Insert a single pair.
    pub fn insert(&self, pair: &Pair) -> Result<()> {
        self.conn.execute(
            "INSERT INTO pairs (key, value) VALUES (?1, ?2)",
            [&pair.key, &pair.value],
        )?;
        Ok(())
    }

    /// A prepared insert statement for hot loops.
    pub fn inserter(&self) -> Result<Inserter<'_>> {
        let stmt = self
            .conn
            .prepare("INSERT INTO pairs (key, value) VALUES (?1, ?2)")?;
        Ok(Inserter { stmt })
    }

    /// Run `f` over every pair; returns the number of rows visited.
    pub fn scan<F>(&self, order: ScanOrder, mut f: F) -> Result<u64>
    where
        F: FnMut(String, String) -> Result<()>,
    {
        let sql = match order {
            ScanOrder::Stored => "SELECT key, value FROM pairs",
            ScanOrder::KeyValue => "SELECT key, value FROM pairs ORDER BY key, value",
        };
        let mut stmt = self.conn.prepare(sql)?;
        let mut rows = stmt.query([])?;
        let mut seen = 0u64;
        while let Some(row) = rows.next()? {
            f(row.get(0)?, row.get(1)?)?;
            seen += 1;
        }
        Ok(seen)
    }

    /// Attach-and-copy: insert every row of the relation at `other` into
    /// this one, then detach.
    pub fn copy_from(&self, other: &Path) -> Result<u64> {
        let other = other
            .to_str()
            .with_context(|| format!("non-utf8 relation path {}", other.display()))?;
        self.conn
            .execute("ATTACH DATABASE ?1 AS merge", [other])
            .with_context(|| format!("attaching {other}"))?;
        let copied = self
            .conn
            .execute("INSERT INTO pairs SELECT key, value FROM merge.pairs", [])?;
        self.conn.execute("DETACH DATABASE merge", [])?;
        Ok(copied as u64)
    }

    /// Number of pairs stored.
    pub fn count(&self) -> Result<u64> {
        let count = self
            .conn
            .query_row("SELECT count(*) FROM pairs", [], |row| row.get(0))?;
        Ok(count)
    }
}

/// A prepared point-insert into one relation.
pub struct Inserter<'rel> {
    stmt: rusqlite::Statement<'rel>,
}

impl Inserter<'_> {
    pub fn insert(&mut self, key: &str, value: &str) -> Result<()> {
        self.stmt.execute([key, value])?;
        Ok(())
    }
}

/// Split `input` into `m` fresh relations under `out_dir`, named by `name`,
/// distributing rows round-robin in scan order. Returns the output file
/// names. Every shard must end up non-empty, so an input with fewer than
/// `m` rows is an error.
pub fn split(
    input: &Path,
    out_dir: &Path,
    m: u32,
    name: impl Fn(u32) -> String,
) -> Result<Vec<String>> {
    let input = Relation::open(input)?;
    let mut names = Vec::with_capacity(m as usize);
    let mut outputs = Vec::with_capacity(m as usize);
    for i in 0..m {
        let file = name(i);
        outputs.push(Relation::create(out_dir.join(&file))?);
        names.push(file);
    }

    let mut inserters = outputs
        .iter()
        .map(Relation::inserter)
        .collect::<Result<Vec<_>>>()?;
    let mut next = 0usize;
    let rows = input.scan(ScanOrder::Stored, |key, value| {
        inserters[next].insert(&key, &value)?;
        next = (next + 1) % m as usize;
        Ok(())
    })?;
    drop(inserters);

    if rows < u64::from(m) {
        bail!("input holds {rows} pairs, fewer than the {m} map tasks requested");
    }
    Ok(names)
}

/// Merge the relations behind `urls` into a fresh relation at `dest`,
/// downloading each one to `scratch` and attach-copying it in. Errors
/// short-circuit; the scratch file is deleted after each copy.
pub async fn merge(urls: &[String], dest: &Path, scratch: &Path) -> Result<Relation> {
    let output = Relation::create(dest)?;
    for url in urls {
        transport::fetch(url, scratch)
            .await
            .with_context(|| format!("fetching {url}"))?;
        output
            .copy_from(scratch)
            .with_context(|| format!("merging {url} into {}", dest.display()))?;
        fs::remove_file(scratch)?;
    }
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_dir(test: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("mrdb-relation-{test}-{}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn collect(relation: &Relation, order: ScanOrder) -> Vec<(String, String)> {
        let mut rows = Vec::new();
        relation
            .scan(order, |key, value| {
                rows.push((key, value));
                Ok(())
            })
            .unwrap();
        rows
    }

    #[test]
    fn scan_orders_by_key_then_value() {
        let dir = scratch_dir("scan-order");
        let relation = Relation::create(dir.join("pairs.db")).unwrap();
        for (key, value) in [("b", "2"), ("a", "9"), ("b", "1"), ("a", "10")] {
            relation.insert(&Pair::new(key, value)).unwrap();
        }

        let rows = collect(&relation, ScanOrder::KeyValue);
        // Text ordering: "10" sorts before "9".
        let expected = [("a", "10"), ("a", "9"), ("b", "1"), ("b", "2")];
        assert_eq!(
            rows,
            expected.map(|(k, v)| (k.to_string(), v.to_string()))
        );
    }

    #[test]
    fn copy_from_preserves_the_row_multiset() {
        let dir = scratch_dir("copy-from");
        let source = Relation::create(dir.join("source.db")).unwrap();
        for (key, value) in [("x", "1"), ("x", "1"), ("y", "2")] {
            source.insert(&Pair::new(key, value)).unwrap();
        }
        let dest = Relation::create(dir.join("dest.db")).unwrap();
        dest.insert(&Pair::new("z", "3")).unwrap();

        let copied = dest.copy_from(source.path()).unwrap();
        assert_eq!(copied, 3);
        assert_eq!(dest.count().unwrap(), 4);

        let mut rows = collect(&dest, ScanOrder::Stored);
        rows.sort();
        assert_eq!(
            rows,
            [("x", "1"), ("x", "1"), ("y", "2"), ("z", "3")]
                .map(|(k, v)| (k.to_string(), v.to_string()))
        );
    }

    #[test]
    fn split_round_robins_in_scan_order() {
        let dir = scratch_dir("split");
        let input = Relation::create(dir.join("input.db")).unwrap();
        for i in 0..5 {
            input.insert(&Pair::new(format!("k{i}"), i.to_string())).unwrap();
        }

        let names = split(input.path(), &dir, 2, |i| format!("shard_{i}.db")).unwrap();
        assert_eq!(names, vec!["shard_0.db", "shard_1.db"]);

        let shard0 = Relation::open(dir.join("shard_0.db")).unwrap();
        let shard1 = Relation::open(dir.join("shard_1.db")).unwrap();
        assert_eq!(
            collect(&shard0, ScanOrder::Stored)
                .into_iter()
                .map(|(k, _)| k)
                .collect::<Vec<_>>(),
            vec!["k0", "k2", "k4"]
        );
        assert_eq!(
            collect(&shard1, ScanOrder::Stored)
                .into_iter()
                .map(|(k, _)| k)
                .collect::<Vec<_>>(),
            vec!["k1", "k3"]
        );
    }

    #[test]
    fn split_rejects_inputs_smaller_than_m() {
        let dir = scratch_dir("split-short");
        let input = Relation::create(dir.join("input.db")).unwrap();
        input.insert(&Pair::new("only", "1")).unwrap();

        let err = split(input.path(), &dir, 3, |i| format!("shard_{i}.db")).unwrap_err();
        assert!(err.to_string().contains("fewer than the 3 map tasks"));
    }
}

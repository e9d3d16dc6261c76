//! Degree counting over an edge list. Each line of the value is an edge
//! `u v`; both endpoints collect one degree.

use anyhow::anyhow;

use crate::{MapOutput, Pair, ReduceOutput};

pub fn map(_key: String, value: String) -> MapOutput {
    let mut vertices = Vec::new();
    for line in value.lines().filter(|l| !l.trim().is_empty()) {
        let mut ends = line.split_whitespace();
        let (u, v) = ends
            .next()
            .zip(ends.next())
            .ok_or_else(|| anyhow!("malformed edge line {line:?}"))?;
        vertices.push(u.to_string());
        vertices.push(v.to_string());
    }
    Ok(Box::new(
        vertices.into_iter().map(|vertex| Ok(Pair::new(vertex, "1"))),
    ))
}

pub fn reduce(key: String, values: Box<dyn Iterator<Item = String> + '_>) -> ReduceOutput {
    let degree = values.count();
    Ok(Box::new(std::iter::once(Ok(Pair::new(
        key,
        degree.to_string(),
    )))))
}

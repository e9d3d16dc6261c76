//! A MapReduce-compatible implementation of word count.
//!

use crate::{MapOutput, Pair, ReduceOutput};

/// Emits `(word, "1")` for every word in the value. A word is a
/// whitespace-separated token with everything but letters and digits
/// stripped, lowercased.
pub fn map(_key: String, value: String) -> MapOutput {
    let words: Vec<String> = value
        .split_whitespace()
        .filter_map(|token| {
            let word: String = token
                .chars()
                .filter(|c| c.is_alphanumeric())
                .flat_map(char::to_lowercase)
                .collect();
            (!word.is_empty()).then_some(word)
        })
        .collect();
    Ok(Box::new(words.into_iter().map(|word| Ok(Pair::new(word, "1")))))
}

/// Sums the counts stored under one word.
pub fn reduce(key: String, values: Box<dyn Iterator<Item = String> + '_>) -> ReduceOutput {
    let mut count: u64 = 0;
    for value in values {
        count += value.parse::<u64>()?;
    }
    Ok(Box::new(std::iter::once(Ok(Pair::new(
        key,
        count.to_string(),
    )))))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_map(value: &str) -> Vec<(String, String)> {
        map("_".into(), value.into())
            .unwrap()
            .map(|pair| pair.map(|p| (p.key, p.value)).unwrap())
            .collect()
    }

    #[test]
    fn map_tokenizes_lowercases_and_strips_punctuation() {
        assert_eq!(
            run_map("The quick-brown FOX, fox!"),
            [
                ("the", "1"),
                ("quickbrown", "1"),
                ("fox", "1"),
                ("fox", "1")
            ]
            .map(|(k, v)| (k.to_string(), v.to_string()))
        );
        assert!(run_map("?! --- ...").is_empty());
    }

    #[test]
    fn reduce_sums_counts() {
        let values: Vec<String> = vec!["1".into(), "2".into(), "1".into()];
        let out: Vec<Pair> = reduce("fox".into(), Box::new(values.into_iter()))
            .unwrap()
            .collect::<anyhow::Result<_>>()
            .unwrap();
        assert_eq!(out, vec![Pair::new("fox", "4")]);
    }

    #[test]
    fn reduce_rejects_non_numeric_counts() {
        let values: Vec<String> = vec!["one".into()];
        assert!(reduce("fox".into(), Box::new(values.into_iter())).is_err());
    }
}

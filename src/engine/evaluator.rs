//! Output scoring. Every method returns a value in `[0, 1]`.

use crate::model::EvaluationMethod;
use std::collections::{HashMap, HashSet};

fn normalize(s: &str) -> String {
    s.trim().to_lowercase()
}

/// Score a prediction against the expected output.
///
/// Unknown methods score 0.0 rather than failing, so one bad method name stored on a
/// schedule cannot abort a whole batch.
pub fn score(predicted: &str, expected: &str, method: EvaluationMethod) -> f64 {
    let predicted = normalize(predicted);
    let expected = normalize(expected);
    match method {
        EvaluationMethod::Exact => {
            if predicted == expected {
                1.0
            } else {
                0.0
            }
        }
        EvaluationMethod::Fuzzy => similarity_ratio(&predicted, &expected),
        EvaluationMethod::Semantic => word_overlap(&predicted, &expected),
        EvaluationMethod::Contains => {
            if predicted.contains(expected.as_str()) {
                1.0
            } else {
                0.0
            }
        }
        EvaluationMethod::Unknown => 0.0,
    }
}

/// `2 * M / (|a| + |b|)` where `M` is the number of characters covered by the
/// longest common blocks, found recursively on either side of each block.
pub fn similarity_ratio(a: &str, b: &str) -> f64 {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let total = a.len() + b.len();
    if total == 0 {
        return 1.0;
    }
    let matched = matching_chars(&a, &b);
    (2.0 * matched as f64) / total as f64
}

fn matching_chars(a: &[char], b: &[char]) -> usize {
    // positions of each char in `b`, ascending
    let mut b2j: HashMap<char, Vec<usize>> = HashMap::new();
    for (j, c) in b.iter().enumerate() {
        b2j.entry(*c).or_default().push(j);
    }

    let mut matched = 0;
    let mut pending = vec![(0, a.len(), 0, b.len())];
    while let Some((alo, ahi, blo, bhi)) = pending.pop() {
        let (i, j, k) = longest_block(a, &b2j, alo, ahi, blo, bhi);
        if k == 0 {
            continue;
        }
        matched += k;
        if alo < i && blo < j {
            pending.push((alo, i, blo, j));
        }
        if i + k < ahi && j + k < bhi {
            pending.push((i + k, ahi, j + k, bhi));
        }
    }
    matched
}

/// Longest common block of `a[alo..ahi]` and `b[blo..bhi]`, earliest in `a` then
/// earliest in `b`. Only positions where the chars agree are visited, so the cost
/// follows the number of matching pairs rather than `|a| * |b|`.
fn longest_block(
    a: &[char],
    b2j: &HashMap<char, Vec<usize>>,
    alo: usize,
    ahi: usize,
    blo: usize,
    bhi: usize,
) -> (usize, usize, usize) {
    let mut best = (alo, blo, 0);
    // j -> length of the block ending at (i - 1, j)
    let mut j2len: HashMap<usize, usize> = HashMap::new();
    for (i, c) in a.iter().enumerate().take(ahi).skip(alo) {
        let mut next: HashMap<usize, usize> = HashMap::new();
        if let Some(js) = b2j.get(c) {
            let from = js.partition_point(|&j| j < blo);
            for &j in js[from..].iter().take_while(|&&j| j < bhi) {
                let k = j
                    .checked_sub(1)
                    .and_then(|prev| j2len.get(&prev))
                    .copied()
                    .unwrap_or(0)
                    + 1;
                next.insert(j, k);
                if k > best.2 {
                    best = (i + 1 - k, j + 1 - k, k);
                }
            }
        }
        j2len = next;
    }
    best
}

/// Jaccard index of whitespace-separated word sets.
fn word_overlap(predicted: &str, expected: &str) -> f64 {
    let p: HashSet<&str> = predicted.split_whitespace().collect();
    let e: HashSet<&str> = expected.split_whitespace().collect();
    if e.is_empty() {
        return if p.is_empty() { 1.0 } else { 0.0 };
    }
    let union = p.union(&e).count();
    if union == 0 {
        return 0.0;
    }
    p.intersection(&e).count() as f64 / union as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use EvaluationMethod::*;

    #[test]
    fn exact_ignores_case_and_padding() {
        assert_eq!(score("A", "a", Exact), 1.0);
        assert_eq!(score("  Paris\n", "paris", Exact), 1.0);
        assert_eq!(score("Paris.", "paris", Exact), 0.0);
    }

    #[test]
    fn fuzzy_is_bounded_and_reflexive() {
        let pairs = [
            ("hello world", "hello world"),
            ("abcd", "bcde"),
            ("", "something"),
            ("The quick brown fox", "the lazy dog"),
            ("", ""),
        ];
        for (p, e) in pairs {
            let s = score(p, e, Fuzzy);
            assert!((0.0..=1.0).contains(&s), "{p:?} vs {e:?} -> {s}");
        }
        assert_eq!(score("Same Text", "same text", Fuzzy), 1.0);
        assert_eq!(score("", "", Fuzzy), 1.0);
        assert_eq!(score("abc", "xyz", Fuzzy), 0.0);
    }

    #[test]
    fn fuzzy_matches_block_ratio() {
        // blocks "bcd": 2 * 3 / 8
        assert!((similarity_ratio("abcd", "bcde") - 0.75).abs() < 1e-12);
        // "ab" then "d" on the right side: 2 * 3 / 8
        assert!((similarity_ratio("abxd", "abyd") - 0.75).abs() < 1e-12);
    }

    #[test]
    fn fuzzy_handles_long_outputs() {
        let text = (0..800).map(|n| n.to_string()).collect::<Vec<_>>().join(" ");
        let n = text.chars().count();
        let mut edited: Vec<char> = text.chars().collect();
        edited[n / 2] = '#';
        let edited: String = edited.into_iter().collect();
        let expected = (n - 1) as f64 / n as f64;
        assert!((similarity_ratio(&text, &edited) - expected).abs() < 1e-12);

        let half: String = text.chars().take(n / 2).collect();
        let expected = 2.0 * (n / 2) as f64 / (n + n / 2) as f64;
        assert!((similarity_ratio(&text, &half) - expected).abs() < 1e-12);
    }

    #[test]
    fn semantic_uses_word_sets() {
        assert_eq!(score("anything", "", Semantic), 0.0);
        assert_eq!(score("   ", "", Semantic), 1.0);
        // {the, cat} vs {the, dog}: 1 / 3
        assert!((score("The cat", "the dog", Semantic) - 1.0 / 3.0).abs() < 1e-12);
        assert_eq!(score("b a a", "A B", Semantic), 1.0);
    }

    #[test]
    fn contains_checks_substring() {
        assert_eq!(score("The answer is Paris.", " paris ", Contains), 1.0);
        assert_eq!(score("London", "paris", Contains), 0.0);
    }

    #[test]
    fn unknown_method_fails_closed() {
        assert_eq!(score("x", "x", Unknown), 0.0);
    }
}

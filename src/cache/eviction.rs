//! Least-recently-used victim selection

/// A cache entry considered for eviction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvictionCandidate {
    pub key: String,
    pub size_bytes: u64,
    pub last_access_time: i64,
}

/// Totals for one eviction pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EvictionSummary {
    pub entries: usize,
    pub bytes: u64,
}

/// Pick the least recently accessed entries whose sizes add up to at least
/// `bytes_to_free`. Entries with equal access times keep their scan order.
///
/// Returns every candidate when they cannot cover the request.
pub fn plan_eviction(
    mut candidates: Vec<EvictionCandidate>,
    bytes_to_free: u64,
) -> Vec<EvictionCandidate> {
    candidates.sort_by_key(|candidate| candidate.last_access_time);

    let mut freed = 0u64;
    let mut victims = Vec::new();
    for candidate in candidates {
        if freed >= bytes_to_free {
            break;
        }
        freed += candidate.size_bytes;
        victims.push(candidate);
    }
    victims
}

/// Sum of the sizes of `victims`.
pub fn summarize(victims: &[EvictionCandidate]) -> EvictionSummary {
    EvictionSummary {
        entries: victims.len(),
        bytes: victims.iter().map(|victim| victim.size_bytes).sum(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(key: &str, size_bytes: u64, last_access_time: i64) -> EvictionCandidate {
        EvictionCandidate {
            key: key.to_string(),
            size_bytes,
            last_access_time,
        }
    }

    fn keys(victims: &[EvictionCandidate]) -> Vec<&str> {
        victims.iter().map(|v| v.key.as_str()).collect()
    }

    #[test]
    fn test_oldest_entries_go_first() {
        let candidates = vec![
            candidate("newest", 10, 300),
            candidate("oldest", 10, 100),
            candidate("middle", 10, 200),
        ];
        let victims = plan_eviction(candidates, 15);
        assert_eq!(keys(&victims), vec!["oldest", "middle"]);
        assert_eq!(summarize(&victims), EvictionSummary { entries: 2, bytes: 20 });
    }

    #[test]
    fn test_stops_at_minimum_covering_prefix() {
        let candidates = vec![
            candidate("a", 40, 1),
            candidate("b", 5, 2),
            candidate("c", 100, 3),
        ];
        // 40 alone does not cover 41, 40 + 5 does.
        assert_eq!(keys(&plan_eviction(candidates.clone(), 41)), vec!["a", "b"]);
        assert_eq!(keys(&plan_eviction(candidates.clone(), 40)), vec!["a"]);
        assert!(plan_eviction(candidates, 0).is_empty());
    }

    #[test]
    fn test_ties_keep_scan_order() {
        let candidates = vec![
            candidate("first", 1, 7),
            candidate("second", 1, 7),
            candidate("third", 1, 7),
        ];
        assert_eq!(keys(&plan_eviction(candidates, 2)), vec!["first", "second"]);
    }

    #[test]
    fn test_takes_everything_when_short() {
        let candidates = vec![candidate("a", 3, 1), candidate("b", 4, 2)];
        let victims = plan_eviction(candidates, 1_000);
        assert_eq!(keys(&victims), vec!["a", "b"]);
        assert_eq!(summarize(&victims).bytes, 7);
    }
}

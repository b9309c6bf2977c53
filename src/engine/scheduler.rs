//! Range assignment, resume merging, and failure redistribution
//! (spec.md §4.7). Pure functions over `Connection`/`Url` so they're cheap
//! to unit-test without a live transport.

use crate::connection::{ConnState, Connection};
use crate::state_file::StateFile;
use crate::url::Url;

/// Split `[0, total)` into `num_connections` half-open ranges, the last
/// clamped to `total`. When `total < num_connections`, only `total`
/// connections are produced, each covering exactly one byte.
pub fn split_ranges(total: u64, num_connections: u32) -> Vec<(u64, u64)> {
    if total == 0 {
        return vec![(0, 0)];
    }
    let n = (num_connections as u64).min(total.max(1));
    let share = total / n;
    let mut ranges = Vec::with_capacity(n as usize);
    for i in 0..n {
        let start = i * share;
        let end = if i + 1 == n { total } else { (i + 1) * share };
        ranges.push((start, end));
    }
    ranges
}

/// Build the initial connection set at `Engine::open` (spec.md §4.7
/// "Range assignment at open"). `probed_pos` is the pool position of the
/// URL that actually answered the probe (spec.md §4.7 "start from the URL
/// that just succeeded", not necessarily `urls[0]`).
pub fn assign_ranges(
    total_size: Option<u64>,
    supported: bool,
    num_connections: u32,
    urls: &[Url],
    probed_pos: usize,
) -> Vec<Connection> {
    let probed = urls[probed_pos].clone();
    match total_size {
        Some(total) if supported => split_ranges(total, num_connections)
            .into_iter()
            .enumerate()
            .map(|(i, (start, end))| Connection::new(i, probed.clone(), probed_pos, start, end))
            .collect(),
        _ => vec![Connection::new(0, probed, probed_pos, 0, u64::MAX)],
    }
}

/// Apply a loaded state file's saved ranges over freshly computed
/// connections (spec.md §4.5 "Read protocol", §4.7 "Resume assignment").
/// Complete connections' slack is merged into the next incomplete neighbor.
pub fn apply_resume(connections: &mut [Connection], saved: &StateFile) {
    let n = connections.len().min(saved.connections.len());
    for i in 0..n {
        let rec = &saved.connections[i];
        connections[i].range_start = connections[i].range_start.min(rec.current_byte);
        connections[i].bytes_fetched = rec.current_byte.saturating_sub(connections[i].range_start);
        connections[i].current_byte = rec.current_byte;
        connections[i].last_byte = rec.last_byte;
    }

    for i in 0..n {
        if connections[i].is_complete() {
            if let Some(next) = connections[i + 1..n].iter_mut().find(|c| !c.is_complete()) {
                next.last_byte = next.last_byte.max(connections[i].last_byte);
            }
        }
    }
}

/// Pick the next URL in round-robin order, starting just after
/// `failed_pos` (spec.md §4.7 "Tie-breaks").
pub fn next_alternate_url(urls: &[Url], failed_pos: usize) -> (Url, usize) {
    let n = urls.len();
    let next_pos = (failed_pos + 1) % n;
    (urls[next_pos].clone(), next_pos)
}

/// Among currently enabled connections, pick the one with the smallest
/// outstanding byte count to absorb a disabled connection's remaining range.
/// Ties broken by lowest index. A connection that is itself `is_complete()`
/// but still has queued ranges behind it remains eligible — its `outstanding()`
/// count already reflects that queue — so it can still be handed more work.
pub fn pick_redistribution_target(connections: &[Connection], exclude: usize) -> Option<usize> {
    connections
        .iter()
        .enumerate()
        .filter(|(i, c)| *i != exclude && c.enabled)
        .min_by_key(|(i, c)| (c.outstanding(), *i))
        .map(|(i, _)| i)
}

/// Disable `connections[index]` and hand its actual abandoned range —
/// `[current_byte, last_byte)` — to the smallest-outstanding-bytes recipient
/// as a queued range, rather than folding a byte count into the recipient's
/// `last_byte`. Returns `false` if there was no recipient (i.e. this was the
/// last enabled connection).
///
/// The donor's own `last_byte` is pulled back to its `current_byte`: bytes it
/// already wrote stay counted as done, and only the genuinely unfetched tail
/// moves to the recipient. Handing over the literal range (not just a count)
/// matters because the recipient's own active range is almost never
/// contiguous with the donor's abandoned one — bumping `last_byte` by a byte
/// count would silently claim bytes the recipient was never going to fetch,
/// leaving the donor's actual range never written and duplicating bytes
/// already covered by the recipient's existing assignment.
pub fn disable_and_redistribute(connections: &mut [Connection], index: usize) -> bool {
    let abandoned = (connections[index].current_byte, connections[index].last_byte);
    connections[index].last_byte = connections[index].current_byte;
    connections[index].enabled = false;
    connections[index].state = ConnState::Failed;

    if abandoned.0 >= abandoned.1 {
        return true;
    }

    match pick_redistribution_target(connections, index) {
        Some(target) => {
            connections[target].queue_range(abandoned);
            true
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url() -> Url {
        Url::parse("http://example.com/f").unwrap()
    }

    #[test]
    fn split_ranges_evenly_divisible() {
        let r = split_ranges(1_048_576, 4);
        assert_eq!(
            r,
            vec![
                (0, 262_144),
                (262_144, 524_288),
                (524_288, 786_432),
                (786_432, 1_048_576),
            ]
        );
    }

    #[test]
    fn split_ranges_not_divisible_covers_exactly() {
        let r = split_ranges(10, 3);
        assert_eq!(r.last().unwrap().1, 10);
        let mut covered = 0u64;
        for (s, e) in &r {
            assert_eq!(*s, covered);
            covered = *e;
        }
        assert_eq!(covered, 10);
    }

    #[test]
    fn split_ranges_fewer_bytes_than_connections() {
        let r = split_ranges(3, 8);
        assert_eq!(r.len(), 3);
        for (s, e) in &r {
            assert_eq!(e - s, 1);
        }
    }

    #[test]
    fn assign_ranges_single_connection_when_unsupported() {
        let urls = vec![url()];
        let conns = assign_ranges(Some(1000), false, 4, &urls, 0);
        assert_eq!(conns.len(), 1);
        assert_eq!(conns[0].last_byte, u64::MAX);
    }

    #[test]
    fn assign_ranges_single_connection_when_size_unknown() {
        let urls = vec![url()];
        let conns = assign_ranges(None, true, 4, &urls, 0);
        assert_eq!(conns.len(), 1);
    }

    #[test]
    fn assign_ranges_splits_when_supported_and_known() {
        let urls = vec![url()];
        let conns = assign_ranges(Some(1_048_576), true, 4, &urls, 0);
        assert_eq!(conns.len(), 4);
        assert_eq!(conns[3].last_byte, 1_048_576);
    }

    #[test]
    fn resume_merges_completed_slack_into_neighbor() {
        let urls = vec![url()];
        let mut conns = assign_ranges(Some(100), true, 4, &urls, 0);
        let saved = StateFile {
            total_size: Some(100),
            connections: vec![
                crate::state_file::ConnectionRecord {
                    current_byte: 25,
                    last_byte: 25,
                },
                crate::state_file::ConnectionRecord {
                    current_byte: 30,
                    last_byte: 50,
                },
                crate::state_file::ConnectionRecord {
                    current_byte: 50,
                    last_byte: 75,
                },
                crate::state_file::ConnectionRecord {
                    current_byte: 90,
                    last_byte: 100,
                },
            ],
        };
        apply_resume(&mut conns, &saved);
        assert!(conns[0].is_complete());
        // conn 1 absorbed conn 0's finished range boundary.
        assert_eq!(conns[1].last_byte, 50);
    }

    #[test]
    fn redistribution_picks_smallest_outstanding_with_lowest_index_tie_break() {
        let urls = vec![url()];
        let mut conns = assign_ranges(Some(400), true, 4, &urls, 0);
        // Connections 1 and 2 tie at 50 bytes remaining; connection 3 has more.
        conns[1].current_byte = conns[1].last_byte - 50;
        conns[2].current_byte = conns[2].last_byte - 50;
        conns[3].current_byte = conns[3].last_byte - 90;

        let target = pick_redistribution_target(&conns, 0).unwrap();
        assert_eq!(target, 1);
    }

    #[test]
    fn disable_and_redistribute_queues_the_donors_literal_range() {
        let urls = vec![url()];
        let mut conns = assign_ranges(Some(400), true, 4, &urls, 0);
        let donor_range = (conns[0].current_byte, conns[0].last_byte);
        let target_last_byte_before = conns[1].last_byte;

        assert!(disable_and_redistribute(&mut conns, 0));
        assert!(!conns[0].enabled);
        // donor's own last_byte is pulled back, not extended
        assert_eq!(conns[0].last_byte, conns[0].current_byte);
        // recipient's own active range is untouched...
        assert_eq!(conns[1].last_byte, target_last_byte_before);
        // ...the donor's actual range is queued behind it instead
        assert_eq!(conns[1].outstanding(), (conns[1].last_byte - conns[1].current_byte) + (donor_range.1 - donor_range.0));
    }

    #[test]
    fn disable_and_redistribute_does_not_drop_bytes_when_target_is_not_adjacent() {
        // Connection 0 fails with its range untouched; connection 3 (the far
        // end, not connection 1) is the smallest-outstanding target because
        // it has already fetched almost everything. The donor's range must
        // still show up intact in connection 3's queue, not silently folded
        // into connection 1's contiguous last_byte.
        let urls = vec![url()];
        let mut conns = assign_ranges(Some(400), true, 4, &urls, 0);
        conns[1].current_byte = conns[1].range_start;
        conns[2].current_byte = conns[2].range_start;
        conns[3].current_byte = conns[3].last_byte - 1;

        let donor_range = (conns[0].current_byte, conns[0].last_byte);
        assert!(disable_and_redistribute(&mut conns, 0));

        assert_eq!(conns[3].outstanding(), 1 + (donor_range.1 - donor_range.0));
        // connections 1 and 2 were not touched
        assert_eq!(conns[1].current_byte, conns[1].range_start);
        assert_eq!(conns[2].current_byte, conns[2].range_start);
    }

    #[test]
    fn assign_ranges_starts_from_the_probed_pool_position() {
        let urls = vec![
            Url::parse("http://a.example.com/f").unwrap(),
            Url::parse("http://b.example.com/f").unwrap(),
        ];
        let conns = assign_ranges(Some(100), true, 2, &urls, 1);
        assert!(conns.iter().all(|c| c.url_pool_pos == 1));
        assert!(conns.iter().all(|c| c.url.host == "b.example.com"));
    }

    #[test]
    fn next_alternate_url_round_robins_after_failed() {
        let urls = vec![
            Url::parse("http://a.example.com/f").unwrap(),
            Url::parse("http://b.example.com/f").unwrap(),
            Url::parse("http://c.example.com/f").unwrap(),
        ];
        let (chosen, pos) = next_alternate_url(&urls, 0);
        assert_eq!(pos, 1);
        assert_eq!(chosen.host, "b.example.com");

        let (chosen, pos) = next_alternate_url(&urls, 2);
        assert_eq!(pos, 0);
        assert_eq!(chosen.host, "a.example.com");
    }
}

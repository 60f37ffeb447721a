/// Half-open timestamp interval `[start_ts, end_ts)` owned by one worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TsChunk {
    pub start_ts: i64,
    pub end_ts: i64,
}

/// Split `[ts_min, ts_max]` into `n` contiguous chunks of uniform width.
/// The last chunk ends at `ts_max + 1` so events exactly at the upper bound
/// are still owned by someone.
pub fn partition_range(ts_min: i64, ts_max: i64, n: usize) -> Vec<TsChunk> {
    let n = n.max(1);
    let width = (ts_max - ts_min) as f64 / n as f64;

    (0..n)
        .map(|i| {
            let start_ts = (ts_min as f64 + width * i as f64).floor() as i64;
            let end_ts = if i == n - 1 {
                ts_max + 1
            } else {
                (ts_min as f64 + width * (i + 1) as f64).floor() as i64
            };
            TsChunk { start_ts, end_ts }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::partition_range;

    #[test]
    fn chunks_tile_the_range_without_gaps_or_overlap() {
        for n in [1usize, 2, 3, 7, 8, 16] {
            let (a, b) = (1_766_700_000_000_i64, 1_769_900_000_000_i64);
            let chunks = partition_range(a, b, n);

            assert_eq!(chunks.len(), n);
            assert_eq!(chunks[0].start_ts, a, "n={n}");
            assert_eq!(chunks[n - 1].end_ts, b + 1, "n={n}");
            for pair in chunks.windows(2) {
                assert_eq!(pair[0].end_ts, pair[1].start_ts, "n={n}");
                assert!(pair[0].start_ts < pair[0].end_ts, "n={n}");
            }
        }
    }

    #[test]
    fn single_chunk_spans_the_whole_range() {
        let chunks = partition_range(100, 200, 1);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].start_ts, 100);
        assert_eq!(chunks[0].end_ts, 201);
    }

    #[test]
    fn uneven_division_still_covers_every_timestamp() {
        let chunks = partition_range(0, 10, 3);
        assert_eq!(chunks[0].start_ts, 0);
        assert_eq!(chunks[2].end_ts, 11);
        // Every integer timestamp in [0, 10] belongs to exactly one chunk.
        for ts in 0..=10 {
            let owners = chunks
                .iter()
                .filter(|c| c.start_ts <= ts && ts < c.end_ts)
                .count();
            assert_eq!(owners, 1, "ts={ts}");
        }
    }

    #[test]
    fn zero_partitions_clamp_to_one() {
        let chunks = partition_range(0, 10, 0);
        assert_eq!(chunks.len(), 1);
    }
}

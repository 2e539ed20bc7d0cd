/// Sender parallelism and receiver slice assignment for the hash exchange
use crate::config::ExchangeOptions;
use std::ops::Range;

/// Worker count the cost estimate asks for
///
/// `round((cost / slice_target) / receivers / thread_factor)`, at least 1 and
/// at most `max_sender_threads`. A positive `imposed_sender_threads` replaces
/// the estimate.
pub fn desired_sender_threads(cost: f64, receivers: usize, options: &ExchangeOptions) -> usize {
    if options.imposed_sender_threads > 0 {
        return options.imposed_sender_threads;
    }
    let slice_target = options.slice_target.max(1) as f64;
    let thread_factor = options.thread_factor.max(1) as f64;
    let receivers = receivers.max(1) as f64;
    let estimate = ((cost.max(0.0) / slice_target) / receivers / thread_factor).round() as usize;
    estimate.max(1).min(options.max_sender_threads.max(1))
}

/// Never more workers than receivers
pub fn actual_sender_threads(desired: usize, receivers: usize) -> usize {
    desired.min(receivers).max(1)
}

/// Contiguous receiver ranges, one per worker
///
/// Each worker gets `receivers / workers` receivers; the first
/// `receivers % workers` workers take one extra.
pub fn slice_ranges(receivers: usize, workers: usize) -> Vec<Range<usize>> {
    let workers = workers.clamp(1, receivers.max(1));
    let divisor = (receivers / workers).max(1);
    let long_tail = receivers % workers;
    let mut ranges = Vec::with_capacity(workers);
    let mut end = 0;
    for i in 0..workers {
        let start = end;
        end = if i < workers - 1 { start + divisor } else { receivers };
        if i < long_tail && i < workers - 1 {
            end += 1;
        }
        ranges.push(start..end);
    }
    ranges
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(slice_target: u64, thread_factor: u32, max: usize) -> ExchangeOptions {
        ExchangeOptions {
            slice_target,
            thread_factor,
            max_sender_threads: max,
            imposed_sender_threads: 0,
            outgoing_batch_size: 1024,
        }
    }

    #[test]
    fn test_small_cost_uses_one_worker() {
        // round((5000 / 1000) / 4 / 2) = round(0.625) = 1
        let opts = options(1000, 2, 8);
        let desired = desired_sender_threads(5000.0, 4, &opts);
        assert_eq!(desired, 1);
        let actual = actual_sender_threads(desired, 4);
        assert_eq!(actual, 1);
        assert_eq!(slice_ranges(4, actual), vec![0..4]);
    }

    #[test]
    fn test_cap_and_override() {
        let opts = options(1000, 1, 3);
        assert_eq!(desired_sender_threads(1_000_000.0, 4, &opts), 3);

        let mut forced = opts.clone();
        forced.imposed_sender_threads = 6;
        assert_eq!(desired_sender_threads(10.0, 4, &forced), 6);
        assert_eq!(actual_sender_threads(6, 4), 4);
    }

    #[test]
    fn test_long_tail_goes_to_first_workers() {
        assert_eq!(slice_ranges(10, 4), vec![0..3, 3..6, 6..8, 8..10]);
        assert_eq!(slice_ranges(3, 3), vec![0..1, 1..2, 2..3]);
        assert_eq!(slice_ranges(7, 2), vec![0..4, 4..7]);
    }

    #[test]
    fn test_slices_cover_every_receiver_once() {
        for receivers in 1..40 {
            for workers in 1..=receivers {
                let ranges = slice_ranges(receivers, workers);
                assert_eq!(ranges.len(), workers);
                let covered: Vec<usize> = ranges.into_iter().flatten().collect();
                assert_eq!(covered, (0..receivers).collect::<Vec<_>>());
            }
        }
    }
}

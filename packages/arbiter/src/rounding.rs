//! FairShare-Arbiter: Largest-Remainder Integer Rounding
//!
//! Both solvers produce continuous allocations from a concave problem and
//! need integers out. Largest-remainder rounding keeps the total exact,
//! preserves every agent's [minimum, ideal] box, and breaks ties
//! deterministically (fractional parts scaled to integers, then lower
//! index first).

/// Round a continuous allocation to integers summing to the continuous
/// total, each within `[minimums[i], ideals[i]]`.
///
/// Floors are clamped into the box first; leftover units go to the largest
/// fractional parts (descending, ties by lower index), and any
/// over-allocation introduced by clamping is removed from the agents with
/// the largest slack above minimum.
pub fn largest_remainder(continuous: &[f64], minimums: &[u64], ideals: &[u64]) -> Vec<u64> {
    debug_assert_eq!(continuous.len(), minimums.len());
    debug_assert_eq!(continuous.len(), ideals.len());

    let n = continuous.len();
    if n == 0 {
        return Vec::new();
    }

    let target: i128 = continuous.iter().sum::<f64>().round() as i128;

    let mut alloc: Vec<u64> = Vec::with_capacity(n);
    for i in 0..n {
        let floored = continuous[i].max(0.0).floor() as u64;
        alloc.push(floored.clamp(minimums[i], ideals[i]));
    }

    let mut diff = target - alloc.iter().map(|&a| a as i128).sum::<i128>();

    if diff > 0 {
        // Scaled fractional parts give a stable integer sort key.
        let mut order: Vec<(i64, usize)> = (0..n)
            .map(|i| {
                let frac = (continuous[i].max(0.0).fract() * 10_000.0) as i64;
                (-frac, i)
            })
            .collect();
        order.sort();

        while diff > 0 {
            let mut progressed = false;
            for &(_, i) in &order {
                if diff == 0 {
                    break;
                }
                if alloc[i] < ideals[i] {
                    alloc[i] += 1;
                    diff -= 1;
                    progressed = true;
                }
            }
            if !progressed {
                break;
            }
        }
    } else if diff < 0 {
        while diff < 0 {
            // Largest slack above minimum gives a unit back first.
            let candidate = (0..n)
                .filter(|&i| alloc[i] > minimums[i])
                .max_by_key(|&i| (alloc[i] - minimums[i], std::cmp::Reverse(i)));
            match candidate {
                Some(i) => {
                    alloc[i] -= 1;
                    diff += 1;
                }
                None => break,
            }
        }
    }

    alloc
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_integers_pass_through() {
        let out = largest_remainder(&[55.0, 45.0], &[40, 30], &[80, 70]);
        assert_eq!(out, vec![55, 45]);
    }

    #[test]
    fn test_fractional_units_go_to_largest_remainder() {
        let out = largest_remainder(&[65.714, 34.286], &[40, 30], &[80, 70]);
        assert_eq!(out, vec![66, 34]);
    }

    #[test]
    fn test_tie_breaks_by_lower_index() {
        let out = largest_remainder(&[10.5, 10.5], &[0, 0], &[20, 20]);
        assert_eq!(out, vec![11, 10]);
    }

    #[test]
    fn test_total_is_preserved() {
        let continuous = [12.3, 7.9, 4.8];
        let out = largest_remainder(&continuous, &[0, 0, 0], &[100, 100, 100]);
        assert_eq!(out.iter().sum::<u64>(), 25);
    }

    #[test]
    fn test_minimums_never_violated() {
        // Clamping up to minimums over-allocates; removal must respect
        // minimums and come from the largest slack first.
        let out = largest_remainder(&[3.0, 9.0], &[5, 0], &[10, 10]);
        assert_eq!(out.iter().sum::<u64>(), 12);
        assert!(out[0] >= 5);
    }

    #[test]
    fn test_ideals_never_exceeded() {
        let out = largest_remainder(&[9.6, 9.6], &[0, 0], &[10, 10]);
        assert!(out[0] <= 10 && out[1] <= 10);
        assert_eq!(out.iter().sum::<u64>(), 19);
    }

    #[test]
    fn test_empty_input() {
        assert!(largest_remainder(&[], &[], &[]).is_empty());
    }
}

use chrono::{DateTime, Utc};
use std::cmp::Ordering;
use std::time::Duration;

const SECONDS_PER_DAY: f64 = 86_400.0;

/// Below this uptime a clock that is behind the manifest date is assumed to
/// be not yet NTP-synced.
pub const CLOCK_SYNC_GRACE: Duration = Duration::from_secs(600);

/// Probability that this node accepts an update announced at `announced`
/// with a staged rollout of `priority_days`.
pub fn acceptance_probability(
  announced: DateTime<Utc>,
  priority_days: f64,
  fallback: bool,
  now: DateTime<Utc>,
  uptime: Duration,
) -> f64 {
  let window = priority_days * SECONDS_PER_DAY;
  let diff = (now - announced).num_milliseconds() as f64 / 1000.0;

  if diff < 0.0 {
    tracing::warn!(
      announced = %announced,
      now = %now,
      "clock seems to be incorrect"
    );
    if uptime < CLOCK_SYNC_GRACE {
      return 0.0;
    }
    // Legacy static scheme: 1 at priority 0, shrinking as priority grows.
    return 0.75f64.powf(priority_days).clamp(0.0, 1.0);
  }

  if fallback {
    return if diff >= window + SECONDS_PER_DAY { 1.0 } else { 0.0 };
  }

  if diff >= window {
    return 1.0;
  }

  let x = diff / window;
  3.0 * x * x - 2.0 * x * x * x
}

/// Bernoulli draw against [`acceptance_probability`]. `draw` must be
/// uniform in `[0, 1)`.
pub fn accept_update(force: bool, probability: f64, draw: f64) -> bool {
  force || draw < probability
}

/// Returns true if `candidate` sorts strictly after `current` in the
/// firmware version order.
pub fn version_is_newer(candidate: &str, current: &str) -> bool {
  compare_versions(candidate, current) == Ordering::Greater
}

/// Debian-style version ordering.
///
/// Strings are split into alternating non-digit and digit runs. Non-digit
/// runs compare per character (letters before other symbols, `~` before
/// anything including the end of the run); digit runs compare numerically
/// with leading zeros ignored.
pub fn compare_versions(a: &str, b: &str) -> Ordering {
  let a = a.as_bytes();
  let b = b.as_bytes();
  let (mut i, mut j) = (0usize, 0usize);

  while i < a.len() || j < b.len() {
    while (i < a.len() && !a[i].is_ascii_digit()) || (j < b.len() && !b[j].is_ascii_digit()) {
      let ac = char_order(a.get(i).copied());
      let bc = char_order(b.get(j).copied());
      if ac != bc {
        return ac.cmp(&bc);
      }
      i += 1;
      j += 1;
    }

    while i < a.len() && a[i] == b'0' {
      i += 1;
    }
    while j < b.len() && b[j] == b'0' {
      j += 1;
    }

    let mut first_diff = Ordering::Equal;
    while i < a.len() && j < b.len() && a[i].is_ascii_digit() && b[j].is_ascii_digit() {
      if first_diff == Ordering::Equal {
        first_diff = a[i].cmp(&b[j]);
      }
      i += 1;
      j += 1;
    }

    let a_more = i < a.len() && a[i].is_ascii_digit();
    let b_more = j < b.len() && b[j].is_ascii_digit();
    if a_more {
      return Ordering::Greater;
    }
    if b_more {
      return Ordering::Less;
    }
    if first_diff != Ordering::Equal {
      return first_diff;
    }
  }

  Ordering::Equal
}

fn char_order(c: Option<u8>) -> i32 {
  match c {
    None => 0,
    Some(c) if c.is_ascii_digit() => 0,
    Some(c) if c.is_ascii_alphabetic() => c as i32,
    Some(b'~') => -1,
    Some(c) => c as i32 + 256,
  }
}

//! Tool-pocket snapshot reconciliation.
//!
//! Diffs the pocket snapshots captured at machine-cycle start and end into
//! per-tool usage records. Pure function, no I/O.

use std::collections::BTreeMap;

use chrono::Duration;

use crate::types::{ToolSnapshot, ToolUse};

/// Remaining life of a pocket at snapshot time, floored at zero.
fn remaining_life(snap: &ToolSnapshot) -> Duration {
    let left = snap.tool_life - snap.current_use;
    if left < Duration::zero() {
        Duration::zero()
    } else {
        left
    }
}

fn accumulate(
    out: &mut BTreeMap<String, ToolUse>,
    tool: &str,
    use_during: Duration,
    total_at_end: Duration,
    life: Duration,
    changed: bool,
) {
    let entry = out.entry(tool.to_string()).or_insert_with(|| ToolUse {
        use_during_cycle: Duration::zero(),
        total_use_at_end_of_cycle: Duration::zero(),
        configured_life: Duration::zero(),
        tool_change_occurred: false,
    });
    entry.use_during_cycle = entry.use_during_cycle + use_during;
    entry.total_use_at_end_of_cycle = entry.total_use_at_end_of_cycle + total_at_end;
    if life > entry.configured_life {
        entry.configured_life = life;
    }
    entry.tool_change_occurred |= changed;
}

/// Diff the start and end snapshots of one machine cycle into per-tool
/// usage. Pockets are paired by `(pocket, tool)`; multiple pockets carrying
/// the same tool accumulate into one record.
pub fn diff_snapshots(start: &[ToolSnapshot], end: &[ToolSnapshot]) -> BTreeMap<String, ToolUse> {
    let mut out = BTreeMap::new();

    for e in end {
        match start
            .iter()
            .find(|s| s.pocket == e.pocket && s.tool == e.tool)
        {
            Some(s) if s.current_use < e.current_use => {
                // Normal consumption
                accumulate(
                    &mut out,
                    &e.tool,
                    e.current_use - s.current_use,
                    e.current_use,
                    e.tool_life,
                    false,
                );
            }
            Some(s) => {
                // Use counter went down or stalled: tool changed mid-cycle.
                // Charge the life that was left before the change plus the
                // fresh use after it.
                accumulate(
                    &mut out,
                    &e.tool,
                    remaining_life(s) + e.current_use,
                    e.current_use,
                    e.tool_life,
                    true,
                );
            }
            None => {
                // New pocket appeared mid-cycle
                if e.current_use > Duration::zero() {
                    accumulate(&mut out, &e.tool, e.current_use, e.current_use, e.tool_life, false);
                }
            }
        }
    }

    for s in start {
        let still_present = end.iter().any(|e| e.pocket == s.pocket && e.tool == s.tool);
        if !still_present {
            // Pocket vanished: assume the tool ran to failure
            accumulate(
                &mut out,
                &s.tool,
                remaining_life(s),
                Duration::zero(),
                s.tool_life,
                true,
            );
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snap(pocket: i32, tool: &str, use_min: i64, life_min: i64) -> ToolSnapshot {
        ToolSnapshot {
            pocket,
            tool: tool.to_string(),
            current_use: Duration::minutes(use_min),
            tool_life: Duration::minutes(life_min),
        }
    }

    #[test]
    fn test_normal_consumption() {
        let diff = diff_snapshots(&[snap(1, "T1", 10, 100)], &[snap(1, "T1", 40, 100)]);
        let t1 = diff.get("T1").unwrap();
        assert_eq!(t1.use_during_cycle, Duration::minutes(30));
        assert_eq!(t1.total_use_at_end_of_cycle, Duration::minutes(40));
        assert!(!t1.tool_change_occurred);
    }

    #[test]
    fn test_counter_reset_means_tool_change() {
        let diff = diff_snapshots(&[snap(1, "T1", 10, 100)], &[snap(1, "T1", 5, 100)]);
        let t1 = diff.get("T1").unwrap();
        // Remaining life before the change (90) plus fresh use after (5)
        assert_eq!(t1.use_during_cycle, Duration::minutes(95));
        assert!(t1.tool_change_occurred);
    }

    #[test]
    fn test_new_pocket_charges_full_use() {
        let diff = diff_snapshots(&[], &[snap(2, "T5", 12, 60)]);
        let t5 = diff.get("T5").unwrap();
        assert_eq!(t5.use_during_cycle, Duration::minutes(12));
        assert!(!t5.tool_change_occurred);
    }

    #[test]
    fn test_new_pocket_with_zero_use_is_ignored() {
        let diff = diff_snapshots(&[], &[snap(2, "T5", 0, 60)]);
        assert!(diff.is_empty());
    }

    #[test]
    fn test_missing_pocket_charged_to_failure() {
        let diff = diff_snapshots(&[snap(1, "T1", 70, 100)], &[]);
        let t1 = diff.get("T1").unwrap();
        assert_eq!(t1.use_during_cycle, Duration::minutes(30));
        assert!(t1.tool_change_occurred);
    }

    #[test]
    fn test_same_tool_in_two_pockets_accumulates() {
        let diff = diff_snapshots(
            &[snap(1, "T1", 10, 100), snap(2, "T1", 20, 100)],
            &[snap(1, "T1", 15, 100), snap(2, "T1", 30, 100)],
        );
        assert_eq!(diff.len(), 1);
        let t1 = diff.get("T1").unwrap();
        assert_eq!(t1.use_during_cycle, Duration::minutes(15));
        assert_eq!(t1.total_use_at_end_of_cycle, Duration::minutes(45));
    }

    #[test]
    fn test_overused_start_clamps_remaining_life() {
        // Already past configured life at cycle start, then replaced
        let diff = diff_snapshots(&[snap(1, "T1", 120, 100)], &[snap(1, "T1", 5, 100)]);
        let t1 = diff.get("T1").unwrap();
        assert_eq!(t1.use_during_cycle, Duration::minutes(5));
        assert!(t1.tool_change_occurred);
    }
}

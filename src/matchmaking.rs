//! Elo-banded matchmaking queues with wait-based widening.
//!
//! Each category keeps an ordered list of seekers. A periodic tick widens
//! every seeker's acceptable Elo window as they wait (±200 at first, ±400
//! after 30s, anyone after 60s) and then scans for the first mutually
//! acceptable pair in insertion order, so older seekers tend to match
//! first. Because widening expands both windows, any sufficiently patient
//! pair eventually becomes matchable.

use crate::elo::elo_band;
use crate::types::{Category, EloBand};
use std::collections::HashMap;
use std::time::Instant;

/// Seconds of waiting before the first widening step.
const WIDEN_1_AFTER: f64 = 30.0;

/// Seconds of waiting before the window opens completely.
const WIDEN_2_AFTER: f64 = 60.0;

/// Matchmaking status of a queued seeker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekStatus {
    /// Fresh in the queue, window ±200.
    Searching,
    /// Waited 30s, window ±400.
    Widening1,
    /// Waited 60s, any opponent accepted.
    Widening2,
    Matched,
    Cancelled,
}

impl SeekStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SeekStatus::Searching => "searching",
            SeekStatus::Widening1 => "widening_1",
            SeekStatus::Widening2 => "widening_2",
            SeekStatus::Matched => "matched",
            SeekStatus::Cancelled => "cancelled",
        }
    }
}

/// One agent waiting for an opponent in one category.
#[derive(Debug, Clone)]
pub struct Seeker {
    pub agent_id: String,
    pub agent_name: String,
    /// Category Elo at the time of the seek.
    pub elo: i64,
    pub category: Category,
    pub band: EloBand,
    pub status: SeekStatus,
    queued_at: Instant,
    /// 1-indexed queue position at insert time; reported once, never
    /// re-reported as others leave.
    pub position: usize,
}

impl Seeker {
    /// The currently acceptable opponent-Elo window.
    pub fn elo_range(&self) -> (i64, i64) {
        match self.status {
            SeekStatus::Searching => (self.elo - 200, self.elo + 200),
            SeekStatus::Widening1 => (self.elo - 400, self.elo + 400),
            _ => (0, 9999),
        }
    }

    /// Seconds spent waiting in the queue.
    pub fn wait_time(&self) -> f64 {
        self.queued_at.elapsed().as_secs_f64()
    }
}

/// A matched pair, removed from the queue and ready for game creation.
#[derive(Debug)]
pub struct MatchPair {
    pub seeker1: Seeker,
    pub seeker2: Seeker,
    pub category: Category,
}

/// Notification that a seeker's window widened this tick.
#[derive(Debug)]
pub struct WidenNotice {
    pub agent_id: String,
    pub category: Category,
    pub elo_range: (i64, i64),
}

/// Matchmaking queues for all categories.
#[derive(Debug)]
pub struct MatchQueue {
    queues: HashMap<Category, Vec<Seeker>>,
}

impl Default for MatchQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl MatchQueue {
    pub fn new() -> Self {
        let mut queues = HashMap::new();
        for category in Category::ALL {
            queues.insert(category, Vec::new());
        }
        Self { queues }
    }

    /// Adds a seeker and returns its queue position and initial window.
    ///
    /// Callers must reject duplicate (agent, category) seeks beforehand;
    /// see [`MatchQueue::is_seeking`].
    pub fn add_seeker(
        &mut self,
        agent_id: &str,
        agent_name: &str,
        elo: i64,
        category: Category,
    ) -> (usize, (i64, i64)) {
        let queue = self.queues.get_mut(&category).expect("category queue exists");
        let seeker = Seeker {
            agent_id: agent_id.to_string(),
            agent_name: agent_name.to_string(),
            elo,
            category,
            band: elo_band(elo),
            status: SeekStatus::Searching,
            queued_at: Instant::now(),
            position: queue.len() + 1,
        };
        let result = (seeker.position, seeker.elo_range());
        queue.push(seeker);
        result
    }

    /// Removes an agent from one category's queue. Returns whether a
    /// seeker was actually removed.
    pub fn remove_seeker(&mut self, agent_id: &str, category: Category) -> bool {
        let queue = self.queues.get_mut(&category).expect("category queue exists");
        let before = queue.len();
        queue.retain_mut(|s| {
            if s.agent_id == agent_id {
                s.status = SeekStatus::Cancelled;
                false
            } else {
                true
            }
        });
        queue.len() != before
    }

    /// Removes an agent from every queue (cancel-all on disconnect or
    /// match found).
    pub fn remove_all_seeks(&mut self, agent_id: &str) {
        for queue in self.queues.values_mut() {
            queue.retain_mut(|s| {
                if s.agent_id == agent_id {
                    s.status = SeekStatus::Cancelled;
                    false
                } else {
                    true
                }
            });
        }
    }

    /// Whether an agent is queued in a category.
    pub fn is_seeking(&self, agent_id: &str, category: Category) -> bool {
        self.queues[&category].iter().any(|s| s.agent_id == agent_id)
    }

    /// One matchmaking pass over all categories: widen windows by wait
    /// time, then greedily pair mutually acceptable seekers in insertion
    /// order. Matched seekers are removed and returned.
    pub fn tick(&mut self) -> (Vec<WidenNotice>, Vec<MatchPair>) {
        let mut notices = Vec::new();
        let mut pairs = Vec::new();

        for category in Category::ALL {
            let queue = self.queues.get_mut(&category).expect("category queue exists");

            // Step 1: widen by wait time, notifying on every transition.
            for seeker in queue.iter_mut() {
                let wait = seeker.wait_time();
                let old = seeker.status;
                if wait >= WIDEN_2_AFTER && seeker.status != SeekStatus::Widening2 {
                    seeker.status = SeekStatus::Widening2;
                } else if wait >= WIDEN_1_AFTER && seeker.status == SeekStatus::Searching {
                    seeker.status = SeekStatus::Widening1;
                }
                if seeker.status != old {
                    notices.push(WidenNotice {
                        agent_id: seeker.agent_id.clone(),
                        category,
                        elo_range: seeker.elo_range(),
                    });
                }
            }

            if queue.len() < 2 {
                continue;
            }

            // Step 2: greedy first-fit scan over ordered pairs (i, j).
            let mut matched_pairs = Vec::new();
            let mut taken = vec![false; queue.len()];
            for i in 0..queue.len() {
                if taken[i] {
                    continue;
                }
                for j in (i + 1)..queue.len() {
                    if taken[j] {
                        continue;
                    }
                    if can_match(&queue[i], &queue[j]) {
                        taken[i] = true;
                        taken[j] = true;
                        matched_pairs.push((i, j));
                        break;
                    }
                }
            }

            // Pull the matched seekers out while keeping the remaining
            // queue in insertion order.
            if !matched_pairs.is_empty() {
                let mut slots: Vec<Option<Seeker>> = queue.drain(..).map(Some).collect();
                for (i, j) in matched_pairs {
                    let mut seeker1 = slots[i].take().expect("matched slot taken once");
                    let mut seeker2 = slots[j].take().expect("matched slot taken once");
                    seeker1.status = SeekStatus::Matched;
                    seeker2.status = SeekStatus::Matched;
                    pairs.push(MatchPair { seeker1, seeker2, category });
                }
                queue.extend(slots.into_iter().flatten());
            }
        }

        (notices, pairs)
    }

    /// Snapshot of every queue for the stats projection.
    pub fn stats(&self) -> serde_json::Value {
        let mut out = serde_json::Map::new();
        for category in Category::ALL {
            let queue = &self.queues[&category];
            let seekers: Vec<serde_json::Value> = queue
                .iter()
                .map(|s| {
                    serde_json::json!({
                        "agent_name": s.agent_name,
                        "elo": s.elo,
                        "band": s.band.as_str(),
                        "status": s.status.as_str(),
                        "wait_time": (s.wait_time() * 10.0).round() / 10.0,
                    })
                })
                .collect();
            out.insert(
                category.as_str().to_string(),
                serde_json::json!({ "count": queue.len(), "seekers": seekers }),
            );
        }
        serde_json::Value::Object(out)
    }
}

/// Mutual acceptance: different agents, and each seeker's current window
/// contains the other's Elo.
fn can_match(a: &Seeker, b: &Seeker) -> bool {
    if a.agent_id == b.agent_id {
        return false;
    }
    let range_a = a.elo_range();
    let range_b = b.elo_range();
    range_a.0 <= b.elo && b.elo <= range_a.1 && range_b.0 <= a.elo && a.elo <= range_b.1
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    /// Rewinds a seeker's queue entry time so widening thresholds fire
    /// without real waiting.
    fn rewind(queue: &mut MatchQueue, agent_id: &str, category: Category, secs: u64) {
        for seeker in queue.queues.get_mut(&category).unwrap().iter_mut() {
            if seeker.agent_id == agent_id {
                seeker.queued_at = Instant::now() - Duration::from_secs(secs);
            }
        }
    }

    #[test]
    fn test_positions_are_insert_order() {
        let mut queue = MatchQueue::new();
        let (pos1, range) = queue.add_seeker("a1", "Alpha", 1200, Category::Bullet);
        let (pos2, _) = queue.add_seeker("a2", "Beta", 2000, Category::Bullet);
        assert_eq!(pos1, 1);
        assert_eq!(pos2, 2);
        assert_eq!(range, (1000, 1400));
    }

    #[test]
    fn test_close_elos_match_immediately() {
        let mut queue = MatchQueue::new();
        queue.add_seeker("a1", "Alpha", 1200, Category::Bullet);
        queue.add_seeker("a2", "Beta", 1210, Category::Bullet);
        let (_, pairs) = queue.tick();
        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0].category, Category::Bullet);
        assert!(!queue.is_seeking("a1", Category::Bullet));
        assert!(!queue.is_seeking("a2", Category::Bullet));
    }

    #[test]
    fn test_distant_elos_do_not_match_at_first() {
        let mut queue = MatchQueue::new();
        queue.add_seeker("a1", "Alpha", 900, Category::Blitz);
        queue.add_seeker("a2", "Beta", 1300, Category::Blitz);
        let (notices, pairs) = queue.tick();
        assert!(notices.is_empty());
        assert!(pairs.is_empty());
    }

    #[test]
    fn test_widening_after_thirty_seconds_pairs_900_and_1300() {
        let mut queue = MatchQueue::new();
        queue.add_seeker("a1", "Alpha", 900, Category::Blitz);
        queue.add_seeker("a2", "Beta", 1300, Category::Blitz);
        rewind(&mut queue, "a1", Category::Blitz, 31);
        rewind(&mut queue, "a2", Category::Blitz, 31);
        let (notices, pairs) = queue.tick();
        // Both widened to ±400 and both windows now contain the other.
        assert_eq!(notices.len(), 2);
        assert_eq!(notices[0].elo_range, (500, 1300));
        assert_eq!(pairs.len(), 1);
    }

    #[test]
    fn test_widening_must_be_mutual() {
        let mut queue = MatchQueue::new();
        queue.add_seeker("a1", "Alpha", 900, Category::Blitz);
        queue.add_seeker("a2", "Beta", 1500, Category::Blitz);

        // Alpha fully widened, Beta at ±400: Beta's window (1100..1900)
        // still excludes Alpha, so no match yet.
        rewind(&mut queue, "a1", Category::Blitz, 61);
        rewind(&mut queue, "a2", Category::Blitz, 31);
        let (_, pairs) = queue.tick();
        assert!(pairs.is_empty());

        // Once Beta is fully widened too, they pair up.
        rewind(&mut queue, "a2", Category::Blitz, 61);
        let (_, pairs) = queue.tick();
        assert_eq!(pairs.len(), 1);
    }

    #[test]
    fn test_widening_boundary_is_exact() {
        let mut queue = MatchQueue::new();
        queue.add_seeker("a1", "Alpha", 1200, Category::Rapid);
        queue.add_seeker("a2", "Beta", 2400, Category::Rapid);

        rewind(&mut queue, "a1", Category::Rapid, 29);
        let (notices, _) = queue.tick();
        assert!(notices.is_empty());

        rewind(&mut queue, "a1", Category::Rapid, 30);
        let (notices, _) = queue.tick();
        assert_eq!(notices.len(), 1);
        assert_eq!(notices[0].elo_range, (800, 1600));

        rewind(&mut queue, "a1", Category::Rapid, 60);
        let (notices, _) = queue.tick();
        assert_eq!(notices.len(), 1);
        assert_eq!(notices[0].elo_range, (0, 9999));
    }

    #[test]
    fn test_fifo_fairness_in_pair_scan() {
        let mut queue = MatchQueue::new();
        queue.add_seeker("old", "Old", 1200, Category::Bullet);
        queue.add_seeker("mid", "Mid", 1205, Category::Bullet);
        queue.add_seeker("new", "New", 1210, Category::Bullet);
        let (_, pairs) = queue.tick();
        // The oldest seeker matches first, with the earliest acceptable
        // partner; the third stays queued.
        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0].seeker1.agent_id, "old");
        assert_eq!(pairs[0].seeker2.agent_id, "mid");
        assert!(queue.is_seeking("new", Category::Bullet));
    }

    #[test]
    fn test_remove_and_remove_all() {
        let mut queue = MatchQueue::new();
        queue.add_seeker("a1", "Alpha", 1200, Category::Bullet);
        queue.add_seeker("a1", "Alpha", 1200, Category::Blitz);
        assert!(queue.remove_seeker("a1", Category::Bullet));
        assert!(!queue.remove_seeker("a1", Category::Bullet));
        assert!(queue.is_seeking("a1", Category::Blitz));
        queue.remove_all_seeks("a1");
        assert!(!queue.is_seeking("a1", Category::Blitz));
    }

    #[test]
    fn test_categories_are_isolated() {
        let mut queue = MatchQueue::new();
        queue.add_seeker("a1", "Alpha", 1200, Category::Bullet);
        queue.add_seeker("a2", "Beta", 1200, Category::Rapid);
        let (_, pairs) = queue.tick();
        assert!(pairs.is_empty());
    }

    #[test]
    fn test_stats_snapshot() {
        let mut queue = MatchQueue::new();
        queue.add_seeker("a1", "Alpha", 950, Category::Bullet);
        let stats = queue.stats();
        assert_eq!(stats["bullet"]["count"], 1);
        assert_eq!(stats["bullet"]["seekers"][0]["band"], "bronze");
        assert_eq!(stats["bullet"]["seekers"][0]["status"], "searching");
        assert_eq!(stats["blitz"]["count"], 0);
    }
}

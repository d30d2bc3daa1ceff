//! Goal prioritization (pipeline stage 3).
//!
//! Grounded on the source's `goal_manager.py`: every active goal gets a
//! weighted priority score; goals are returned sorted descending.

use crate::types::Goal;

/// Returns `goals` sorted descending by [`Goal::priority_score`].
pub fn prioritize_goals(goals: &[Goal]) -> Vec<&Goal> {
    let mut ranked: Vec<&Goal> = goals.iter().collect();
    ranked.sort_by(|a, b| {
        b.priority_score()
            .partial_cmp(&a.priority_score())
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    ranked
}

#[cfg(test)]
mod tests {
    use super::*;

    fn goal(id: &str, urgency: f64, importance: f64) -> Goal {
        Goal {
            id: id.to_string(),
            description: id.to_string(),
            urgency,
            importance,
            feasibility: 0.5,
            alignment: 0.5,
            opportunity: 0.5,
        }
    }

    #[test]
    fn sorts_descending_by_priority_score() {
        let goals = vec![goal("low", 0.1, 0.1), goal("high", 0.9, 0.9)];
        let ranked = prioritize_goals(&goals);
        assert_eq!(ranked[0].id, "high");
        assert_eq!(ranked[1].id, "low");
    }
}

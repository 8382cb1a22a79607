use serde::{Deserialize, Serialize};

/// Liveness of a device or pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Alive {
    Well,
    Sick,
    Dead,
    /// Never initialised successfully. Devices only.
    NoStart,
}

impl std::fmt::Display for Alive {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Alive::Well => write!(f, "Alive"),
            Alive::Sick => write!(f, "Sick"),
            Alive::Dead => write!(f, "Dead"),
            Alive::NoStart => write!(f, "NoStart"),
        }
    }
}

/// Consecutive-failure state machine.
///
/// `NoStart` only leaves on a success; failures while in it are counted but
/// never promote it to `Sick`/`Dead`. From `Well`, `sick_after` consecutive
/// failures give `Sick` and `dead_after` give `Dead`. Any success returns to
/// `Well`.
#[derive(Debug, Clone)]
pub struct HealthTracker {
    state: Alive,
    consecutive_failures: u32,
    sick_after: u32,
    dead_after: u32,
}

impl HealthTracker {
    pub fn new(initial: Alive, sick_after: u32, dead_after: u32) -> Self {
        let sick_after = sick_after.max(1);
        Self {
            state: initial,
            consecutive_failures: 0,
            sick_after,
            dead_after: dead_after.max(sick_after),
        }
    }

    pub fn state(&self) -> Alive {
        self.state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Returns the previous state if this success changed it.
    pub fn record_success(&mut self) -> Option<Alive> {
        self.consecutive_failures = 0;
        let prev = self.state;
        self.state = Alive::Well;
        (prev != Alive::Well).then_some(prev)
    }

    /// Returns the new state if this failure changed it.
    pub fn record_failure(&mut self) -> Option<Alive> {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        if self.state == Alive::NoStart {
            return None;
        }
        let next = if self.consecutive_failures >= self.dead_after {
            Alive::Dead
        } else if self.consecutive_failures >= self.sick_after {
            Alive::Sick
        } else {
            self.state
        };
        if next != self.state {
            self.state = next;
            Some(next)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn well_degrades_to_sick_then_dead() {
        let mut h = HealthTracker::new(Alive::Well, 2, 4);
        assert_eq!(h.record_failure(), None);
        assert_eq!(h.record_failure(), Some(Alive::Sick));
        assert_eq!(h.record_failure(), None);
        assert_eq!(h.record_failure(), Some(Alive::Dead));
        assert_eq!(h.record_failure(), None);
        assert_eq!(h.state(), Alive::Dead);
    }

    #[test]
    fn success_resets_from_any_state() {
        let mut h = HealthTracker::new(Alive::Well, 1, 2);
        h.record_failure();
        h.record_failure();
        assert_eq!(h.state(), Alive::Dead);
        assert_eq!(h.record_success(), Some(Alive::Dead));
        assert_eq!(h.state(), Alive::Well);
        assert_eq!(h.consecutive_failures(), 0);
        assert_eq!(h.record_success(), None);
    }

    #[test]
    fn nostart_only_leaves_on_success() {
        let mut h = HealthTracker::new(Alive::NoStart, 1, 2);
        for _ in 0..5 {
            assert_eq!(h.record_failure(), None);
        }
        assert_eq!(h.state(), Alive::NoStart);
        assert_eq!(h.record_success(), Some(Alive::NoStart));
        assert_eq!(h.state(), Alive::Well);
    }
}

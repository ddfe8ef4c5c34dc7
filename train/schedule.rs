//! Step-counter state machine for the adversary/main alternation.

/// Which update runs next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Adversary,
    Main,
}

/// Cycles through `adversary_steps` adversary updates followed by one main-model
/// update. With the adversary disabled (or zero adversary steps) every phase is `Main`.
#[derive(Debug, Clone)]
pub struct AlternationSchedule {
    adversary_steps: usize,
    position: usize,
    adversary_updates: u64,
    main_updates: u64,
}

impl AlternationSchedule {
    pub fn new(adversary_steps: usize, enabled: bool) -> Self {
        Self {
            adversary_steps: if enabled { adversary_steps } else { 0 },
            position: 0,
            adversary_updates: 0,
            main_updates: 0,
        }
    }

    /// The phase the next call to [`AlternationSchedule::advance`] will return.
    pub fn peek(&self) -> Phase {
        if self.position < self.adversary_steps {
            Phase::Adversary
        } else {
            Phase::Main
        }
    }

    pub fn advance(&mut self) -> Phase {
        let phase = self.peek();
        match phase {
            Phase::Adversary => {
                self.position += 1;
                self.adversary_updates += 1;
            }
            Phase::Main => {
                self.position = 0;
                self.main_updates += 1;
            }
        }
        phase
    }

    pub fn adversary_updates(&self) -> u64 {
        self.adversary_updates
    }

    pub fn main_updates(&self) -> u64 {
        self.main_updates
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn three_adversary_steps_per_main_step() {
        let mut schedule = AlternationSchedule::new(3, true);
        let phases: Vec<Phase> = (0..8).map(|_| schedule.advance()).collect();
        assert_eq!(
            phases,
            vec![
                Phase::Adversary,
                Phase::Adversary,
                Phase::Adversary,
                Phase::Main,
                Phase::Adversary,
                Phase::Adversary,
                Phase::Adversary,
                Phase::Main,
            ]
        );
        assert_eq!(schedule.adversary_updates(), 6);
        assert_eq!(schedule.main_updates(), 2);
    }

    #[test]
    fn disabled_adversary_only_runs_main_updates() {
        let mut schedule = AlternationSchedule::new(3, false);
        assert!((0..5).all(|_| schedule.advance() == Phase::Main));
        let mut zero = AlternationSchedule::new(0, true);
        assert_eq!(zero.peek(), Phase::Main);
        assert_eq!(zero.advance(), Phase::Main);
    }
}

//! Controller lifecycle state machine.

/// Phase of a controller run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    /// Constructed, not yet started.
    Idle,
    /// Main scheduling loop active.
    Running,
    /// Shutdown requested; letting current items finish, starting nothing.
    Draining,
    /// Worker crash detected; restarting the worker set.
    Recovering,
    /// Run complete, final report produced.
    Finished,
}

impl ControllerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ControllerState::Idle => "idle",
            ControllerState::Running => "running",
            ControllerState::Draining => "draining",
            ControllerState::Recovering => "recovering",
            ControllerState::Finished => "finished",
        }
    }

    /// Legal phase transitions. `Finished` is terminal; a new run means
    /// a new controller.
    pub fn can_transition_to(&self, to: ControllerState) -> bool {
        use ControllerState::*;
        matches!(
            (self, to),
            (Idle, Running)
                | (Running, Draining)
                | (Running, Recovering)
                | (Running, Finished)
                | (Recovering, Running)
                | (Recovering, Finished)
                | (Draining, Finished)
        )
    }
}

impl std::fmt::Display for ControllerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ControllerState::*;

    #[test]
    fn test_legal_transitions() {
        assert!(Idle.can_transition_to(Running));
        assert!(Running.can_transition_to(Draining));
        assert!(Running.can_transition_to(Recovering));
        assert!(Running.can_transition_to(Finished));
        assert!(Recovering.can_transition_to(Running));
        assert!(Recovering.can_transition_to(Finished));
        assert!(Draining.can_transition_to(Finished));
    }

    #[test]
    fn test_finished_is_terminal() {
        for to in [Idle, Running, Draining, Recovering] {
            assert!(!Finished.can_transition_to(to));
        }
    }

    #[test]
    fn test_no_restart_from_idle_paths() {
        assert!(!Idle.can_transition_to(Recovering));
        assert!(!Draining.can_transition_to(Running));
    }
}

//! 会话生命周期状态机
//!
//! Disconnected → Connecting → Negotiating → Ready → Closing → Closed；
//! Errored 可由任一非终止状态进入，且不再离开。

use std::fmt;

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Negotiating,
    Ready,
    Closing,
    Closed,
    Errored,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Closed | SessionState::Errored)
    }

    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        if self.is_terminal() {
            return false;
        }
        matches!(
            (self, next),
            (Disconnected, Connecting)
                | (Connecting, Negotiating)
                | (Negotiating, Ready)
                | (Connecting | Negotiating | Ready, Closing)
                | (Closing, Closed)
                | (_, Errored)
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::SessionState::*;

    #[test]
    fn test_happy_path() {
        let path = [Disconnected, Connecting, Negotiating, Ready, Closing, Closed];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn test_errored_reachable_from_non_terminal_only() {
        for s in [Disconnected, Connecting, Negotiating, Ready, Closing] {
            assert!(s.can_transition_to(Errored));
        }
        assert!(!Closed.can_transition_to(Errored));
        assert!(!Errored.can_transition_to(Errored));
    }

    #[test]
    fn test_errored_is_absorbing() {
        for s in [Disconnected, Connecting, Negotiating, Ready, Closing, Closed] {
            assert!(!Errored.can_transition_to(s));
        }
    }

    #[test]
    fn test_no_skipping_negotiation() {
        assert!(!Connecting.can_transition_to(Ready));
        assert!(!Disconnected.can_transition_to(Ready));
        assert!(!Ready.can_transition_to(Closed));
    }
}

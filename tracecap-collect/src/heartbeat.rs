//! Change-suppression state shared by every body-bearing `Collectable`
//! (scalar-struct, dense container, sparse container). `ScalarPrimitive`
//! does not use this: it always emits a full body.

#[derive(Debug)]
pub struct HeartbeatState {
    previous: Option<Vec<u8>>,
    carry_forward: u16,
    heartbeat: u16,
}

impl HeartbeatState {
    pub fn new(heartbeat: u16) -> Self {
        Self {
            previous: None,
            carry_forward: 0,
            heartbeat,
        }
    }

    /// Returns `true` when `current` should be suppressed in favor of a
    /// header-only "unchanged" frame; `false` when the caller must emit
    /// the full body. Updates internal state either way.
    pub fn should_suppress(&mut self, current: &[u8]) -> bool {
        let unchanged = self.previous.as_deref() == Some(current);
        if unchanged && self.carry_forward < self.heartbeat {
            self.carry_forward += 1;
            true
        } else {
            self.previous = Some(current.to_vec());
            self.carry_forward = 0;
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sixteen_ticks_unchanged_with_heartbeat_five_emits_full_at_1_7_13() {
        let mut state = HeartbeatState::new(5);
        let body = [0xABu8, 0xCD];
        let mut full_ticks = Vec::new();
        for tick in 1..=16 {
            if !state.should_suppress(&body) {
                full_ticks.push(tick);
            }
        }
        assert_eq!(full_ticks, vec![1, 7, 13]);
    }

    #[test]
    fn a_changed_body_always_forces_a_full_frame() {
        let mut state = HeartbeatState::new(5);
        assert!(!state.should_suppress(&[1]));
        assert!(state.should_suppress(&[1]));
        assert!(!state.should_suppress(&[2]));
    }
}

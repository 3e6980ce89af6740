//! Merges stall and silence into one alert flag.
use multiview_proto::protocol::{HealthState, SilenceState};

pub const STALLED_MESSAGE: &str = "stream stalled";
pub const SILENT_MESSAGE: &str = "audio silent";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertEdge {
    Raised(&'static str),
    Cleared,
}

/// Alert message for a tile, stall taking priority over silence.
pub fn alert_message(health: HealthState, silence: SilenceState) -> Option<&'static str> {
    if health == HealthState::Stalled {
        Some(STALLED_MESSAGE)
    } else if silence == SilenceState::Silent {
        Some(SILENT_MESSAGE)
    } else {
        None
    }
}

#[derive(Debug, Default)]
pub struct AlertAggregator {
    active: bool,
}

impl AlertAggregator {
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Recompute the alert; reports only boolean edges.
    pub fn update(&mut self, health: HealthState, silence: SilenceState) -> Option<AlertEdge> {
        let message = alert_message(health, silence);
        match (self.active, message) {
            (false, Some(msg)) => {
                self.active = true;
                Some(AlertEdge::Raised(msg))
            }
            (true, None) => {
                self.active = false;
                Some(AlertEdge::Cleared)
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn edges_only() {
        let mut a = AlertAggregator::default();
        assert_eq!(a.update(HealthState::Healthy, SilenceState::Sounding), None);
        assert_eq!(
            a.update(HealthState::Healthy, SilenceState::Silent),
            Some(AlertEdge::Raised(SILENT_MESSAGE))
        );
        // Stall on top of silence keeps the alarm as is.
        assert_eq!(a.update(HealthState::Stalled, SilenceState::Silent), None);
        assert_eq!(a.update(HealthState::Stalled, SilenceState::Sounding), None);
        assert_eq!(
            a.update(HealthState::Healthy, SilenceState::Sounding),
            Some(AlertEdge::Cleared)
        );
        assert!(!a.is_active());
    }

    #[test]
    fn stall_message_wins() {
        assert_eq!(
            alert_message(HealthState::Stalled, SilenceState::Silent),
            Some(STALLED_MESSAGE)
        );
        assert_eq!(alert_message(HealthState::Healthy, SilenceState::Sounding), None);
    }
}

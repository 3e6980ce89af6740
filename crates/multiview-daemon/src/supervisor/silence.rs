//! Sustained-silence detection over sampled spectrum frames.
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use multiview_proto::protocol::SilenceState;

use crate::transport::SpectrumFrame;

#[derive(Debug)]
pub struct SilenceDetector {
    threshold: f32,
    duration: Duration,
    frame_interval: Duration,
    silent_since: Option<Instant>,
    last_sample: Option<Instant>,
    state: SilenceState,
}

impl SilenceDetector {
    pub fn new(threshold: f32, duration: Duration, frame_interval: Duration) -> Self {
        Self {
            threshold,
            duration,
            frame_interval,
            silent_since: None,
            last_sample: None,
            state: SilenceState::Sounding,
        }
    }

    pub fn state(&self) -> SilenceState {
        self.state
    }

    /// Feed one analysis opportunity.  `active` is whether playback is in a
    /// state where audio is meaningful; a missing frame while active counts
    /// as silence.  Returns the new state on an edge only.
    pub fn sample(
        &mut self,
        frame: Option<&SpectrumFrame>,
        active: bool,
        now: Instant,
    ) -> Option<SilenceState> {
        if !active {
            self.silent_since = None;
            self.last_sample = None;
            return self.transition(SilenceState::Sounding);
        }

        if let Some(last) = self.last_sample {
            if now.duration_since(last) < self.frame_interval {
                return None;
            }
        }
        self.last_sample = Some(now);

        let loudness = frame.map(SpectrumFrame::loudness).unwrap_or(0.0);
        if loudness < self.threshold {
            let since = *self.silent_since.get_or_insert(now);
            if now.duration_since(since) >= self.duration {
                return self.transition(SilenceState::Silent);
            }
            None
        } else {
            self.silent_since = None;
            self.transition(SilenceState::Sounding)
        }
    }

    fn transition(&mut self, next: SilenceState) -> Option<SilenceState> {
        if self.state == next {
            return None;
        }
        debug!("silence: {:?} -> {:?}", self.state, next);
        self.state = next;
        Some(next)
    }
}

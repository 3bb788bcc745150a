//! Frame pacing

use std::time::{Duration, Instant};

/// Sleep this far short of the deadline, then spin the rest.
const SPIN_MARGIN: Duration = Duration::from_millis(1);

pub struct FrameRateController {
    target_frame_time: Duration,
    last_frame: Instant,
}

impl FrameRateController {
    pub fn new(target_fps: f32) -> Self {
        Self {
            target_frame_time: Self::frame_time_for(target_fps),
            last_frame: Instant::now(),
        }
    }

    fn frame_time_for(target_fps: f32) -> Duration {
        if target_fps > 0.0 {
            Duration::from_secs_f32(1.0 / target_fps)
        } else {
            Duration::ZERO
        }
    }

    /// `0` or less disables pacing.
    pub fn set_target_fps(&mut self, target_fps: f32) {
        self.target_frame_time = Self::frame_time_for(target_fps);
    }

    pub fn target_frame_time(&self) -> Duration {
        self.target_frame_time
    }

    /// Block until the next frame is due and return the seconds since the last one
    pub fn wait_for_next_frame(&mut self) -> f32 {
        let deadline = self.last_frame + self.target_frame_time;
        let now = Instant::now();
        if deadline > now + SPIN_MARGIN {
            std::thread::sleep(deadline - now - SPIN_MARGIN);
        }
        while Instant::now() < deadline {
            std::hint::spin_loop();
        }

        let now = Instant::now();
        let dt = now.duration_since(self.last_frame).as_secs_f32();
        self.last_frame = now;
        dt
    }
}

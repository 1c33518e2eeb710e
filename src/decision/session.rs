//! Session window arithmetic: tradable hours, blackout spans, and the
//! forced-flatten window before the close.

use crate::config::Config;

#[derive(Debug, Clone)]
pub struct SessionClock {
    open_min: u32,
    close_min: u32,
    flatten_before_close_min: u32,
    blackouts: Vec<(u32, u32)>,
}

impl SessionClock {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            open_min: cfg.session_open_min,
            close_min: cfg.session_close_min,
            flatten_before_close_min: cfg.flatten_before_close_min,
            blackouts: cfg.blackouts.clone(),
        }
    }

    pub fn minute_of_day(ts: u64) -> u32 {
        ((ts % 86_400) / 60) as u32
    }

    pub fn open_min(&self) -> u32 {
        self.open_min
    }

    pub fn close_min(&self) -> u32 {
        self.close_min
    }

    pub fn in_session(&self, ts: u64) -> bool {
        let m = Self::minute_of_day(ts);
        m >= self.open_min && m < self.close_min
    }

    pub fn in_blackout(&self, ts: u64) -> bool {
        let m = Self::minute_of_day(ts);
        self.blackouts.iter().any(|(start, end)| m >= *start && m < *end)
    }

    pub fn minutes_to_close(&self, ts: u64) -> u32 {
        let m = Self::minute_of_day(ts);
        self.close_min.saturating_sub(m)
    }

    /// True inside the pre-close window where any open position is flattened
    /// and no new entries are taken.
    pub fn in_flatten_window(&self, ts: u64) -> bool {
        self.in_session(ts) && self.minutes_to_close(ts) <= self.flatten_before_close_min
    }
}

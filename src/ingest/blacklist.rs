use std::str::FromStr;

use jiff::civil::Time;
use jiff::Zoned;

use crate::error::MastrError;

/// A wall-clock interval, `start` inclusive and `end` exclusive.
/// If `start > end` the window wraps midnight.  An empty window has `start == end`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Window {
    pub start: Time,
    pub end: Time,
}

impl Window {
    pub fn new(start: Time, end: Time) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, t: Time) -> bool {
        if self.start <= self.end {
            self.start <= t && t < self.end
        } else {
            t >= self.start || t < self.end
        }
    }
}

impl FromStr for Window {
    type Err = MastrError;

    /// Parse "HH:MM-HH:MM" (seconds are optional on both sides).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (start, end) = s
            .split_once('-')
            .ok_or_else(|| MastrError::InvalidSetting(format!("invalid time window {:?}", s)))?;
        let parse = |x: &str| {
            x.trim()
                .parse::<Time>()
                .map_err(|e| MastrError::InvalidSetting(format!("invalid time window {:?}: {}", s, e)))
        };
        Ok(Window::new(parse(start)?, parse(end)?))
    }
}

/// Clock-time intervals during which the batch driver must not be fetching.
#[derive(Clone, Debug, Default)]
pub struct Blacklist {
    windows: Vec<Window>,
}

impl Blacklist {
    pub fn new(windows: Vec<Window>) -> Self {
        Self { windows }
    }

    pub fn parse<S: AsRef<str>>(windows: &[S]) -> Result<Self, MastrError> {
        let windows = windows
            .iter()
            .map(|w| w.as_ref().parse::<Window>())
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(windows))
    }

    pub fn is_blocked(&self, now: Time) -> bool {
        self.windows.iter().any(|w| w.contains(now))
    }

    pub fn is_blocked_now(&self) -> bool {
        self.is_blocked(Zoned::now().time())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jiff::civil::time;
    use std::error::Error;

    #[test]
    fn business_hours() -> Result<(), Box<dyn Error>> {
        let blacklist = Blacklist::parse(&["08:00-18:00"])?;
        assert!(!blacklist.is_blocked(time(7, 59, 59, 0)));
        assert!(blacklist.is_blocked(time(8, 0, 0, 0)));
        assert!(blacklist.is_blocked(time(17, 59, 0, 0)));
        assert!(!blacklist.is_blocked(time(18, 0, 0, 0)));
        Ok(())
    }

    #[test]
    fn window_wrapping_midnight() -> Result<(), Box<dyn Error>> {
        let blacklist = Blacklist::parse(&["23:30-01:00"])?;
        assert!(blacklist.is_blocked(time(23, 45, 0, 0)));
        assert!(blacklist.is_blocked(time(0, 0, 0, 0)));
        assert!(blacklist.is_blocked(time(0, 59, 0, 0)));
        assert!(!blacklist.is_blocked(time(1, 0, 0, 0)));
        assert!(!blacklist.is_blocked(time(23, 29, 0, 0)));
        Ok(())
    }

    #[test]
    fn empty_window_and_no_windows() -> Result<(), Box<dyn Error>> {
        let blacklist = Blacklist::parse(&["10:00-10:00"])?;
        assert!(!blacklist.is_blocked(time(10, 0, 0, 0)));
        assert!(!Blacklist::default().is_blocked(time(12, 0, 0, 0)));
        assert!("10:00".parse::<Window>().is_err());
        Ok(())
    }
}

//! Frame-rate detection for the DASH manifest.
//!
//! Keeps roughly a second of video packet timestamps and estimates the
//! stream's frame rate as an integer, an NTSC-style fraction, or a float.

use std::time::Duration;

/// Rolling estimator over recent video packet times.
#[derive(Debug, Default)]
pub struct Detector {
    times: Vec<Duration>,
}

impl Detector {
    /// Record a video packet timestamp.
    pub fn append(&mut self, t: Duration) {
        self.times.push(t);
        let z = self.times.len() - 1;
        // retain about a second worth of times
        if self.times[z] - self.times[0] > Duration::from_millis(1002) {
            self.times.remove(0);
        }
    }

    /// Estimated frame rate of the stream.
    pub fn rate(&self) -> Rate {
        if self.times.len() < 2 {
            return Rate::default();
        }
        let z = self.times.len() - 1;
        let elapsed = (self.times[z] - self.times[0]).as_secs_f64();
        let rate = z as f64 / elapsed;
        if let Some(r) = matches(rate, 1) {
            return r;
        }
        if let Some(r) = matches(rate, 1001) {
            return r;
        }
        Rate {
            numerator: 0,
            denominator: 0,
            float: rate,
        }
    }
}

fn matches(rate: f64, denom: i64) -> Option<Rate> {
    let num = (rate * denom as f64) as i64;
    if (num as f64 / denom as f64 * 100.0).round() == (rate * 100.0).round() {
        Some(Rate {
            numerator: num,
            denominator: denom,
            float: rate,
        })
    } else {
        None
    }
}

/// Frame rate in frames per second.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Rate {
    /// Numerator of the fractional rate.
    pub numerator: i64,
    /// Denominator of the fractional rate: 1 if integral, 0 if the rate is
    /// only known as a float.
    pub denominator: i64,
    /// Float value of the rate.
    pub float: f64,
}

impl Rate {
    pub fn is_zero(&self) -> bool {
        self.numerator == 0 && self.float == 0.0
    }

    /// Format for a DASH `frameRate` attribute.
    pub fn to_attr(&self) -> Option<String> {
        if self.is_zero() {
            return None;
        }
        Some(match self.denominator {
            0 => format!("{:.2}", self.float),
            1 => format!("{}", self.numerator),
            _ => format!("{}/{}", self.numerator, self.denominator),
        })
    }
}

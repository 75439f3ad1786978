//! Frame range specifications: `FIRST[,LAST[,STEP]]`.

use std::collections::VecDeque;
use std::str::FromStr;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum FrameRangeError {
    #[error("invalid number in frame range: {0:?}")]
    BadNumber(String),
    #[error("too many fields in frame range: {0:?}")]
    TooManyFields(String),
    #[error("frame range step cannot be zero")]
    ZeroStep,
}

/// An inclusive, stepped range of frame numbers.
///
/// When `LAST` is omitted the range is the single frame `FIRST`. When
/// `STEP` is omitted it defaults to 1 or -1 depending on the order of
/// `FIRST` and `LAST`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameRange {
    pub first: i64,
    pub last: i64,
    pub step: i64,
}

impl FrameRange {
    /// Whether this frame is past the end, taking the step direction into
    /// account.
    fn is_past(&self, frame: i64) -> bool {
        if self.step > 0 {
            frame > self.last
        } else {
            frame < self.last
        }
    }

    /// All frames, in order from first to last.
    pub fn expand(&self) -> VecDeque<i64> {
        let mut frames = VecDeque::new();
        let mut frame = self.first;
        while !self.is_past(frame) {
            frames.push_back(frame);
            frame = match frame.checked_add(self.step) {
                Some(next) => next,
                None => break,
            };
        }
        frames
    }
}

impl FromStr for FrameRange {
    type Err = FrameRangeError;

    fn from_str(spec: &str) -> Result<Self, Self::Err> {
        let parse = |field: &str| {
            field
                .trim()
                .parse::<i64>()
                .map_err(|_| FrameRangeError::BadNumber(field.to_string()))
        };

        let mut fields = spec.split(',');
        let first = parse(fields.next().unwrap_or(""))?;

        let (last, step) = match fields.next() {
            None => (first, 1),
            Some(last_field) => {
                let last = parse(last_field)?;
                let step = match fields.next() {
                    None => {
                        if first <= last {
                            1
                        } else {
                            -1
                        }
                    }
                    Some(step_field) => parse(step_field)?,
                };
                (last, step)
            }
        };

        if fields.next().is_some() {
            return Err(FrameRangeError::TooManyFields(spec.to_string()));
        }
        if step == 0 {
            return Err(FrameRangeError::ZeroStep);
        }

        Ok(FrameRange { first, last, step })
    }
}

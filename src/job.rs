//! What the controller runs: the command, the frames, and the file copies.

use crate::frames::FrameRange;
use crate::subst;

/// One file to ship. Classified at construction: a copy whose source or
/// destination mentions the frame number travels once per frame, any other
/// copy travels once per connection.
#[derive(Debug, Clone)]
pub struct FileCopy {
    pub source: String,
    pub destination: String,
    per_frame: bool,
}

impl FileCopy {
    pub fn new(source: impl Into<String>, destination: impl Into<String>) -> Self {
        let source = source.into();
        let destination = destination.into();
        let per_frame =
            subst::contains_parameter(&source) || subst::contains_parameter(&destination);
        FileCopy {
            source,
            destination,
            per_frame,
        }
    }

    pub fn per_frame(&self) -> bool {
        self.per_frame
    }
}

/// The controller's full job description, shared read-only by every worker
/// session.
#[derive(Debug, Clone)]
pub struct Job {
    pub frames: FrameRange,
    pub executable: String,
    pub arguments: Vec<String>,
    pub in_copies: Vec<FileCopy>,
    pub out_copies: Vec<FileCopy>,
    pub password: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_copies() {
        assert!(!FileCopy::new("a.txt", "b.txt").per_frame());
        assert!(FileCopy::new("c-%d.png", "d-%d.png").per_frame());
        assert!(FileCopy::new("fixed.txt", "out-%03d.txt").per_frame());
        assert!(FileCopy::new("in-%d.txt", "fixed.txt").per_frame());
    }
}

//! Conflict detection, resolution, and presentation.
//!
//! The conflict subsystem is responsible for:
//! 1. **Detection** -- classifying every path of a three-way manifest merge.
//! 2. **Resolution** -- turning a reviewer's choice into merge content and
//!    overlaying all choices onto the pending manifest.
//! 3. **Presentation** -- a size summary and text patch for one conflict.

pub mod detector;
pub mod diff;
pub mod resolver;

pub use detector::{
    Change, Conflict, ConflictDetector, ConflictState, FileMerge, MergeOutcome, ThreeWayMerge,
};
pub use diff::{ConflictDiff, SideSummary};
pub use resolver::{ConflictResolver, Resolution};

mod registry;

pub use registry::{InterestRegistry, InterestSnapshot, KeyInterest};

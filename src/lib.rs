#![warn(missing_docs)]
#![doc = include_str!("../README.md")]

pub mod dict;
pub mod key;
pub mod reporter;

pub use dict::DictCursor;
pub use dict::DictOrder;
pub use dict::Dictionary;
pub use dict::Iter;
pub use dict::RobustDictIterator;
pub use key::HashKey;
pub use reporter::LogReporter;
pub use reporter::Reporter;

//! Filters mutate events in place on their way from parser to sampler. The
//! chain order is fixed: request shaping, data augmentation, field mutation
//! (drop / scrub / add / json decode / rename), then time rebasing. Every
//! filter absorbs its own recoverable failures; an error out of `process`
//! means "this filter skipped this event", never "stop the pipeline".

use event::Event;
use std::fmt;

pub mod augment;
pub mod mutate;
pub mod rebase;
pub mod shape;

pub use self::augment::Augmenter;
pub use self::mutate::FieldMutator;
pub use self::rebase::TimeRebase;
pub use self::shape::RequestShaper;

#[derive(Debug)]
pub enum FilterError {
    /// The named field was expected to hold a string and did not.
    NotAString(String),
}

impl fmt::Display for FilterError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            FilterError::NotAString(ref field) => {
                write!(f, "field {:?} did not hold a string", field)
            }
        }
    }
}

pub trait Filter: Send + Sync {
    fn name(&self) -> &'static str;
    fn process(&self, event: &mut Event) -> Result<(), FilterError>;
}

/// Run the chain over one event. Filter errors are logged with the
/// offending field and the event continues downstream untransformed by that
/// filter.
pub fn apply(filters: &[Box<dyn Filter>], event: &mut Event) {
    for filter in filters {
        if let Err(e) = filter.process(event) {
            warn!("{} filter skipped an event: {}", filter.name(), e);
        }
    }
}

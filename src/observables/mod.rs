//! Observables module - measurements and their running statistics.

mod extractor;
mod measurement;

pub use extractor::{ObservableExtractor, ObservableSample, TimeDisplacedGreens};
pub use measurement::Measurement;

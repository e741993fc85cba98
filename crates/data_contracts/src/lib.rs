//! Shared data contracts for detection annotations and class lists.

pub mod annotation;

pub use annotation::{Annotation, ClassList, ImageLabel, ValidationError};

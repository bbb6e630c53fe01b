//! Concrete steps, grouped by the kind of source they handle.

pub mod image;
pub mod media;
pub mod text;

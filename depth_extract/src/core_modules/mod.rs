// THEORY:
// `core_modules` holds the stages of the extraction engine, from raw frames to
// scalars. Each module is a pure transformation over frame stacks or feature
// series; only the tracker carries state, and it hands that state back to the
// caller instead of keeping it.

pub mod batch;
pub mod blob;
pub mod blob_detector;
pub mod containers;
pub mod crop;
pub mod flip;
pub mod frame_source;
pub mod hampel;
pub mod mat;
pub mod moment;
pub mod morphology;
pub mod preprocess;
pub mod scalars;
pub mod smoothing;
pub mod tracker;

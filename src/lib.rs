//! Teach-and-classify image recognition on top of ONNX embedding models.
//!
//! Frames are turned into fixed-length feature vectors by an embedding model
//! and matched against previously taught examples with a cosine-similarity
//! k-nearest-neighbor vote.

pub mod engine;
pub mod knn;
pub mod nn;
pub mod utils;

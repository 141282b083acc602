//! Hand-sign recognition: hand localization, sign classification, video label sequences and
//! a live annotated webcam feed served over HTTP.
pub mod config;
pub mod endpoints;
pub mod hand;
pub mod labels;
pub mod live;
pub mod meter;
pub mod model_store;
pub mod nn;
pub mod palm;
pub mod predictor;
pub mod sensors;
pub mod sequence;
pub mod train;
pub mod upload;
pub mod utils;
pub mod video;

#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(clippy::no_effect_underscore_binding)]
pub mod cache;
pub mod checkpoint;
pub mod classify;
pub mod config;
pub mod data;
pub mod estimate;
pub mod loocv;
pub mod model;
pub mod optimize;
pub mod personfit;
pub mod pipeline;
pub mod progress;
pub mod types;
pub mod vectorize;

#![deny(dead_code)]
#![deny(unused_imports)]

pub mod blup;
pub mod config;
pub mod data;
pub mod design;
pub mod link;
pub mod models;
pub mod params;
pub mod predictor;
pub mod quadrature;
pub mod random_effects;
pub mod sampler;
pub mod streams;
pub mod types;

pub mod average;
pub mod data;
pub mod dataset;
pub mod loss;
pub mod model;
pub mod training;
pub mod visualize;

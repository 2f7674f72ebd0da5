pub mod boundary;
pub mod calendar;
pub mod catalog;
pub mod clip;
pub mod completion;
pub mod config;
pub mod crs;
pub mod domain;
pub mod error;
pub mod fetch;
pub mod fs_util;
pub mod normalize;
pub mod output;
pub mod pipeline;
pub mod raster;
pub mod report;
pub mod sample;
pub mod store;

pub mod assets;
pub mod batch;
pub mod cache;
pub mod cli;
pub mod db;
pub mod error;
pub mod hours;
pub mod jobs;
pub mod models;
pub mod places;
pub mod signals;
pub mod source;
pub mod states;
pub mod store;
pub mod transform;
pub mod util;

pub use error::{Error, Result};

shadow_rs::shadow!(build);

pub mod capture;
pub mod config;
pub mod discovery;
pub mod error;
pub mod feature;
pub mod frame;
pub mod header;
pub mod image;
pub mod my_types;
pub mod optical_flow;
pub mod params;
pub mod pipeline;
pub mod pyramid;
pub mod reader;
pub mod refine;
pub mod ring;
pub mod store;
pub mod tracker;
#[cfg(feature = "opencv")]
pub mod video;

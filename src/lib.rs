pub mod archive;
pub mod config;
pub mod fleet;
pub mod forge;
pub mod git;
pub mod model;
pub mod pagination;
pub mod pipeline;
pub mod quota;
pub mod state;

pub mod beiboot;
pub mod shared;
pub mod shelf;

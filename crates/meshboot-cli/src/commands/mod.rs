pub mod boot;
pub mod cache;

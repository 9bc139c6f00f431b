pub mod config;
pub mod crawler;
pub mod dataset;
pub mod directory;
pub mod harvest;
pub mod index;
pub mod mediawiki;
pub mod model;
pub mod pager;
pub mod runtime;
pub mod search;

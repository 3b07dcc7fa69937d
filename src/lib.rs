pub mod config;
pub mod dag;
pub mod fetch;
pub mod pipelines;
pub mod process;
pub mod publish;
pub mod workspace;

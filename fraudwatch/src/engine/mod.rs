pub mod dispatcher;
pub mod scoring;

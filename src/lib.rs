pub mod config;
pub mod domain;
pub mod error;
pub mod external;
pub mod fetcher;
pub mod git;
pub mod github;
pub mod installer;
pub mod keyfile;
pub mod local_repo;
pub mod orchestrator;
pub mod output;
pub mod progress;
pub mod quota;
pub mod resolver;
pub mod scanner;
pub mod synth;

pub mod cli;
pub mod config;
pub mod error;
pub mod exclusions;
pub mod highlighter;
pub mod pipeline;
pub mod security;
pub mod source;
pub mod styling;
pub mod utils;
pub mod viewer;
pub mod watcher;

pub use cli::Args;
pub use config::Config;
pub use error::{ConnectionError, PatternError, SourceError};
pub use exclusions::ExclusionEngine;
pub use highlighter::Highlighter;
pub use pipeline::LogPipeline;
pub use security::SecurityPolicy;
pub use source::{LineSource, LogLine};
pub use styling::StylingEngine;
pub use viewer::Viewer;
pub use watcher::ChangeWatcher;

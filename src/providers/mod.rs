//! 抽出・比較プロバイダの実装

pub mod cli;

pub use cli::{CliComparator, CliExtractor};

//! Shelf AI Common Library
//!
//! 収束エンジンの純粋ロジック（I/Oなし）と共有型

pub mod types;
pub mod error;
pub mod accuracy;
pub mod iteration;
pub mod fields;
pub mod parser;
pub mod prompts;

pub use types::*;
pub use error::{Error, Result};
pub use accuracy::{AccuracyAnalyzer, AnalyzerConfig};
pub use iteration::{merge_entities, IterationStateManager, LockPolicy};
pub use fields::{default_fields, FieldDescriptor, FieldKind};
pub use parser::{extract_json, parse_comparison_response, parse_extraction_response, ParsedExtraction};
pub use prompts::{build_comparison_prompt, build_extraction_prompt, build_focus_instructions};

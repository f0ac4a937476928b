//! # Ingot Grammar
//!
//! Tool-catalog parsing and GBNF grammar synthesis for grammar-constrained
//! tool calling with local GGUF models.
//!
//! The crate turns an OpenAI-style function-calling tool array into a typed
//! GBNF grammar that forces the model to emit
//! `{"tool_calls":[{"name":…,"arguments":{…}}]}` with exact parameter names,
//! types, and enum values. When a typed grammar cannot be produced, a generic
//! fallback grammar still pins the envelope and the set of known tool names.
//!
//! Both the catalog scanner and the grammar builder are pure string
//! processing: no JSON library is involved, so the crate has no opinion about
//! which decoder backend ultimately compiles the grammar.
//!
//! ## Modules
//!
//! - [`schema`]: catalog normalization and parsing into [`ToolSpec`] values
//! - [`gbnf`]: typed and generic GBNF grammar builders

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod gbnf;
pub mod schema;

pub use gbnf::{generic_tool_grammar, typed_tool_grammar};
pub use schema::{extract_tool_names, normalize_tools_json, parse_tools, ToolParam, ToolSpec};

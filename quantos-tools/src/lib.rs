//! Tool bridge for QuantOS agents.
//!
//! Tools are the agents' only side-effecting primitives: named,
//! schema-validated, and invoked uniformly through the registry. A failing
//! tool returns a failed `ToolResult` the model can act on, never a panic.

mod error;
mod file_ops;
mod grep;
pub mod indicators;
mod market;
mod sandbox;
mod schema;
mod symbols;
mod traits;
mod workspace;

pub use error::{Result, ToolError, ToolErrorKind};
pub use file_ops::{
    DeleteFileTool, ListDirectoryTool, MoveFileTool, PatchFileTool, ReadFileTool, WriteFileTool,
};
pub use grep::GrepTool;
pub use market::{
    CalculateIndicatorTool, GetKlinesTool, Kline, MarketData, OrderGateway, OrderReceipt,
    OrderType, PlaceOrderTool, Side,
};
pub use sandbox::{
    ExitKind, RunRequest, RunSummary, RunTimeout, SandboxEvent, SandboxRunner, OUTPUT_CAP_BYTES,
};
pub use sandbox::ShellExecTool;
pub use schema::validate_arguments;
pub use symbols::{
    FindReferencesTool, GetDefinitionTool, GetFileOutlineTool, SharedSymbolIndex, SymbolIndex,
    SymbolInfo, SymbolKind,
};
pub use traits::{to_tool_definition, Tool, ToolRegistry, ToolResult, ToolSpec};
pub use workspace::{language_for_path, normalize_rel_path, resolve_path};

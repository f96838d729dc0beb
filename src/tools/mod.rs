//! Shared building blocks: naming, filters, patches, and the statement layer

pub mod case;
pub mod filter;
pub mod patch;
pub mod sql;
pub mod statement;
pub mod types;

pub use filter::{Criterion, Filter, Sort, SortOrder};
pub use patch::PatchOp;
pub use statement::{Action, ColumnDef, ColumnRef, ColumnValue, Condition, OrderBy, Statement};
pub use types::ColumnType;

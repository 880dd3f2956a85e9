//! Query Engine
//!
//! Side-effect free evaluation over documents:
//!
//! - **Conditions** (`condition.rs`) - boolean trees with numeric promotion
//! - **Filters** (`filter.rs`) - exact field matches
//! - **Sorting** (`sort.rs`) - multi-key ordering
//! - **Find options** (`find.rs`) - condition, sort, skip and limit together

pub mod condition;
pub mod filter;
pub mod find;
pub mod sort;
pub mod value;

pub use condition::{Comparison, Condition, FieldCondition, ID_FIELD};
pub use filter::Filter;
pub use find::FindOptions;
pub use sort::{SortOrder, SortSpec};
pub use value::{compare_values, values_equal};

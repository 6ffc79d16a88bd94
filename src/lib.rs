#![deny(
    unsafe_code,
    // clippy::unwrap_used,
    // clippy::expect_used,
    clippy::panic,
)]

//! A reactive value-dependency manager: a spreadsheet-like engine for
//! in-memory object graphs.
//!
//! Register containers, bind their fields to expressions built from
//! references to other fields, and the manager keeps every downstream field
//! consistent — in topological order, exactly once per write — whenever a
//! source field changes.
//!
//! ```
//! use depweave::{Manager, Record, Value};
//!
//! let mut m = Manager::new();
//! let v = m.register_container(Box::new(Record::new()), "v").unwrap();
//! let e = m.register_container(Box::new(Record::new()), "e").unwrap();
//!
//! m.set_value(&v.item("a"), Value::Int(3)).unwrap();
//! m.set_value(&v.item("b"), Value::Int(4)).unwrap();
//! m.set_value(&e.item("c"), v.item("a") + v.item("b")).unwrap();
//!
//! assert!(matches!(e.item("c").get_value().unwrap(), Value::Int(7)));
//!
//! m.set_value(&v.item("a"), Value::Int(10)).unwrap();
//! assert!(matches!(e.item("c").get_value().unwrap(), Value::Int(14)));
//! ```

pub mod container;
pub mod env;
pub mod error;
pub mod manager;
mod multiset;
pub mod refs;
mod sort;
pub mod task;
pub mod value;

pub use container::{Container, Record};
pub use env::Environment;
pub use error::{ContainerError, ManagerError};
pub use manager::{Assignable, ExprParser, Manager, ManagerConfig, VerifyReport};
pub use refs::{BinOp, Builtin, Ref, RefId, UnOp};
pub use task::{Task, TaskId, WriteEvent};
pub use value::Value;

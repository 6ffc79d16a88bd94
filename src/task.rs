//! The task model: nodes in the dependency graph.
//!
//! * [`Task::Expr`] declares `target <- expr` and depends on every mutable
//!   reference reachable from `expr`.
//! * [`Task::Generic`] is a user-supplied action firing on any upstream
//!   change, given mutable access to the manager.
//! * [`Task::Inheritance`] replays the last observed write event from parent
//!   references onto a set of children.

use std::fmt;
use std::rc::Rc;

use indexmap::IndexSet;

use crate::error::ManagerError;
use crate::manager::Manager;
use crate::refs::{Ref, RefId};

/// Uniquely identifies a task within a [`Manager`]. `Expr`/`Inheritance`
/// tasks derive their id from their target ref(s); `Generic` tasks carry an
/// explicit caller-supplied id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TaskId {
    Expr(RefId),
    Inheritance(RefId),
    Generic(u64),
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskId::Expr(r) => write!(f, "expr:{r:?}"),
            TaskId::Inheritance(r) => write!(f, "inherit:{r:?}"),
            TaskId::Generic(id) => write!(f, "generic:{id}"),
        }
    }
}

/// A write event recorded on a parent ref participating in an
/// [`Task::Inheritance`] task: `(key, value, is_attr)`.
#[derive(Debug, Clone)]
pub struct WriteEvent {
    pub key: crate::value::Value,
    pub value: crate::value::Value,
    pub is_attr: bool,
}

/// A unit of recomputation in the dependency graph.
#[derive(Clone)]
pub enum Task {
    Expr {
        target: Ref,
        expr: Ref,
    },
    Generic {
        id: u64,
        targets: Vec<Ref>,
        deps: Vec<Ref>,
        action: Rc<dyn Fn(&mut Manager) -> anyhow::Result<()>>,
    },
    Inheritance {
        children: Vec<Ref>,
        parents: Vec<Ref>,
        /// Last observed event on any parent; replayed onto every child on
        /// `run` (last-writer-wins, see `SPEC_FULL.md §9`).
        last_event: Option<WriteEvent>,
    },
}

impl Task {
    /// Builds an `Inheritance` task, rejecting an empty `children` list: a
    /// task with nothing to replay onto is never meaningful to register.
    pub fn inheritance(children: Vec<Ref>, parents: Vec<Ref>) -> Result<Task, ManagerError> {
        if children.is_empty() {
            return Err(ManagerError::InvalidTask(
                "inheritance task must have at least one child".to_owned(),
            ));
        }
        Ok(Task::Inheritance {
            children,
            parents,
            last_event: None,
        })
    }

    /// `Inheritance`'s id is derived from its first child, falling back to
    /// its first parent, falling back to a sentinel for a task with neither
    /// (inert: [`targets`](Task::targets) and
    /// [`dependencies`](Task::dependencies) are both empty, so it never
    /// runs). `Task::inheritance` is the recommended constructor and rejects
    /// this case up front, but enum variant fields can't be hidden behind
    /// it, so this stays total rather than panicking on a hand-built task.
    pub fn taskid(&self) -> TaskId {
        match self {
            Task::Expr { target, .. } => TaskId::Expr(target.id()),
            Task::Generic { id, .. } => TaskId::Generic(*id),
            Task::Inheritance { children, parents, .. } => TaskId::Inheritance(
                children
                    .first()
                    .or_else(|| parents.first())
                    .map(|r| r.id())
                    .unwrap_or(RefId(u64::MAX)),
            ),
        }
    }

    pub fn targets(&self) -> Vec<Ref> {
        match self {
            Task::Expr { target, .. } => vec![target.clone()],
            Task::Generic { targets, .. } => targets.clone(),
            Task::Inheritance { children, .. } => children.clone(),
        }
    }

    pub fn dependencies(&self) -> IndexSet<RefId> {
        let mut out = IndexSet::new();
        match self {
            Task::Expr { expr, .. } => expr.get_dependencies(&mut out),
            Task::Generic { deps, .. } => {
                for d in deps {
                    d.get_dependencies(&mut out);
                }
            }
            Task::Inheritance { parents, .. } => {
                for p in parents {
                    out.insert(p.id());
                }
            }
        }
        out
    }

    /// Execute this task, writing through its target ref(s).
    pub fn run(&mut self, manager: &mut Manager) -> anyhow::Result<()> {
        match self {
            Task::Expr { target, expr } => {
                let value = expr.get_value()?;
                target.set_value(value)?;
                Ok(())
            }
            Task::Generic { action, .. } => action(manager),
            Task::Inheritance { children, last_event, .. } => {
                if let Some(event) = last_event {
                    for child in children.iter() {
                        if event.is_attr {
                            child.attr(match &event.key {
                                crate::value::Value::Str(s) => s.clone(),
                                other => other.to_string(),
                            })
                            .set_value(event.value.clone())?;
                        } else {
                            child.item(event.key.clone()).set_value(event.value.clone())?;
                        }
                    }
                }
                Ok(())
            }
        }
    }
}

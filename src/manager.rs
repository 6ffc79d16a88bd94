//! The dependency manager: owns registered containers and tasks, and
//! maintains the four bipartite index maps that drive incremental
//! propagation.
//!
//! Grounded on `xdeps.tasks.Manager` almost one-to-one; its `defaultdict(list)`
//! index fields map directly onto this module's [`Multiset`]-valued
//! [`IndexMap`]s. The propagation loop's control flow (dependents map,
//! in-degree counting via a seeded queue) is grounded on the teacher's
//! `run_tasks_parallel`, here made sequential.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use indexmap::{IndexMap, IndexSet};
use tracing::{debug, trace, warn};

use crate::container::Container;
use crate::error::ManagerError;
use crate::multiset::Multiset;
use crate::refs::{self, Arena, Ref, RefId};
use crate::sort::topo_sort;
use crate::task::{Task, TaskId, WriteEvent};
use crate::value::Value;

/// Runtime knobs for a [`Manager`]. Currently the one the original leaves
/// implicit: whether writing a literal that happens to equal the field's
/// current value still re-runs dependents.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// `true` (default): `set_value` always re-runs dependents, matching the
    /// original's unconditional re-run. `false`: a literal write that does
    /// not change the value is a no-op.
    pub eager_propagation: bool,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            eager_propagation: true,
        }
    }
}

/// Either a literal value or a bound expression, the two things `set_value`
/// can be given.
pub enum Assignable {
    Literal(Value),
    Expr(Ref),
}

impl From<Value> for Assignable {
    fn from(v: Value) -> Self {
        Assignable::Literal(v)
    }
}

impl From<Ref> for Assignable {
    fn from(r: Ref) -> Self {
        Assignable::Expr(r)
    }
}

impl From<i64> for Assignable {
    fn from(v: i64) -> Self {
        Assignable::Literal(Value::Int(v))
    }
}

impl From<f64> for Assignable {
    fn from(v: f64) -> Self {
        Assignable::Literal(Value::Float(v))
    }
}

impl From<&str> for Assignable {
    fn from(v: &str) -> Self {
        Assignable::Literal(Value::Str(v.to_owned()))
    }
}

/// Result of [`Manager::verify`]: whether the live indices match a freshly
/// rebuilt manager, and a human-readable list of mismatches if not.
#[derive(Debug, Clone)]
pub struct VerifyReport {
    pub consistent: bool,
    pub mismatches: Vec<String>,
}

/// External collaborator that turns a dump's canonical expression strings
/// back into [`Ref`] trees. The core manager does not implement one; `load`
/// is generic over it.
pub trait ExprParser {
    fn parse(&self, manager: &Manager, src: &str) -> Result<Ref, ManagerError>;
}

pub struct Manager {
    arena: Rc<RefCell<Arena>>,
    containers: IndexMap<String, RefId>,
    tasks: IndexMap<TaskId, Task>,
    rdeps: IndexMap<RefId, Multiset<RefId>>,
    deptasks: IndexMap<RefId, Multiset<TaskId>>,
    tartasks: IndexMap<RefId, Multiset<TaskId>>,
    rtasks: IndexMap<TaskId, Multiset<TaskId>>,
    config: ManagerConfig,
    next_generic_id: u64,
}

impl Default for Manager {
    fn default() -> Self {
        Self::new()
    }
}

impl Manager {
    pub fn new() -> Self {
        Self::with_config(ManagerConfig::default())
    }

    pub fn with_config(config: ManagerConfig) -> Self {
        Manager {
            arena: Rc::new(RefCell::new(Arena::default())),
            containers: IndexMap::new(),
            tasks: IndexMap::new(),
            rdeps: IndexMap::new(),
            deptasks: IndexMap::new(),
            tartasks: IndexMap::new(),
            rtasks: IndexMap::new(),
            config,
            next_generic_id: 0,
        }
    }

    /// Registers `container` under `label`, returning its root reference.
    pub fn register_container(
        &mut self,
        container: Box<dyn Container>,
        label: impl Into<String>,
    ) -> Result<Ref, ManagerError> {
        let label = label.into();
        if self.containers.contains_key(&label) {
            return Err(ManagerError::DuplicateLabel(label));
        }
        let root = Ref::root_label(&self.arena, container, &label);
        self.containers.insert(label, root.id());
        Ok(root)
    }

    pub fn container_ref(&self, label: &str) -> Option<Ref> {
        self.containers
            .get(label)
            .map(|id| Ref::from_arena(self.arena.clone(), *id))
    }

    /// A fresh id for a `GenericTask`. Callers may also supply their own.
    pub fn next_task_id(&mut self) -> u64 {
        let id = self.next_generic_id;
        self.next_generic_id += 1;
        id
    }

    /// Writes `value` into `target`, rebinding or clearing its expression
    /// task as needed, then propagates to every downstream task.
    pub fn set_value(&mut self, target: &Ref, value: impl Into<Assignable>) -> Result<(), ManagerError> {
        let assignable = value.into();
        let existing = TaskId::Expr(target.id());
        if self.tasks.contains_key(&existing) {
            self.unregister(&existing)?;
        }

        debug!(target = %target, "set_value");

        match assignable {
            Assignable::Expr(expr) => {
                let value = expr.get_value()?;
                let taskid = self.register(Task::Expr {
                    target: target.clone(),
                    expr,
                })?;

                // Check the downstream order is acyclic *before* writing
                // anything, so a rejected write leaves the manager untouched.
                let ordered = match self.find_tasks(&[target.id()]) {
                    Ok(ordered) => ordered,
                    Err(err) => {
                        let _ = self.unregister(&taskid);
                        return Err(err);
                    }
                };

                target.set_value(value)?;
                return self.run_ordered(ordered);
            }
            Assignable::Literal(v) => {
                if !self.config.eager_propagation {
                    if let Ok(current) = target.get_value() {
                        if current.value_eq(&v) {
                            return Ok(());
                        }
                    }
                }
                target.set_value(v.clone())?;

                if let Some((owner, key, is_attr)) = target.owner_event() {
                    self.note_inheritance_write(&owner, key, v, is_attr)?;
                }
            }
        }

        self.propagate(vec![target.id()])
    }

    fn propagate(&mut self, seed: Vec<RefId>) -> Result<(), ManagerError> {
        let ordered = self.find_tasks(&seed)?;
        self.run_ordered(ordered)
    }

    fn run_ordered(&mut self, ordered: Vec<TaskId>) -> Result<(), ManagerError> {
        for tid in ordered {
            if let Some(mut task) = self.tasks.shift_remove(&tid) {
                trace!(task = %tid, "running task");
                let result = task.run(self);
                self.tasks.insert(tid, task);
                result.map_err(ManagerError::EvaluationError)?;
            }
        }
        Ok(())
    }

    /// Registers `task`, updating all four index maps.
    pub fn register(&mut self, task: Task) -> Result<TaskId, ManagerError> {
        let taskid = task.taskid();
        let deps = task.dependencies();
        let targets = task.targets();
        let target_ids: Vec<RefId> = targets.iter().map(|t| t.id()).collect();

        for dep in &deps {
            let rdep_entry = self.rdeps.entry(*dep).or_default();
            for tid in &target_ids {
                rdep_entry.push(*tid);
            }
            self.deptasks.entry(*dep).or_default().push(taskid.clone());

            if let Some(existing) = self.tartasks.get(dep) {
                let existing: Vec<TaskId> = existing.iter().cloned().collect();
                for other in existing {
                    self.rtasks.entry(other).or_default().push(taskid.clone());
                }
            }
        }

        for tid in &target_ids {
            self.tartasks.entry(*tid).or_default().push(taskid.clone());

            if let Some(existing) = self.deptasks.get(tid) {
                let existing: Vec<TaskId> = existing.iter().cloned().collect();
                for other in existing {
                    self.rtasks.entry(taskid.clone()).or_default().push(other);
                }
            }
        }

        self.tasks.insert(taskid.clone(), task);
        Ok(taskid)
    }

    /// Inverts [`Manager::register`] symmetrically.
    pub fn unregister(&mut self, taskid: &TaskId) -> Result<(), ManagerError> {
        let task = self
            .tasks
            .shift_remove(taskid)
            .ok_or_else(|| ManagerError::UnknownTask(taskid.clone()))?;

        let deps = task.dependencies();
        let targets = task.targets();
        let target_ids: Vec<RefId> = targets.iter().map(|t| t.id()).collect();

        for dep in &deps {
            if let Some(m) = self.rdeps.get_mut(dep) {
                for tid in &target_ids {
                    m.remove_one(tid);
                }
            }
            if let Some(m) = self.deptasks.get_mut(dep) {
                m.remove_one(taskid);
            }
            if let Some(existing) = self.tartasks.get(dep) {
                let existing: Vec<TaskId> = existing.iter().cloned().collect();
                for other in existing {
                    if let Some(m) = self.rtasks.get_mut(&other) {
                        m.remove_one(taskid);
                    }
                }
            }
        }

        for tid in &target_ids {
            if let Some(m) = self.tartasks.get_mut(tid) {
                m.remove_one(taskid);
            }
            if let Some(existing) = self.deptasks.get(tid) {
                let existing: Vec<TaskId> = existing.iter().cloned().collect();
                for other in existing {
                    if let Some(m) = self.rtasks.get_mut(taskid) {
                        m.remove_one(&other);
                    }
                }
            }
        }

        Ok(())
    }

    /// Topological traversal of `rdeps` from `seeds`; every ref downstream.
    pub fn find_deps(&self, seeds: &[RefId]) -> Result<Vec<RefId>, ManagerError> {
        let rdeps = &self.rdeps;
        topo_sort(seeds.iter().cloned(), |r| {
            rdeps.get(r).map(|m| m.iter().cloned().collect::<Vec<_>>()).unwrap_or_default()
        })
        .map_err(|path| ManagerError::CycleDetected(path.iter().map(|r| format!("{r:?}")).collect()))
    }

    /// Resolves `seeds` to tasks via `deptasks`, then topologically sorts
    /// over `rtasks`, returning task ids in execution order.
    pub fn find_tasks(&self, seeds: &[RefId]) -> Result<Vec<TaskId>, ManagerError> {
        let mut seed_tasks: Vec<TaskId> = Vec::new();
        for r in seeds {
            if let Some(m) = self.deptasks.get(r) {
                for tid in m.iter() {
                    seed_tasks.push(tid.clone());
                }
            }
        }
        let rtasks = &self.rtasks;
        topo_sort(seed_tasks, |tid| {
            rtasks.get(tid).map(|m| m.iter().cloned().collect::<Vec<_>>()).unwrap_or_default()
        })
        .map_err(|path| ManagerError::CycleDetected(path.iter().map(|t| t.to_string()).collect()))
    }

    /// Structural duplicate of `self`: every container is cloned via
    /// `Container::clone_box` and the arena is deep-copied onto the clones
    /// through `clone_onto`, so mutating the copy never touches `self`.
    pub fn copy(&self) -> Manager {
        let mut containers: IndexMap<String, Box<dyn Container>> = IndexMap::new();
        for (label, root_id) in &self.containers {
            let root = Ref::from_arena(self.arena.clone(), *root_id);
            if let Some(boxed) = root.clone_root_container() {
                containers.insert(label.clone(), boxed);
            }
        }
        self.clone_onto(containers)
            .expect("copy() supplies exactly the labels already registered on self")
    }

    /// Structurally duplicates the manager onto fresh containers. Unlike
    /// the original this always returns the new manager (see `DESIGN.md`).
    pub fn clone_onto(&self, mut containers: IndexMap<String, Box<dyn Container>>) -> Result<Manager, ManagerError> {
        let new_arena = Rc::new(RefCell::new(Arena::default()));
        let mut root_map: HashMap<RefId, RefId> = HashMap::new();
        let mut new_containers: IndexMap<String, RefId> = IndexMap::new();

        for (label, old_root_id) in &self.containers {
            let container = containers.shift_remove(label).ok_or_else(|| {
                ManagerError::EvaluationError(anyhow::anyhow!("no container supplied for label `{label}`"))
            })?;
            let new_root = Ref::root_label(&new_arena, container, label);
            root_map.insert(*old_root_id, new_root.id());
            new_containers.insert(label.clone(), new_root.id());
        }

        let mut new_manager = Manager {
            arena: new_arena.clone(),
            containers: new_containers,
            tasks: IndexMap::new(),
            rdeps: IndexMap::new(),
            deptasks: IndexMap::new(),
            tartasks: IndexMap::new(),
            rtasks: IndexMap::new(),
            config: self.config.clone(),
            next_generic_id: self.next_generic_id,
        };

        let old_arena = self.arena.borrow();
        let mut memo: HashMap<RefId, RefId> = HashMap::new();

        let remap = |r: &Ref, memo: &mut HashMap<RefId, RefId>| -> Result<Ref, ManagerError> {
            let new_id = {
                let mut na = new_arena.borrow_mut();
                refs::deep_copy(&old_arena, r.id(), &mut na, &root_map, memo)
            }
            .ok_or_else(|| ManagerError::EvaluationError(anyhow::anyhow!("reference rooted outside the cloned containers")))?;
            Ok(Ref::from_arena(new_arena.clone(), new_id))
        };

        for (_, task) in self.tasks.iter() {
            let new_task = match task {
                Task::Expr { target, expr } => Task::Expr {
                    target: remap(target, &mut memo)?,
                    expr: remap(expr, &mut memo)?,
                },
                Task::Generic { id, targets, deps, action } => Task::Generic {
                    id: *id,
                    targets: targets.iter().map(|t| remap(t, &mut memo)).collect::<Result<_, _>>()?,
                    deps: deps.iter().map(|d| remap(d, &mut memo)).collect::<Result<_, _>>()?,
                    action: action.clone(),
                },
                Task::Inheritance { children, parents, last_event } => Task::Inheritance {
                    children: children.iter().map(|c| remap(c, &mut memo)).collect::<Result<_, _>>()?,
                    parents: parents.iter().map(|p| remap(p, &mut memo)).collect::<Result<_, _>>()?,
                    last_event: last_event.clone(),
                },
            };
            new_manager.register(new_task)?;
        }
        drop(old_arena);

        Ok(new_manager)
    }

    /// Produces the textual dump of every live `ExprTask` as
    /// `(target-expression, value-expression)` pairs.
    pub fn dump(&self) -> Vec<(String, String)> {
        self.tasks
            .values()
            .filter_map(|t| match t {
                Task::Expr { target, expr } => Some((target.to_canonical_string(), expr.to_canonical_string())),
                _ => None,
            })
            .collect()
    }

    /// Re-creates every `ExprTask` in `dump` by parsing both sides with
    /// `parser` and calling `set_value`.
    pub fn load(&mut self, dump: &[(String, String)], parser: &dyn ExprParser) -> Result<(), ManagerError> {
        for (target_src, expr_src) in dump {
            let target = parser.parse(self, target_src)?;
            let expr = parser.parse(self, expr_src)?;
            self.set_value(&target, expr)?;
        }
        Ok(())
    }

    /// Re-derives a fresh manager from the live task set, for use by
    /// [`Manager::verify`].
    pub fn rebuild(&self) -> Manager {
        let mut fresh = Manager {
            arena: self.arena.clone(),
            containers: self.containers.clone(),
            tasks: IndexMap::new(),
            rdeps: IndexMap::new(),
            deptasks: IndexMap::new(),
            tartasks: IndexMap::new(),
            rtasks: IndexMap::new(),
            config: self.config.clone(),
            next_generic_id: self.next_generic_id,
        };
        for (_, task) in self.tasks.iter() {
            let _ = fresh.register(task.clone());
        }
        fresh
    }

    /// Diffs `self`'s live indices against a [`Manager::rebuild`].
    pub fn verify(&self) -> VerifyReport {
        let fresh = self.rebuild();
        let mut mismatches = Vec::new();

        if self.tasks.len() != fresh.tasks.len() {
            mismatches.push(format!(
                "task count mismatch: live={} rebuilt={}",
                self.tasks.len(),
                fresh.tasks.len()
            ));
        }
        for key in self.tasks.keys() {
            if !fresh.tasks.contains_key(key) {
                mismatches.push(format!("task {key} missing from rebuild"));
            }
        }

        check_index(&self.rdeps, &fresh.rdeps, "rdeps", &mut mismatches);
        check_index(&self.deptasks, &fresh.deptasks, "deptasks", &mut mismatches);
        check_index(&self.tartasks, &fresh.tartasks, "tartasks", &mut mismatches);
        check_index(&self.rtasks, &fresh.rtasks, "rtasks", &mut mismatches);

        if !mismatches.is_empty() {
            warn!(count = mismatches.len(), "manager.verify found inconsistencies");
        }

        VerifyReport {
            consistent: mismatches.is_empty(),
            mismatches,
        }
    }

    /// Records a write event for any parent ref participating in an
    /// `Inheritance` task, then re-runs that task so children mirror it.
    pub fn note_inheritance_write(
        &mut self,
        parent: &RefId,
        key: Value,
        value: Value,
        is_attr: bool,
    ) -> Result<(), ManagerError> {
        let affected: Vec<TaskId> = self
            .tasks
            .iter()
            .filter_map(|(tid, t)| match t {
                Task::Inheritance { parents, .. } if parents.iter().any(|p| p.id() == *parent) => {
                    Some(tid.clone())
                }
                _ => None,
            })
            .collect();

        for tid in affected {
            if let Some(Task::Inheritance { last_event, .. }) = self.tasks.get_mut(&tid) {
                *last_event = Some(WriteEvent {
                    key: key.clone(),
                    value: value.clone(),
                    is_attr,
                });
            }
            if let Some(mut task) = self.tasks.shift_remove(&tid) {
                let result = task.run(self);
                self.tasks.insert(tid, task);
                result.map_err(ManagerError::EvaluationError)?;
            }
        }
        Ok(())
    }
}

/// Compares two `Multiset`-valued indices key by key, over the union of keys
/// present in either map, by full sorted contents rather than cardinality —
/// two indices can agree on length per key while disagreeing on membership
/// (e.g. an `unregister` that dropped the wrong occurrence).
fn check_index<K, T>(
    live: &IndexMap<K, Multiset<T>>,
    rebuilt: &IndexMap<K, Multiset<T>>,
    name: &str,
    mismatches: &mut Vec<String>,
) where
    K: std::hash::Hash + Eq + Clone + std::fmt::Debug,
    T: Ord + Clone + std::fmt::Debug,
{
    let mut keys: IndexSet<K> = live.keys().cloned().collect();
    keys.extend(rebuilt.keys().cloned());

    for key in keys {
        let mut a: Vec<T> = live.get(&key).map(|m| m.iter().cloned().collect()).unwrap_or_default();
        let mut b: Vec<T> = rebuilt.get(&key).map(|m| m.iter().cloned().collect()).unwrap_or_default();
        a.sort();
        b.sort();
        if a != b {
            mismatches.push(format!("{name}[{key:?}] live={a:?} rebuilt={b:?}"));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::Record;

    fn new_manager_with(label: &str) -> (Manager, Ref) {
        let mut m = Manager::new();
        let r = m.register_container(Box::new(Record::new()), label).unwrap();
        (m, r)
    }

    #[test]
    fn s1_chained_arithmetic() {
        let (mut m, v) = new_manager_with("v");
        let e = m.register_container(Box::new(Record::new()), "e").unwrap();

        m.set_value(&v.item("a"), Value::Int(3)).unwrap();
        m.set_value(&v.item("b"), Value::Int(4)).unwrap();
        m.set_value(&e.item("c"), v.item("a") + v.item("b")).unwrap();
        m.set_value(&e.item("d"), e.item("c") * 2i64).unwrap();

        assert!(matches!(e.item("c").get_value().unwrap(), Value::Int(7)));
        assert!(matches!(e.item("d").get_value().unwrap(), Value::Int(14)));

        m.set_value(&v.item("a"), Value::Int(10)).unwrap();
        assert!(matches!(e.item("c").get_value().unwrap(), Value::Int(14)));
        assert!(matches!(e.item("d").get_value().unwrap(), Value::Int(28)));
    }

    #[test]
    fn s2_expression_removal() {
        let (mut m, v) = new_manager_with("v");
        let e = m.register_container(Box::new(Record::new()), "e").unwrap();
        m.set_value(&v.item("a"), Value::Int(3)).unwrap();
        m.set_value(&v.item("b"), Value::Int(4)).unwrap();
        m.set_value(&e.item("c"), v.item("a") + v.item("b")).unwrap();
        m.set_value(&e.item("d"), e.item("c") * 2i64).unwrap();

        m.set_value(&e.item("d"), Value::Int(99)).unwrap();
        assert!(!m.tasks.contains_key(&TaskId::Expr(e.item("d").id())));

        m.set_value(&v.item("a"), Value::Int(1)).unwrap();
        assert!(matches!(e.item("c").get_value().unwrap(), Value::Int(5)));
        assert!(matches!(e.item("d").get_value().unwrap(), Value::Int(99)));
    }

    #[test]
    fn s4_cycle_rejection() {
        let (mut m, v) = new_manager_with("v");
        m.set_value(&v.item("a"), Value::Int(1)).unwrap();
        m.set_value(&v.item("b"), v.item("a") + 1i64).unwrap();
        let err = m.set_value(&v.item("a"), v.item("b") + 1i64);
        assert!(matches!(err, Err(ManagerError::CycleDetected(_))));
    }

    #[test]
    fn find_deps_reports_transitive_downstream_refs_in_order() {
        let (mut m, v) = new_manager_with("v");
        let e = m.register_container(Box::new(Record::new()), "e").unwrap();

        m.set_value(&v.item("a"), Value::Int(1)).unwrap();
        m.set_value(&e.item("c"), v.item("a") + 1i64).unwrap();
        m.set_value(&e.item("d"), e.item("c") * 2i64).unwrap();

        let deps = m.find_deps(&[v.item("a").id()]).unwrap();
        let pos_a = deps.iter().position(|r| *r == v.item("a").id()).unwrap();
        let pos_c = deps.iter().position(|r| *r == e.item("c").id()).unwrap();
        let pos_d = deps.iter().position(|r| *r == e.item("d").id()).unwrap();
        assert!(pos_a < pos_c, "seed must precede its dependents");
        assert!(pos_c < pos_d, "c must precede d in topological order");
    }

    #[test]
    fn find_deps_of_an_unreferenced_ref_is_just_itself() {
        let (mut m, v) = new_manager_with("v");
        m.set_value(&v.item("a"), Value::Int(1)).unwrap();
        let deps = m.find_deps(&[v.item("a").id()]).unwrap();
        assert_eq!(deps, vec![v.item("a").id()]);
    }

    #[test]
    fn verify_reports_consistent_after_normal_use() {
        let (mut m, v) = new_manager_with("v");
        m.set_value(&v.item("a"), Value::Int(1)).unwrap();
        m.set_value(&v.item("b"), v.item("a") + 1i64).unwrap();
        let report = m.verify();
        assert!(report.consistent, "{:?}", report.mismatches);
    }

    #[test]
    fn s6_clone_isolation() {
        let (mut m, v) = new_manager_with("v");
        let e = m.register_container(Box::new(Record::new()), "e").unwrap();
        m.set_value(&v.item("a"), Value::Int(3)).unwrap();
        m.set_value(&v.item("b"), Value::Int(4)).unwrap();
        m.set_value(&e.item("c"), v.item("a") + v.item("b")).unwrap();

        let mut fresh_containers: IndexMap<String, Box<dyn Container>> = IndexMap::new();
        fresh_containers.insert("v".to_owned(), Box::new(Record::new()));
        fresh_containers.insert("e".to_owned(), Box::new(Record::new()));
        let mut m2 = m.clone_onto(fresh_containers).unwrap();
        let v2 = m2.container_ref("v").unwrap();
        let e2 = m2.container_ref("e").unwrap();

        m2.set_value(&v2.item("a"), Value::Int(100)).unwrap();
        assert!(matches!(e2.item("c").get_value().unwrap(), Value::Int(104)));
        assert!(matches!(e.item("c").get_value().unwrap(), Value::Int(7)));
    }
}

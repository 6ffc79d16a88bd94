//! The reference algebra: a symbolic expression tree mirroring operations on
//! live container fields. Every operator applied to a [`Ref`] builds a new
//! pure-value node instead of performing the operation immediately.
//!
//! References are handles into an arena shared by every `Ref` issued from one
//! [`Manager`](crate::manager::Manager). The arena owns the actual node data
//! (including, for `Root` nodes, the user's container); a `Ref` is cheap to
//! clone, carries no borrowed lifetime, and compares/hashes by its stable
//! [`RefId`] rather than by structural value — equality between references
//! is symbolic (see [`Ref::eq`]), never identity-via-`PartialEq`.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

use indexmap::{IndexMap, IndexSet};

use crate::container::Container;
use crate::error::{ContainerError, ManagerError};
use crate::value::Value;

/// Stable identity of a node in the reference arena. Used as the key for
/// every manager-side index (`rdeps`, `deptasks`, `tartasks`, `containers`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RefId(pub(crate) u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    FloorDiv,
    Rem,
    Pow,
    BitAnd,
    BitOr,
    BitXor,
    Shl,
    Shr,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnOp {
    Neg,
    Pos,
    Invert,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Builtin {
    Abs,
    Round,
    Trunc,
    Floor,
    Ceil,
    ToInt,
    ToFloat,
    ToComplex,
}

impl BinOp {
    fn symbol(self) -> &'static str {
        match self {
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::Div => "/",
            BinOp::FloorDiv => "//",
            BinOp::Rem => "%",
            BinOp::Pow => "**",
            BinOp::BitAnd => "&",
            BinOp::BitOr => "|",
            BinOp::BitXor => "^",
            BinOp::Shl => "<<",
            BinOp::Shr => ">>",
            BinOp::Eq => "==",
            BinOp::Ne => "!=",
            BinOp::Lt => "<",
            BinOp::Le => "<=",
            BinOp::Gt => ">",
            BinOp::Ge => ">=",
        }
    }

    fn apply(self, lhs: &Value, rhs: &Value) -> Value {
        match self {
            BinOp::Add => lhs.add(rhs),
            BinOp::Sub => lhs.sub(rhs),
            BinOp::Mul => lhs.mul(rhs),
            BinOp::Div => lhs.div(rhs),
            BinOp::FloorDiv => lhs.floordiv(rhs),
            BinOp::Rem => lhs.rem(rhs),
            BinOp::Pow => lhs.pow(rhs),
            BinOp::BitAnd => lhs.bitand(rhs),
            BinOp::BitOr => lhs.bitor(rhs),
            BinOp::BitXor => lhs.bitxor(rhs),
            BinOp::Shl => lhs.shl(rhs),
            BinOp::Shr => lhs.shr(rhs),
            BinOp::Eq => Value::Bool(lhs.value_eq(rhs)),
            BinOp::Ne => Value::Bool(!lhs.value_eq(rhs)),
            BinOp::Lt => Value::Bool(lhs.partial_cmp(rhs) == Some(std::cmp::Ordering::Less)),
            BinOp::Le => Value::Bool(matches!(
                lhs.partial_cmp(rhs),
                Some(std::cmp::Ordering::Less | std::cmp::Ordering::Equal)
            )),
            BinOp::Gt => Value::Bool(lhs.partial_cmp(rhs) == Some(std::cmp::Ordering::Greater)),
            BinOp::Ge => Value::Bool(matches!(
                lhs.partial_cmp(rhs),
                Some(std::cmp::Ordering::Greater | std::cmp::Ordering::Equal)
            )),
        }
    }
}

impl UnOp {
    fn symbol(self) -> &'static str {
        match self {
            UnOp::Neg => "-",
            UnOp::Pos => "+",
            UnOp::Invert => "~",
        }
    }

    fn apply(self, v: &Value) -> Value {
        match self {
            UnOp::Neg => v.neg(),
            UnOp::Pos => v.pos(),
            UnOp::Invert => v.invert(),
        }
    }
}

impl Builtin {
    fn name(self) -> &'static str {
        match self {
            Builtin::Abs => "abs",
            Builtin::Round => "round",
            Builtin::Trunc => "trunc",
            Builtin::Floor => "floor",
            Builtin::Ceil => "ceil",
            Builtin::ToInt => "int",
            Builtin::ToFloat => "float",
            Builtin::ToComplex => "complex",
        }
    }

    fn apply(self, v: &Value) -> Value {
        match self {
            Builtin::Abs => v.abs(),
            Builtin::Round => v.round(),
            Builtin::Trunc => v.trunc(),
            Builtin::Floor => v.floor(),
            Builtin::Ceil => v.ceil(),
            Builtin::ToInt => v.to_int(),
            Builtin::ToFloat => v.to_float(),
            Builtin::ToComplex => v.to_complex(),
        }
    }
}

pub(crate) enum Node {
    Root {
        label: String,
        container: Box<dyn Container>,
    },
    Attr {
        owner: RefId,
        name: String,
    },
    Item {
        owner: RefId,
        key: RefId,
    },
    ItemDefault {
        owner: RefId,
        key: RefId,
        default: Value,
    },
    Literal(Value),
    BinOp {
        op: BinOp,
        lhs: RefId,
        rhs: RefId,
    },
    UnOp {
        op: UnOp,
        arg: RefId,
    },
    Builtin {
        op: Builtin,
        arg: RefId,
    },
    Call {
        name: String,
        func: Rc<dyn Fn(&[Value], &IndexMap<String, Value>) -> Value>,
        args: Vec<RefId>,
        kwargs: IndexMap<String, RefId>,
    },
}

/// Is this node a *location* (can be read from and written to a container),
/// as opposed to a pure derived value?
fn is_mutable(node: &Node) -> bool {
    matches!(
        node,
        Node::Root { .. } | Node::Attr { .. } | Node::Item { .. } | Node::ItemDefault { .. }
    )
}

/// Arena-wide memoization for `Attr`/`Item`/`ItemDefault` nodes, keyed by
/// owner plus a canonical rendering of the accessor (field name, or the
/// index key's [`render`]ed text). Without this, two unrelated `.item("a")`
/// calls on the same owner would allocate two distinct [`RefId`]s for what
/// is logically the same container field, and a write through one would
/// never be seen as a dependency of a task registered against the other.
#[derive(Default)]
pub(crate) struct Arena {
    nodes: Vec<Node>,
    attrs: HashMap<(RefId, String), RefId>,
    items: HashMap<(RefId, String), RefId>,
    items_default: HashMap<(RefId, String, String), RefId>,
}

impl Arena {
    fn alloc(&mut self, node: Node) -> RefId {
        let id = RefId(self.nodes.len() as u64);
        self.nodes.push(node);
        id
    }

    pub(crate) fn node(&self, id: RefId) -> &Node {
        &self.nodes[id.0 as usize]
    }

    pub(crate) fn node_mut(&mut self, id: RefId) -> &mut Node {
        &mut self.nodes[id.0 as usize]
    }

    fn intern_attr(&mut self, owner: RefId, name: &str) -> RefId {
        if let Some(&id) = self.attrs.get(&(owner, name.to_owned())) {
            return id;
        }
        let id = self.alloc(Node::Attr {
            owner,
            name: name.to_owned(),
        });
        self.attrs.insert((owner, name.to_owned()), id);
        id
    }

    fn intern_item(&mut self, owner: RefId, key: RefId) -> RefId {
        let key_str = render(self, key);
        if let Some(&id) = self.items.get(&(owner, key_str.clone())) {
            return id;
        }
        let id = self.alloc(Node::Item { owner, key });
        self.items.insert((owner, key_str), id);
        id
    }

    fn intern_item_default(&mut self, owner: RefId, key: RefId, default: Value) -> RefId {
        let key_str = render(self, key);
        let default_str = default.to_string();
        let cache_key = (owner, key_str, default_str);
        if let Some(&id) = self.items_default.get(&cache_key) {
            return id;
        }
        let id = self.alloc(Node::ItemDefault { owner, key, default });
        self.items_default.insert(cache_key, id);
        id
    }
}

/// A symbolic handle to a container field or a derived value.
///
/// Cloning a `Ref` is cheap (it clones a `Rc` and a `u64`); all clones refer
/// to the same underlying arena node. Two `Ref`s are the *same reference*
/// iff their [`RefId`]s match — `Ref` deliberately does not implement
/// `std::cmp::PartialEq`, since `a == b` in this algebra must construct a new
/// expression (an [`BinOp::Eq`] node), not answer a boolean question about
/// identity. Use [`Ref::id`] to compare/hash references themselves.
#[derive(Clone)]
pub struct Ref {
    pub(crate) id: RefId,
    pub(crate) arena: Rc<RefCell<Arena>>,
}

/// Converts either a [`Ref`] or a value literal into an arena node id,
/// lifting literals into fresh [`Node::Literal`] entries. This is what lets
/// `r.add(5)` and `r.add(other_ref)` both type-check.
pub trait IntoOperand {
    fn into_ref_id(self, arena: &Rc<RefCell<Arena>>) -> RefId;
}

impl IntoOperand for Ref {
    fn into_ref_id(self, _arena: &Rc<RefCell<Arena>>) -> RefId {
        self.id
    }
}

impl IntoOperand for &Ref {
    fn into_ref_id(self, _arena: &Rc<RefCell<Arena>>) -> RefId {
        self.id
    }
}

impl<T: Into<Value>> IntoOperand for T {
    fn into_ref_id(self, arena: &Rc<RefCell<Arena>>) -> RefId {
        arena.borrow_mut().alloc(Node::Literal(self.into()))
    }
}

impl Ref {
    pub(crate) fn new(id: RefId, arena: Rc<RefCell<Arena>>) -> Self {
        Ref { id, arena }
    }

    pub(crate) fn from_arena(arena: Rc<RefCell<Arena>>, id: RefId) -> Self {
        Ref { id, arena }
    }

    pub fn id(&self) -> RefId {
        self.id
    }

    fn sibling(&self, id: RefId) -> Ref {
        Ref {
            id,
            arena: self.arena.clone(),
        }
    }

    pub(crate) fn root_label(arena: &Rc<RefCell<Arena>>, container: Box<dyn Container>, label: &str) -> Ref {
        let id = arena.borrow_mut().alloc(Node::Root {
            label: label.to_owned(),
            container,
        });
        Ref {
            id,
            arena: arena.clone(),
        }
    }

    /// `owner.name`. Repeated calls with the same owner and name resolve to
    /// the same [`RefId`] (see [`Arena::intern_attr`]).
    pub fn attr(&self, name: impl Into<String>) -> Ref {
        let name = name.into();
        let id = self.arena.borrow_mut().intern_attr(self.id, &name);
        self.sibling(id)
    }

    /// `owner[key]`. Repeated calls with the same owner and key resolve to
    /// the same [`RefId`] (see [`Arena::intern_item`]).
    pub fn item(&self, key: impl IntoOperand) -> Ref {
        let key_id = key.into_ref_id(&self.arena);
        let id = self.arena.borrow_mut().intern_item(self.id, key_id);
        self.sibling(id)
    }

    /// `owner[key]`, materializing `default` into the container on a miss.
    /// Repeated calls with the same owner, key and default resolve to the
    /// same [`RefId`]; a different default at the same location allocates a
    /// distinct node instead of silently reusing the earlier one.
    pub fn item_default(&self, key: impl IntoOperand, default: Value) -> Ref {
        let key_id = key.into_ref_id(&self.arena);
        let id = self.arena.borrow_mut().intern_item_default(self.id, key_id, default);
        self.sibling(id)
    }

    fn binop(&self, op: BinOp, rhs: RefId) -> Ref {
        let id = self.arena.borrow_mut().alloc(Node::BinOp {
            op,
            lhs: self.id,
            rhs,
        });
        self.sibling(id)
    }

    fn unop(&self, op: UnOp) -> Ref {
        let id = self.arena.borrow_mut().alloc(Node::UnOp { op, arg: self.id });
        self.sibling(id)
    }

    fn builtin(&self, op: Builtin) -> Ref {
        let id = self.arena.borrow_mut().alloc(Node::Builtin { op, arg: self.id });
        self.sibling(id)
    }

    // -- symbolic comparisons: named methods, never `PartialEq`/`PartialOrd` --

    pub fn eq(&self, rhs: impl IntoOperand) -> Ref {
        let rhs_id = rhs.into_ref_id(&self.arena);
        self.binop(BinOp::Eq, rhs_id)
    }

    pub fn ne(&self, rhs: impl IntoOperand) -> Ref {
        let rhs_id = rhs.into_ref_id(&self.arena);
        self.binop(BinOp::Ne, rhs_id)
    }

    pub fn lt(&self, rhs: impl IntoOperand) -> Ref {
        let rhs_id = rhs.into_ref_id(&self.arena);
        self.binop(BinOp::Lt, rhs_id)
    }

    pub fn le(&self, rhs: impl IntoOperand) -> Ref {
        let rhs_id = rhs.into_ref_id(&self.arena);
        self.binop(BinOp::Le, rhs_id)
    }

    pub fn gt(&self, rhs: impl IntoOperand) -> Ref {
        let rhs_id = rhs.into_ref_id(&self.arena);
        self.binop(BinOp::Gt, rhs_id)
    }

    pub fn ge(&self, rhs: impl IntoOperand) -> Ref {
        let rhs_id = rhs.into_ref_id(&self.arena);
        self.binop(BinOp::Ge, rhs_id)
    }

    pub fn floordiv(&self, rhs: impl IntoOperand) -> Ref {
        let rhs_id = rhs.into_ref_id(&self.arena);
        self.binop(BinOp::FloorDiv, rhs_id)
    }

    pub fn pow(&self, rhs: impl IntoOperand) -> Ref {
        let rhs_id = rhs.into_ref_id(&self.arena);
        self.binop(BinOp::Pow, rhs_id)
    }

    pub fn pos(&self) -> Ref {
        self.unop(UnOp::Pos)
    }

    pub fn abs(&self) -> Ref {
        self.builtin(Builtin::Abs)
    }

    pub fn round(&self) -> Ref {
        self.builtin(Builtin::Round)
    }

    pub fn trunc(&self) -> Ref {
        self.builtin(Builtin::Trunc)
    }

    pub fn floor(&self) -> Ref {
        self.builtin(Builtin::Floor)
    }

    pub fn ceil(&self) -> Ref {
        self.builtin(Builtin::Ceil)
    }

    pub fn to_int(&self) -> Ref {
        self.builtin(Builtin::ToInt)
    }

    pub fn to_float(&self) -> Ref {
        self.builtin(Builtin::ToFloat)
    }

    pub fn to_complex(&self) -> Ref {
        self.builtin(Builtin::ToComplex)
    }

    /// Calls `func` (identified by `name` for display/dump purposes) with
    /// the values of `args`/`kwargs` at evaluation time. Pure; the result is
    /// a derived value, never itself settable.
    pub fn call(
        &self,
        name: impl Into<String>,
        func: Rc<dyn Fn(&[Value], &IndexMap<String, Value>) -> Value>,
        args: Vec<Ref>,
        kwargs: Vec<(String, Ref)>,
    ) -> Ref {
        let arg_ids = args.into_iter().map(|r| r.id).collect();
        let kwarg_ids = kwargs.into_iter().map(|(k, r)| (k, r.id)).collect();
        let id = self.arena.borrow_mut().alloc(Node::Call {
            name: name.into(),
            func,
            args: arg_ids,
            kwargs: kwarg_ids,
        });
        self.sibling(id)
    }

    /// `x.compound(op, y)` returns the expression to assign back via
    /// `set_value`, implementing `x ⊙= y` without Rust's in-place
    /// `AddAssign`-style traits (which cannot return a new `Ref`). If `x`
    /// currently holds a bound expression, that expression is combined with
    /// `y`; otherwise `x`'s live value is read and combined with `y`.
    pub fn compound(&self, op: BinOp, rhs: impl IntoOperand, bound_expr: Option<&Ref>) -> Result<Ref, ManagerError> {
        let rhs_id = rhs.into_ref_id(&self.arena);
        let lhs_id = match bound_expr {
            Some(expr) => expr.id,
            None => {
                let v = self.get_value()?;
                self.arena.borrow_mut().alloc(Node::Literal(v))
            }
        };
        let id = self
            .arena
            .borrow_mut()
            .alloc(Node::BinOp { op, lhs: lhs_id, rhs: rhs_id });
        Ok(self.sibling(id))
    }

    /// Materialize the current value, recursively evaluating children. A
    /// missing key under `item_default` is written into the container as a
    /// side effect (see [`eval`]).
    pub fn get_value(&self) -> Result<Value, ManagerError> {
        let mut arena = self.arena.borrow_mut();
        eval(&mut arena, self.id)
    }

    /// Is this a location that `set_value` can write to?
    pub fn is_mutable(&self) -> bool {
        is_mutable(self.arena.borrow().node(self.id))
    }

    /// Write `value` directly into the underlying container. Only defined
    /// for `Root`/`Attr`/`Item`/`ItemDefault` variants.
    pub fn set_value(&self, value: Value) -> Result<(), ManagerError> {
        let mut arena = self.arena.borrow_mut();
        set_value(&mut arena, self.id, value)
    }

    /// Append every mutable reference reachable from this node into `out`,
    /// in first-visit order, without duplicates.
    pub fn get_dependencies(&self, out: &mut IndexSet<RefId>) {
        let arena = self.arena.borrow();
        collect_deps(&arena, self.id, out);
    }

    /// Returns the root ancestor this reference is ultimately rooted at, if
    /// it is rooted in a single container (all non-`Call` variants are).
    pub fn root_of(&self) -> Option<RefId> {
        let arena = self.arena.borrow();
        root_of(&arena, self.id)
    }

    /// Canonical textual rendering used by `Manager::dump`.
    pub fn to_canonical_string(&self) -> String {
        let arena = self.arena.borrow();
        render(&arena, self.id)
    }

    /// Clones the container this ref owns, if it is a `Root` node. Used by
    /// `Manager::copy` to build an independent set of containers before
    /// deep-copying the arena onto them.
    pub(crate) fn clone_root_container(&self) -> Option<Box<dyn Container>> {
        match self.arena.borrow().node(self.id) {
            Node::Root { container, .. } => Some(container.clone_box()),
            _ => None,
        }
    }

    /// If this is an `Attr`/`Item`/`ItemDefault` node, returns
    /// `(owner, key-as-value, is_attr)` — used by the manager to recognize
    /// writes landing on a parent ref tracked by an `Inheritance` task.
    pub(crate) fn owner_event(&self) -> Option<(RefId, Value, bool)> {
        let mut arena = self.arena.borrow_mut();
        match arena.node(self.id) {
            Node::Attr { owner, name } => {
                let owner = *owner;
                let name = name.clone();
                Some((owner, Value::Str(name), true))
            }
            Node::Item { owner, key } | Node::ItemDefault { owner, key, .. } => {
                let owner = *owner;
                let key = *key;
                let key_val = eval(&mut arena, key).ok()?;
                Some((owner, key_val, false))
            }
            _ => None,
        }
    }
}

/// Recursively duplicates the node at `old_id` (and everything it reaches)
/// into `new_arena`, remapping `Root` ancestors through `root_map`. Returns
/// `None` if a `Root` is reached that has no entry in `root_map` (the
/// reference is rooted outside the set of containers being cloned onto).
pub(crate) fn deep_copy(
    old_arena: &Arena,
    old_id: RefId,
    new_arena: &mut Arena,
    root_map: &std::collections::HashMap<RefId, RefId>,
    memo: &mut std::collections::HashMap<RefId, RefId>,
) -> Option<RefId> {
    if let Some(&id) = memo.get(&old_id) {
        return Some(id);
    }
    let new_id = match old_arena.node(old_id) {
        Node::Root { .. } => *root_map.get(&old_id)?,
        Node::Literal(v) => new_arena.alloc(Node::Literal(v.clone())),
        Node::Attr { owner, name } => {
            let new_owner = deep_copy(old_arena, *owner, new_arena, root_map, memo)?;
            new_arena.intern_attr(new_owner, name)
        }
        Node::Item { owner, key } => {
            let new_owner = deep_copy(old_arena, *owner, new_arena, root_map, memo)?;
            let new_key = deep_copy(old_arena, *key, new_arena, root_map, memo)?;
            new_arena.intern_item(new_owner, new_key)
        }
        Node::ItemDefault { owner, key, default } => {
            let new_owner = deep_copy(old_arena, *owner, new_arena, root_map, memo)?;
            let new_key = deep_copy(old_arena, *key, new_arena, root_map, memo)?;
            new_arena.intern_item_default(new_owner, new_key, default.clone())
        }
        Node::BinOp { op, lhs, rhs } => {
            let l = deep_copy(old_arena, *lhs, new_arena, root_map, memo)?;
            let r = deep_copy(old_arena, *rhs, new_arena, root_map, memo)?;
            new_arena.alloc(Node::BinOp { op: *op, lhs: l, rhs: r })
        }
        Node::UnOp { op, arg } => {
            let a = deep_copy(old_arena, *arg, new_arena, root_map, memo)?;
            new_arena.alloc(Node::UnOp { op: *op, arg: a })
        }
        Node::Builtin { op, arg } => {
            let a = deep_copy(old_arena, *arg, new_arena, root_map, memo)?;
            new_arena.alloc(Node::Builtin { op: *op, arg: a })
        }
        Node::Call { name, func, args, kwargs } => {
            let new_args = args
                .iter()
                .map(|a| deep_copy(old_arena, *a, new_arena, root_map, memo))
                .collect::<Option<Vec<_>>>()?;
            let mut new_kwargs = IndexMap::new();
            for (k, v) in kwargs {
                new_kwargs.insert(k.clone(), deep_copy(old_arena, *v, new_arena, root_map, memo)?);
            }
            new_arena.alloc(Node::Call {
                name: name.clone(),
                func: func.clone(),
                args: new_args,
                kwargs: new_kwargs,
            })
        }
    };
    memo.insert(old_id, new_id);
    Some(new_id)
}

fn root_of(arena: &Arena, id: RefId) -> Option<RefId> {
    match arena.node(id) {
        Node::Root { .. } => Some(id),
        Node::Attr { owner, .. } | Node::Item { owner, .. } | Node::ItemDefault { owner, .. } => {
            root_of(arena, *owner)
        }
        _ => None,
    }
}

fn collect_deps(arena: &Arena, id: RefId, out: &mut IndexSet<RefId>) {
    let node = arena.node(id);
    if is_mutable(node) {
        out.insert(id);
    }
    match node {
        Node::Root { .. } | Node::Literal(_) => {}
        Node::Attr { owner, .. } => collect_deps(arena, *owner, out),
        Node::Item { owner, key } => {
            collect_deps(arena, *owner, out);
            collect_deps(arena, *key, out);
        }
        Node::ItemDefault { owner, key, .. } => {
            collect_deps(arena, *owner, out);
            collect_deps(arena, *key, out);
        }
        Node::BinOp { lhs, rhs, .. } => {
            collect_deps(arena, *lhs, out);
            collect_deps(arena, *rhs, out);
        }
        Node::UnOp { arg, .. } | Node::Builtin { arg, .. } => collect_deps(arena, *arg, out),
        Node::Call { args, kwargs, .. } => {
            for a in args {
                collect_deps(arena, *a, out);
            }
            for v in kwargs.values() {
                collect_deps(arena, *v, out);
            }
        }
    }
}

/// Materializes the value at `id`, recursing into children. Takes the arena
/// mutably because `ItemDefault` writes its default back into the owning
/// container on a miss (SPEC_FULL.md §4.2).
fn eval(arena: &mut Arena, id: RefId) -> Result<Value, ManagerError> {
    match arena.node(id) {
        Node::Root { .. } => Err(ContainerError::NotAttributable.into()),
        Node::Literal(v) => Ok(v.clone()),
        Node::Attr { owner, name } => {
            let owner = *owner;
            let name = name.clone();
            let container = container_of(arena, owner)?;
            container.get_attr(&name).map_err(ManagerError::from)
        }
        Node::Item { owner, key } => {
            let owner = *owner;
            let key = *key;
            let key_val = eval(arena, key)?;
            let container = container_of(arena, owner)?;
            container.get_item(&key_val).map_err(|e| match e {
                ContainerError::NoSuchItem => ManagerError::MissingKey,
                other => other.into(),
            })
        }
        Node::ItemDefault { owner, key, default } => {
            let owner = *owner;
            let key = *key;
            let default = default.clone();
            let key_val = eval(arena, key)?;
            let has = container_of(arena, owner)?.has_item(&key_val);
            if has {
                container_of(arena, owner)?.get_item(&key_val).map_err(ManagerError::from)
            } else {
                container_of_mut(arena, owner)?
                    .set_item(&key_val, default.clone())
                    .map_err(ManagerError::from)?;
                Ok(default)
            }
        }
        Node::BinOp { op, lhs, rhs } => {
            let op = *op;
            let lhs = *lhs;
            let rhs = *rhs;
            let l = eval(arena, lhs)?;
            let r = eval(arena, rhs)?;
            Ok(op.apply(&l, &r))
        }
        Node::UnOp { op, arg } => {
            let op = *op;
            let arg = *arg;
            let v = eval(arena, arg)?;
            Ok(op.apply(&v))
        }
        Node::Builtin { op, arg } => {
            let op = *op;
            let arg = *arg;
            let v = eval(arena, arg)?;
            Ok(op.apply(&v))
        }
        Node::Call { func, args, kwargs, .. } => {
            let func = func.clone();
            let args = args.clone();
            let kwargs = kwargs.clone();
            let mut arg_vals = Vec::with_capacity(args.len());
            for a in &args {
                arg_vals.push(eval(arena, *a)?);
            }
            let mut kwarg_vals = IndexMap::new();
            for (k, v) in &kwargs {
                kwarg_vals.insert(k.clone(), eval(arena, *v)?);
            }
            Ok(func(&arg_vals, &kwarg_vals))
        }
    }
}

fn container_of(arena: &Arena, owner: RefId) -> Result<&dyn Container, ManagerError> {
    match arena.node(owner) {
        Node::Root { container, .. } => Ok(container.as_ref()),
        _ => Err(ContainerError::NotAttributable.into()),
    }
}

fn set_value(arena: &mut Arena, id: RefId, value: Value) -> Result<(), ManagerError> {
    match arena.node_mut(id) {
        Node::Root { .. } => Err(ContainerError::NotAttributable.into()),
        Node::Attr { owner, name } => {
            let owner = *owner;
            let name = name.clone();
            let container = container_of_mut(arena, owner)?;
            container.set_attr(&name, value).map_err(ManagerError::from)
        }
        Node::Item { owner, key } | Node::ItemDefault { owner, key, .. } => {
            let owner = *owner;
            let key = *key;
            let key_val = eval(arena, key)?;
            let container = container_of_mut(arena, owner)?;
            container.set_item(&key_val, value).map_err(ManagerError::from)
        }
        _ => Err(ManagerError::EvaluationError(anyhow::anyhow!(
            "cannot assign to a pure-value reference"
        ))),
    }
}

fn container_of_mut(arena: &mut Arena, owner: RefId) -> Result<&mut dyn Container, ManagerError> {
    match arena.node_mut(owner) {
        Node::Root { container, .. } => Ok(container.as_mut()),
        _ => Err(ContainerError::NotAttributable.into()),
    }
}

fn render(arena: &Arena, id: RefId) -> String {
    match arena.node(id) {
        Node::Root { label, .. } => label.clone(),
        Node::Literal(v) => v.to_string(),
        Node::Attr { owner, name } => format!("{}.{}", render(arena, *owner), name),
        Node::Item { owner, key } => format!("{}[{}]", render(arena, *owner), render(arena, *key)),
        Node::ItemDefault { owner, key, .. } => format!("{}[{}]", render(arena, *owner), render(arena, *key)),
        Node::BinOp { op, lhs, rhs } => {
            format!("({} {} {})", render(arena, *lhs), op.symbol(), render(arena, *rhs))
        }
        Node::UnOp { op, arg } => format!("({}{})", op.symbol(), render(arena, *arg)),
        Node::Builtin { op, arg } => format!("{}({})", op.name(), render(arena, *arg)),
        Node::Call { name, args, kwargs, .. } => {
            let mut parts: Vec<String> = args.iter().map(|a| render(arena, *a)).collect();
            for (k, v) in kwargs {
                parts.push(format!("{k}={}", render(arena, *v)));
            }
            format!("{name}({})", parts.join(", "))
        }
    }
}

impl fmt::Debug for Ref {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Ref({:?}: {})", self.id, self.to_canonical_string())
    }
}

impl fmt::Display for Ref {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_canonical_string())
    }
}

macro_rules! impl_binop_trait {
    ($trait:ident, $method:ident, $variant:expr) => {
        impl<Rhs: IntoOperand> std::ops::$trait<Rhs> for Ref {
            type Output = Ref;
            fn $method(self, rhs: Rhs) -> Ref {
                let rhs_id = rhs.into_ref_id(&self.arena);
                self.binop($variant, rhs_id)
            }
        }
    };
}

impl_binop_trait!(Add, add, BinOp::Add);
impl_binop_trait!(Sub, sub, BinOp::Sub);
impl_binop_trait!(Mul, mul, BinOp::Mul);
impl_binop_trait!(Div, div, BinOp::Div);
impl_binop_trait!(Rem, rem, BinOp::Rem);
impl_binop_trait!(BitAnd, bitand, BinOp::BitAnd);
impl_binop_trait!(BitOr, bitor, BinOp::BitOr);
impl_binop_trait!(BitXor, bitxor, BinOp::BitXor);
impl_binop_trait!(Shl, shl, BinOp::Shl);
impl_binop_trait!(Shr, shr, BinOp::Shr);

impl std::ops::Neg for Ref {
    type Output = Ref;
    fn neg(self) -> Ref {
        self.unop(UnOp::Neg)
    }
}

impl std::ops::Not for Ref {
    type Output = Ref;
    fn not(self) -> Ref {
        self.unop(UnOp::Invert)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::Record;

    fn root(arena: &Rc<RefCell<Arena>>, label: &str) -> Ref {
        Ref::root_label(arena, Box::new(Record::new()), label)
    }

    #[test]
    fn chained_arithmetic() {
        let arena = Rc::new(RefCell::new(Arena::default()));
        let v = root(&arena, "v");
        v.item("a").set_value(Value::Int(3)).unwrap();
        v.item("b").set_value(Value::Int(4)).unwrap();
        let c = v.item("a") + v.item("b");
        assert!(matches!(c.get_value().unwrap(), Value::Int(7)));
    }

    #[test]
    fn repeated_item_calls_intern_to_the_same_ref() {
        let arena = Rc::new(RefCell::new(Arena::default()));
        let v = root(&arena, "v");
        v.item("a").set_value(Value::Int(5)).unwrap();
        let a1 = v.item("a");
        let a2 = v.item("a");
        assert_eq!(a1.id(), a2.id());
    }

    #[test]
    fn eq_builds_a_symbolic_comparison_node() {
        let arena = Rc::new(RefCell::new(Arena::default()));
        let v = root(&arena, "v");
        v.item("a").set_value(Value::Int(5)).unwrap();
        v.item("b").set_value(Value::Int(5)).unwrap();
        let cmp = v.item("a").eq(v.item("b"));
        assert!(matches!(cmp.get_value().unwrap(), Value::Bool(true)));
    }

    #[test]
    fn division_by_zero_yields_nan_not_error() {
        let arena = Rc::new(RefCell::new(Arena::default()));
        let v = root(&arena, "v");
        v.item("a").set_value(Value::Int(1)).unwrap();
        v.item("z").set_value(Value::Int(0)).unwrap();
        let r = v.item("a") / v.item("z");
        let val = r.get_value().unwrap();
        assert!(val.is_nan());
    }

    #[test]
    fn item_default_materializes_missing_key() {
        let arena = Rc::new(RefCell::new(Arena::default()));
        let v = root(&arena, "v");
        let d = v.item_default("missing", Value::Int(42));
        assert!(matches!(d.get_value().unwrap(), Value::Int(42)));

        // the default must have been written into the container, not just
        // handed back transiently: a plain (non-default) read now succeeds.
        assert!(matches!(v.item("missing").get_value().unwrap(), Value::Int(42)));
    }

    #[test]
    fn canonical_rendering_round_trips_shape() {
        let arena = Rc::new(RefCell::new(Arena::default()));
        let v = root(&arena, "v");
        let expr = v.item("a") + v.item("b");
        assert_eq!(expr.to_canonical_string(), "(v[\"a\"] + v[\"b\"])");
    }
}

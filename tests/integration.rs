//! End-to-end scenarios exercising the public API: chained arithmetic,
//! expression removal, a diamond dependency, cycle rejection, inheritance
//! replay, and clone isolation.

use std::cell::RefCell;
use std::rc::Rc;

use depweave::{Manager, ManagerError, Record, Task, Value};

#[test]
fn s1_chained_arithmetic() {
    let mut m = Manager::new();
    let v = m.register_container(Box::new(Record::new()), "v").unwrap();
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
    let mut m = Manager::new();
    let v = m.register_container(Box::new(Record::new()), "v").unwrap();
    let e = m.register_container(Box::new(Record::new()), "e").unwrap();

    m.set_value(&v.item("a"), Value::Int(3)).unwrap();
    m.set_value(&v.item("b"), Value::Int(4)).unwrap();
    m.set_value(&e.item("c"), v.item("a") + v.item("b")).unwrap();
    m.set_value(&e.item("d"), e.item("c") * 2i64).unwrap();

    m.set_value(&e.item("d"), Value::Int(99)).unwrap();

    m.set_value(&v.item("a"), Value::Int(1)).unwrap();
    assert!(matches!(e.item("c").get_value().unwrap(), Value::Int(5)));
    assert!(matches!(e.item("d").get_value().unwrap(), Value::Int(99)));
}

#[test]
fn s3_diamond_runs_downstream_exactly_once() {
    let mut m = Manager::new();
    let r = m.register_container(Box::new(Record::new()), "r").unwrap();

    m.set_value(&r.item("a"), Value::Int(1)).unwrap();
    m.set_value(&r.item("b"), Value::Int(2)).unwrap();
    m.set_value(&r.item("x"), r.item("a") + r.item("b")).unwrap();
    m.set_value(&r.item("y"), r.item("a") * 2i64).unwrap();

    let runs = Rc::new(RefCell::new(0));
    let runs_in_action = runs.clone();
    let x = r.item("x");
    let y = r.item("y");
    let z = r.item("z");

    let id = m.next_task_id();
    m.register(Task::Generic {
        id,
        targets: vec![z.clone()],
        deps: vec![x.clone(), y.clone()],
        action: Rc::new(move |_mgr| {
            *runs_in_action.borrow_mut() += 1;
            let xv = x.get_value()?.as_f64().unwrap_or(0.0);
            let yv = y.get_value()?.as_f64().unwrap_or(0.0);
            z.set_value(Value::Float(xv + yv))?;
            Ok(())
        }),
    })
    .unwrap();

    m.set_value(&r.item("a"), Value::Int(10)).unwrap();

    assert_eq!(*runs.borrow(), 1, "z's task must run exactly once per upstream write");
    assert!(matches!(r.item("x").get_value().unwrap(), Value::Int(12)));
    assert!(matches!(r.item("y").get_value().unwrap(), Value::Int(20)));
    match r.item("z").get_value().unwrap() {
        Value::Float(f) => assert!((f - 32.0).abs() < 1e-9),
        other => panic!("expected float, got {other:?}"),
    }
}

#[test]
fn s4_cycle_rejection() {
    let mut m = Manager::new();
    let v = m.register_container(Box::new(Record::new()), "v").unwrap();

    m.set_value(&v.item("a"), Value::Int(1)).unwrap();
    m.set_value(&v.item("b"), v.item("a") + 1i64).unwrap();

    let err = m.set_value(&v.item("a"), v.item("b") + 1i64);
    assert!(matches!(err, Err(ManagerError::CycleDetected(_))));

    // the manager must be left exactly as it was before the rejected write
    assert!(matches!(v.item("a").get_value().unwrap(), Value::Int(1)));
    assert!(matches!(v.item("b").get_value().unwrap(), Value::Int(2)));
    assert!(m.verify().consistent);
}

#[test]
fn s5_inheritance_is_not_override_sticky() {
    let mut m = Manager::new();
    let p = m.register_container(Box::new(Record::new()), "P").unwrap();
    let c = m.register_container(Box::new(Record::new()), "C").unwrap();

    m.register(Task::inheritance(vec![c.clone()], vec![p.clone()]).unwrap())
        .unwrap();

    m.set_value(&p.item("k"), Value::Int(5)).unwrap();
    assert!(matches!(c.item("k").get_value().unwrap(), Value::Int(5)));

    m.set_value(&c.item("k"), Value::Int(9)).unwrap();
    assert!(matches!(c.item("k").get_value().unwrap(), Value::Int(9)));

    m.set_value(&p.item("k"), Value::Int(7)).unwrap();
    assert!(matches!(c.item("k").get_value().unwrap(), Value::Int(7)));
}

#[test]
fn s6_clone_isolation() {
    use indexmap::IndexMap;

    let mut m = Manager::new();
    let v = m.register_container(Box::new(Record::new()), "v").unwrap();
    let e = m.register_container(Box::new(Record::new()), "e").unwrap();

    m.set_value(&v.item("a"), Value::Int(3)).unwrap();
    m.set_value(&v.item("b"), Value::Int(4)).unwrap();
    m.set_value(&e.item("c"), v.item("a") + v.item("b")).unwrap();

    let mut fresh: IndexMap<String, Box<dyn depweave::Container>> = IndexMap::new();
    fresh.insert("v".to_owned(), Box::new(Record::new()));
    fresh.insert("e".to_owned(), Box::new(Record::new()));
    let mut m2 = m.clone_onto(fresh).unwrap();

    let v2 = m2.container_ref("v").unwrap();
    let e2 = m2.container_ref("e").unwrap();

    m2.set_value(&v2.item("a"), Value::Int(100)).unwrap();
    assert!(matches!(e2.item("c").get_value().unwrap(), Value::Int(104)));
    assert!(matches!(e.item("c").get_value().unwrap(), Value::Int(7)));
}

//! Host objects driven from scripts

mod common;

use common::{counter_receiver, serial, start};
use hostbridge::prelude::*;
use hostbridge::testing::{PropertyBag, SharedBuffer};
use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

fn eval(ctx: &Context, script: &str) -> HostValue {
    let mut value = ctx.eval(script).unwrap();
    let host = value.interface();
    value.destroy();
    host
}

#[test]
fn test_script_uses_host_object() {
    let _guard = serial();
    let live = Arc::new(AtomicUsize::new(0));
    let (engine, _) = start(vec![counter_receiver(live.clone())]);
    let mut ctx = engine.new_context().unwrap();

    let result = eval(
        &ctx,
        r#"
        let c = Counter(5);
        let before = c["count"];
        c.invoke("increment");
        c["count"] = c["count"] * 10;
        let added = c.invoke("add", 1, 2, 3);
        [before, added, c.has("count"), c.has("missing")]
        "#,
    );

    assert_eq!(
        result,
        HostValue::List(vec![
            HostValue::Int(5),
            HostValue::Int(66),
            HostValue::Bool(true),
            HostValue::Bool(false),
        ])
    );

    ctx.destroy();
    engine.shutdown();
}

#[test]
fn test_instances_released_when_script_drops_them() {
    let _guard = serial();
    let live = Arc::new(AtomicUsize::new(0));
    let (engine, _) = start(vec![counter_receiver(live.clone())]);
    let receiver = engine.receiver("Counter").unwrap();
    let mut ctx = engine.new_context().unwrap();

    let result = eval(&ctx, r#"let c = Counter(1); c.invoke("increment")"#);

    assert_eq!(result, HostValue::Int(2));
    assert_eq!(receiver.len(), 0);
    assert_eq!(live.load(Ordering::SeqCst), 0);

    ctx.destroy();
    engine.shutdown();
}

#[test]
fn test_instances_live_with_their_context() {
    let _guard = serial();
    let live = Arc::new(AtomicUsize::new(0));
    let (engine, _) = start(vec![counter_receiver(live.clone())]);
    let receiver = engine.receiver("Counter").unwrap();
    let mut ctx = engine.new_context().unwrap();

    let mut script = tempfile::Builder::new().suffix(".rhai").tempfile().unwrap();
    writeln!(script, "let kept = Counter(7);").unwrap();
    ctx.exec(script.path()).unwrap();

    assert_eq!(receiver.len(), 1);
    assert_eq!(eval(&ctx, r#"kept.invoke("increment")"#), HostValue::Int(8));

    ctx.destroy();
    assert_eq!(receiver.len(), 0);
    assert_eq!(live.load(Ordering::SeqCst), 0);

    engine.shutdown();
}

#[test]
fn test_returned_object_owned_by_value() {
    let _guard = serial();
    let live = Arc::new(AtomicUsize::new(0));
    let (engine, runtime) = start(vec![counter_receiver(live.clone())]);
    let receiver = engine.receiver("Counter").unwrap();
    let mut ctx = engine.new_context().unwrap();

    let mut value = ctx.eval("Counter(3)").unwrap();
    assert_eq!(value.kind(), Kind::Object);
    assert_eq!(receiver.len(), 1);

    value.destroy();
    assert_eq!(receiver.len(), 0);
    assert_eq!(runtime.stats().live, 0);

    ctx.destroy();
    engine.shutdown();
}

#[test]
fn test_shutdown_clears_object_tables() {
    let _guard = serial();
    let live = Arc::new(AtomicUsize::new(0));
    let (engine, _) = start(vec![counter_receiver(live.clone())]);
    let receiver = engine.receiver("Counter").unwrap();
    let ctx = engine.new_context().unwrap();

    let mut script = tempfile::Builder::new().suffix(".rhai").tempfile().unwrap();
    writeln!(script, "let a = Counter(1); let b = Counter(2);").unwrap();
    ctx.exec(script.path()).unwrap();
    assert_eq!(receiver.len(), 2);

    engine.shutdown();

    assert!(receiver.is_empty());
    assert_eq!(live.load(Ordering::SeqCst), 0);
}

#[test]
fn test_constructor_failure_raises_script_error() {
    let _guard = serial();
    let live = Arc::new(AtomicUsize::new(0));
    let (engine, runtime) = start(vec![counter_receiver(live.clone())]);
    let receiver = engine.receiver("Counter").unwrap();
    let mut ctx = engine.new_context().unwrap();

    let err = ctx.eval(r#"Counter("not a number")"#).unwrap_err();
    assert!(err.to_string().contains("Failed to instantiate method receiver 'Counter'"));
    assert!(receiver.is_empty());
    assert_eq!(runtime.stats().live, 0);
    assert_eq!(runtime.stats().rejected, 0);

    ctx.destroy();
    engine.shutdown();
}

#[test]
fn test_method_error_is_catchable_in_script() {
    let _guard = serial();
    let (engine, _) = start(vec![PropertyBag::receiver("Bag")]);
    let mut ctx = engine.new_context().unwrap();

    let caught = eval(
        &ctx,
        r#"
        let bag = Bag();
        let outcome = "unreachable";
        try { bag.invoke("fail", "boom"); } catch (err) { outcome = "caught"; }
        outcome
        "#,
    );
    assert_eq!(caught, HostValue::from("caught"));

    let err = ctx.eval(r#"Bag().invoke("fail", "boom")"#).unwrap_err();
    assert!(err.to_string().contains("boom"));

    ctx.destroy();
    engine.shutdown();
}

#[test]
fn test_missing_property_reads_as_nothing() {
    let _guard = serial();
    let (engine, _) = start(vec![PropertyBag::receiver("Bag")]);
    let mut ctx = engine.new_context().unwrap();

    let result = eval(&ctx, r#"let bag = Bag(); type_of(bag["nothing"])"#);
    assert_eq!(result, HostValue::from("()"));

    let result = eval(&ctx, r#"let bag = Bag(); bag.invoke("get", "nothing")"#);
    assert_eq!(result, HostValue::Null);

    ctx.destroy();
    engine.shutdown();
}

#[test]
fn test_structured_values_cross_in_both_directions() {
    let _guard = serial();
    let (engine, runtime) = start(vec![PropertyBag::receiver("Bag")]);
    let mut ctx = engine.new_context().unwrap();

    let result = eval(
        &ctx,
        r#"
        let bag = Bag("first", 2);
        bag["list"] = [1, "two", 3.5];
        bag.invoke("set", "map", #{ nested: [true, ()] });
        [bag["arg0"], bag["arg1"], bag["list"], bag.invoke("get", "map"), bag.invoke("keys")]
        "#,
    );

    assert_eq!(
        result,
        HostValue::List(vec![
            HostValue::from("first"),
            HostValue::Int(2),
            HostValue::List(vec![HostValue::Int(1), "two".into(), HostValue::Float(3.5)]),
            HostValue::map([("nested", HostValue::List(vec![true.into(), HostValue::Null]))]),
            HostValue::from(vec!["arg0", "arg1", "list", "map"]),
        ])
    );

    ctx.destroy();
    assert_eq!(runtime.stats().live, 0);
    assert_eq!(runtime.stats().rejected, 0);
    engine.shutdown();
}

#[test]
fn test_object_methods_write_to_context_output() {
    let _guard = serial();
    let live = Arc::new(AtomicUsize::new(0));
    let (engine, _) = start(vec![counter_receiver(live)]);
    let mut ctx = engine.new_context().unwrap();
    let output = SharedBuffer::new();
    ctx.set_output(output.clone());

    let mut script = tempfile::Builder::new().suffix(".rhai").tempfile().unwrap();
    writeln!(script, "let c = Counter();").unwrap();
    writeln!(script, r#"for i in 0..3 {{ print(c.invoke("increment")); }}"#).unwrap();
    writeln!(script, r#"c.invoke("reset");"#).unwrap();
    writeln!(script, r#"echo(c["count"]);"#).unwrap();
    ctx.exec(script.path()).unwrap();

    assert_eq!(output.contents(), "1\n2\n3\n0");

    ctx.destroy();
    engine.shutdown();
}

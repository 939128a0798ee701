//! End-to-end persistence tests against in-memory SQLite: round-trips,
//! cycle closure, ownership-driven deletion, and polymorphic queries.

use strata_core::{
    ClassDef, ContainerKind, ContainerValue, ObjectSpace, PropertyDef, SemanticType, TypeRegistry,
    Value,
};
use strata_storage::Store;

fn shapes_registry() -> TypeRegistry {
    let mut reg = TypeRegistry::new();
    reg.register(ClassDef::interface("Drawable")).unwrap();
    reg.register(
        ClassDef::new("Shape").with_property(PropertyDef::new("color", SemanticType::Text)),
    )
    .unwrap();
    reg.register(
        ClassDef::new("ColoredShape")
            .extends("Shape")
            .implements("Drawable")
            .with_property(PropertyDef::new("weight", SemanticType::I32)),
    )
    .unwrap();
    reg.register(
        ClassDef::new("Canvas")
            .with_property(PropertyDef::new("name", SemanticType::Text))
            .with_property(PropertyDef::new("shape", SemanticType::reference("Shape"))),
    )
    .unwrap();
    reg
}

#[test]
fn scalar_round_trip() {
    let mut reg = TypeRegistry::new();
    reg.register(
        ClassDef::new("Sample")
            .with_property(PropertyDef::new("flag", SemanticType::Bool))
            .with_property(PropertyDef::new("small", SemanticType::I8))
            .with_property(PropertyDef::new("big", SemanticType::I64))
            .with_property(PropertyDef::new("ratio", SemanticType::F64))
            .with_property(PropertyDef::new("label", SemanticType::Text))
            .with_property(PropertyDef::new("body", SemanticType::LongText).no_index())
            .with_property(PropertyDef::new("blob", SemanticType::Bytes).no_index())
            .with_property(PropertyDef::new("at", SemanticType::Timestamp))
            .with_property(PropertyDef::new("hue", SemanticType::Enum("Color".into()))),
    )
    .unwrap();
    let mut store = Store::open_in_memory(reg).unwrap();

    let mut space = ObjectSpace::new();
    let h = space.create("Sample");
    space.set(h, "flag", Value::Bool(true)).unwrap();
    space.set(h, "small", Value::I8(-3)).unwrap();
    space.set(h, "big", Value::I64(1 << 40)).unwrap();
    space.set(h, "ratio", Value::F64(0.5)).unwrap();
    space.set(h, "label", Value::text("hello")).unwrap();
    space.set(h, "body", Value::long_text("a longer body")).unwrap();
    space.set(h, "blob", Value::Bytes(vec![9, 8, 7])).unwrap();
    space
        .set(h, "at", Value::Timestamp(1_700_000_000_000))
        .unwrap();
    space
        .set(h, "hue", Value::enumeration("Color", "Red"))
        .unwrap();

    let id = store.save(&space, h).unwrap();

    let mut out = ObjectSpace::new();
    let loaded = store.load(&mut out, "Sample", id).unwrap().unwrap();
    assert_eq!(out.field(loaded, "flag").unwrap(), &Value::Bool(true));
    assert_eq!(out.field(loaded, "small").unwrap(), &Value::I8(-3));
    assert_eq!(out.field(loaded, "big").unwrap(), &Value::I64(1 << 40));
    assert_eq!(out.field(loaded, "ratio").unwrap(), &Value::F64(0.5));
    assert_eq!(out.field(loaded, "label").unwrap(), &Value::text("hello"));
    assert_eq!(
        out.field(loaded, "body").unwrap(),
        &Value::long_text("a longer body")
    );
    assert_eq!(
        out.field(loaded, "blob").unwrap(),
        &Value::Bytes(vec![9, 8, 7])
    );
    assert_eq!(
        out.field(loaded, "at").unwrap(),
        &Value::Timestamp(1_700_000_000_000)
    );
    assert_eq!(
        out.field(loaded, "hue").unwrap(),
        &Value::enumeration("Color", "Red")
    );
}

#[test]
fn polymorphic_reference_round_trip() {
    let mut store = Store::open_in_memory(shapes_registry()).unwrap();
    let mut space = ObjectSpace::new();

    let shape = space.create("ColoredShape");
    space.set(shape, "color", Value::text("red")).unwrap();
    space.set(shape, "weight", Value::I32(12)).unwrap();
    let canvas = space.create("Canvas");
    space.set(canvas, "name", Value::text("main")).unwrap();
    space.set(canvas, "shape", Value::Ref(shape)).unwrap();

    let canvas_id = store.save(&space, canvas).unwrap();

    let mut out = ObjectSpace::new();
    let loaded = store.load(&mut out, "Canvas", canvas_id).unwrap().unwrap();
    let shape_ref = out
        .field(loaded, "shape")
        .unwrap()
        .as_handle()
        .expect("reference survives");
    // The declared type is Shape; the loaded instance is the concrete
    // subclass, found through the real-class pointer chain.
    assert_eq!(out.class_of(shape_ref).unwrap(), "ColoredShape");
    assert_eq!(out.field(shape_ref, "color").unwrap(), &Value::text("red"));
    assert_eq!(out.field(shape_ref, "weight").unwrap(), &Value::I32(12));
}

#[test]
fn nested_array_round_trip() {
    let mut reg = TypeRegistry::new();
    reg.register(ClassDef::new("Matrix").with_property(
        PropertyDef::new(
            "rows",
            SemanticType::array(SemanticType::array(SemanticType::I32)),
        )
        .no_index(),
    ))
    .unwrap();
    let mut store = Store::open_in_memory(reg).unwrap();

    let rows = Value::array(
        SemanticType::array(SemanticType::I32),
        vec![
            Value::array(SemanticType::I32, vec![Value::I32(1), Value::I32(2)]),
            Value::array(SemanticType::I32, vec![Value::I32(3), Value::Null]),
        ],
    );
    let mut space = ObjectSpace::new();
    let m = space.create("Matrix");
    space.set(m, "rows", rows.clone()).unwrap();
    let id = store.save(&space, m).unwrap();

    let mut out = ObjectSpace::new();
    let loaded = store.load(&mut out, "Matrix", id).unwrap().unwrap();
    assert_eq!(out.field(loaded, "rows").unwrap(), &rows);
}

#[test]
fn array_of_objects_round_trip() {
    let mut reg = shapes_registry();
    reg.register(
        ClassDef::new("Group").with_property(
            PropertyDef::new(
                "members",
                SemanticType::array(SemanticType::reference("Shape")),
            )
            .no_index(),
        ),
    )
    .unwrap();
    let mut store = Store::open_in_memory(reg).unwrap();

    let mut space = ObjectSpace::new();
    let a = space.create("Shape");
    space.set(a, "color", Value::text("red")).unwrap();
    let b = space.create("ColoredShape");
    space.set(b, "color", Value::text("blue")).unwrap();
    space.set(b, "weight", Value::I32(3)).unwrap();
    let group = space.create("Group");
    space
        .set(
            group,
            "members",
            Value::array(
                SemanticType::reference("Shape"),
                vec![Value::Ref(a), Value::Ref(b)],
            ),
        )
        .unwrap();

    let id = store.save(&space, group).unwrap();

    let mut out = ObjectSpace::new();
    let loaded = store.load(&mut out, "Group", id).unwrap().unwrap();
    let Value::Array(av) = out.field(loaded, "members").unwrap().clone() else {
        panic!("members should load as an array");
    };
    assert_eq!(av.elements.len(), 2);
    let first = av.elements[0].as_handle().unwrap();
    let second = av.elements[1].as_handle().unwrap();
    assert_eq!(out.class_of(first).unwrap(), "Shape");
    assert_eq!(out.field(first, "color").unwrap(), &Value::text("red"));
    assert_eq!(out.class_of(second).unwrap(), "ColoredShape");
    assert_eq!(out.field(second, "weight").unwrap(), &Value::I32(3));
}

fn nodes_registry() -> TypeRegistry {
    let mut reg = TypeRegistry::new();
    reg.register(
        ClassDef::new("Node")
            .with_property(PropertyDef::new("tag", SemanticType::Text))
            .with_property(PropertyDef::new("next", SemanticType::reference("Node"))),
    )
    .unwrap();
    reg
}

#[test]
fn self_reference_cycle_closes() {
    let mut store = Store::open_in_memory(nodes_registry()).unwrap();
    let mut space = ObjectSpace::new();
    let n = space.create("Node");
    space.set(n, "tag", Value::text("loop")).unwrap();
    space.set(n, "next", Value::Ref(n)).unwrap();

    let id = store.save(&space, n).unwrap();

    let mut out = ObjectSpace::new();
    let loaded = store.load(&mut out, "Node", id).unwrap().unwrap();
    assert_eq!(
        out.field(loaded, "next").unwrap().as_handle(),
        Some(loaded),
        "reloading reproduces the self-cycle"
    );
}

#[test]
fn mutual_cycle_closes() {
    let mut store = Store::open_in_memory(nodes_registry()).unwrap();
    let mut space = ObjectSpace::new();
    let a = space.create("Node");
    let b = space.create("Node");
    space.set(a, "tag", Value::text("a")).unwrap();
    space.set(b, "tag", Value::text("b")).unwrap();
    space.set(a, "next", Value::Ref(b)).unwrap();
    space.set(b, "next", Value::Ref(a)).unwrap();

    let id = store.save(&space, a).unwrap();

    let mut out = ObjectSpace::new();
    let a2 = store.load(&mut out, "Node", id).unwrap().unwrap();
    let b2 = out.field(a2, "next").unwrap().as_handle().unwrap();
    assert_ne!(a2, b2);
    assert_eq!(out.field(b2, "next").unwrap().as_handle(), Some(a2));
    assert_eq!(out.field(a2, "tag").unwrap(), &Value::text("a"));
    assert_eq!(out.field(b2, "tag").unwrap(), &Value::text("b"));
}

#[test]
fn ownership_cascade_deletes_unprotected() {
    let mut store = Store::open_in_memory(shapes_registry()).unwrap();
    let mut space = ObjectSpace::new();
    let shape = space.create("Shape");
    space.set(shape, "color", Value::text("red")).unwrap();
    let canvas = space.create("Canvas");
    space.set(canvas, "shape", Value::Ref(shape)).unwrap();

    let canvas_id = store.save(&space, canvas).unwrap();
    assert_eq!(store.count("Shape").unwrap(), 1);

    store.delete("Canvas", canvas_id).unwrap();
    assert_eq!(store.count("Canvas").unwrap(), 0);
    // The shape had no protector besides the canvas.
    assert_eq!(store.count("Shape").unwrap(), 0);
}

#[test]
fn externally_protected_object_survives_cascade() {
    let mut store = Store::open_in_memory(shapes_registry()).unwrap();
    let mut space = ObjectSpace::new();
    let shape = space.create("Shape");
    space.set(shape, "color", Value::text("red")).unwrap();
    let canvas = space.create("Canvas");
    space.set(canvas, "shape", Value::Ref(shape)).unwrap();

    let canvas_id = store.save(&space, canvas).unwrap();
    // Saving the shape in its own right protects it externally.
    store.save(&space, shape).unwrap();

    store.delete("Canvas", canvas_id).unwrap();
    assert_eq!(store.count("Shape").unwrap(), 1);

    // Explicit deletion always works, protection or not.
    let shape_id = store.row_id(shape).unwrap();
    store.delete("Shape", shape_id).unwrap();
    assert_eq!(store.count("Shape").unwrap(), 0);
}

#[test]
fn polymorphic_query_returns_concrete_subclasses() {
    let mut store = Store::open_in_memory(shapes_registry()).unwrap();
    let mut space = ObjectSpace::new();
    let plain = space.create("Shape");
    space.set(plain, "color", Value::text("grey")).unwrap();
    let colored = space.create("ColoredShape");
    space.set(colored, "color", Value::text("red")).unwrap();
    space.set(colored, "weight", Value::I32(5)).unwrap();
    store.save(&space, plain).unwrap();
    store.save(&space, colored).unwrap();

    let mut out = ObjectSpace::new();
    let by_shape = store.find_all(&mut out, "Shape").unwrap();
    assert_eq!(by_shape.len(), 2);
    let mut classes: Vec<&str> = by_shape
        .iter()
        .map(|h| out.class_of(*h).unwrap())
        .collect();
    classes.sort();
    assert_eq!(classes, vec!["ColoredShape", "Shape"]);

    // Querying by the interface finds only the implementer, correctly
    // typed.
    let by_drawable = store.find_all(&mut out, "Drawable").unwrap();
    assert_eq!(by_drawable.len(), 1);
    assert_eq!(out.class_of(by_drawable[0]).unwrap(), "ColoredShape");
    assert_eq!(
        out.field(by_drawable[0], "weight").unwrap(),
        &Value::I32(5)
    );
}

#[test]
fn unknown_class_reads_are_empty() {
    let mut store = Store::open_in_memory(shapes_registry()).unwrap();
    let mut space = ObjectSpace::new();
    assert!(store.find_all(&mut space, "Ghost").unwrap().is_empty());
    assert_eq!(store.count("Ghost").unwrap(), 0);
    assert!(store.load(&mut space, "Ghost", 1).unwrap().is_none());
    // Deletes of unknown classes are a quiet no-op too.
    store.delete("Ghost", 1).unwrap();
}

#[test]
fn resave_updates_in_place() {
    let mut store = Store::open_in_memory(shapes_registry()).unwrap();
    let mut space = ObjectSpace::new();
    let shape = space.create("Shape");
    space.set(shape, "color", Value::text("red")).unwrap();
    let id = store.save(&space, shape).unwrap();

    space.set(shape, "color", Value::text("green")).unwrap();
    let id2 = store.save(&space, shape).unwrap();
    assert_eq!(id, id2, "re-save must not allocate a new row");
    assert_eq!(store.count("Shape").unwrap(), 1);

    let mut out = ObjectSpace::new();
    let loaded = store.load(&mut out, "Shape", id).unwrap().unwrap();
    assert_eq!(out.field(loaded, "color").unwrap(), &Value::text("green"));
}

#[test]
fn resave_rewires_reference_and_collects_old_target() {
    let mut store = Store::open_in_memory(shapes_registry()).unwrap();
    let mut space = ObjectSpace::new();
    let s1 = space.create("Shape");
    space.set(s1, "color", Value::text("old")).unwrap();
    let canvas = space.create("Canvas");
    space.set(canvas, "shape", Value::Ref(s1)).unwrap();
    let canvas_id = store.save(&space, canvas).unwrap();

    let s2 = space.create("Shape");
    space.set(s2, "color", Value::text("new")).unwrap();
    space.set(canvas, "shape", Value::Ref(s2)).unwrap();
    store.save(&space, canvas).unwrap();

    // The old target lost its only protector and was collected.
    assert_eq!(store.count("Shape").unwrap(), 1);
    let mut out = ObjectSpace::new();
    let loaded = store.load(&mut out, "Canvas", canvas_id).unwrap().unwrap();
    let shape_ref = out.field(loaded, "shape").unwrap().as_handle().unwrap();
    assert_eq!(out.field(shape_ref, "color").unwrap(), &Value::text("new"));
}

#[test]
fn container_class_round_trips_through_snapshot() {
    let mut reg = TypeRegistry::new();
    reg.register(
        ClassDef::new("IntList")
            .with_property(PropertyDef::new("capacity", SemanticType::I32))
            .with_container(ContainerKind::List {
                element: SemanticType::I32,
            }),
    )
    .unwrap();
    let mut store = Store::open_in_memory(reg).unwrap();

    let mut space = ObjectSpace::new();
    let list = space.create("IntList");
    space.set(list, "capacity", Value::I32(16)).unwrap();
    space
        .set_container(
            list,
            ContainerValue::List(vec![Value::I32(4), Value::I32(5), Value::I32(6)]),
        )
        .unwrap();
    let id = store.save(&space, list).unwrap();

    let mut out = ObjectSpace::new();
    let loaded = store.load(&mut out, "IntList", id).unwrap().unwrap();
    let instance = out.get(loaded).unwrap();
    assert_eq!(
        instance.container,
        Some(ContainerValue::List(vec![
            Value::I32(4),
            Value::I32(5),
            Value::I32(6)
        ]))
    );
}

#[test]
fn shared_reference_loads_as_one_object() {
    let mut reg = shapes_registry();
    reg.register(
        ClassDef::new("Pair")
            .with_property(PropertyDef::new("left", SemanticType::reference("Shape")))
            .with_property(PropertyDef::new("right", SemanticType::reference("Shape"))),
    )
    .unwrap();
    let mut store = Store::open_in_memory(reg).unwrap();

    let mut space = ObjectSpace::new();
    let shared = space.create("Shape");
    space.set(shared, "color", Value::text("red")).unwrap();
    let pair = space.create("Pair");
    space.set(pair, "left", Value::Ref(shared)).unwrap();
    space.set(pair, "right", Value::Ref(shared)).unwrap();
    let id = store.save(&space, pair).unwrap();

    // One shape row despite two references.
    assert_eq!(store.count("Shape").unwrap(), 1);

    let mut out = ObjectSpace::new();
    let loaded = store.load(&mut out, "Pair", id).unwrap().unwrap();
    let left = out.field(loaded, "left").unwrap().as_handle().unwrap();
    let right = out.field(loaded, "right").unwrap().as_handle().unwrap();
    assert_eq!(left, right, "shared identity survives the round trip");
}

//! Executable format: hex transport, JSON load, round trips, module runs.

use gravity::bytecode::{bytecode_from_hex, bytecode_to_hex, Instr, Op};
use gravity::core::object::{FunctionKind, GravityObject};
use gravity::serialize::{load_buffer, serialize_function};
use gravity::{GravityVm, Value};

fn hex(code: &[Instr]) -> String {
    let words: Vec<u32> = code.iter().map(|i| i.0).collect();
    bytecode_to_hex(&words)
}

#[test]
fn hex_decode_encode_is_identity() {
    let stream = "0C04000142280C01000000000C080001";
    let code = bytecode_from_hex(stream).expect("valid hex");
    assert_eq!(bytecode_to_hex(&code), stream);
}

#[test]
fn malformed_hex_is_rejected() {
    assert!(bytecode_from_hex("123").is_none());
    assert!(bytecode_from_hex("XYZXYZXY").is_none());
}

#[test]
fn module_with_main_loads_and_runs() {
    // $moduleinit stores main into the globals; main returns 42
    let main_hex = hex(&[Instr::asb(Op::LoadI, 1, 42), Instr::a(Op::Ret, 1)]);
    let init_hex = hex(&[
        Instr::ab(Op::LoadK, 1, 1),
        Instr::ab(Op::StoreG, 1, 0),
        Instr::none(Op::Ret0),
    ]);
    let module = format!(
        r#"{{
            "type": "function",
            "identifier": "$moduleinit",
            "nparam": 1,
            "nlocal": 1,
            "bytecode": "{}",
            "pool": [
                "main",
                {{
                    "type": "function",
                    "identifier": "main",
                    "nparam": 1,
                    "nlocal": 1,
                    "bytecode": "{}"
                }}
            ]
        }}"#,
        init_hex, main_hex
    );

    let mut vm = GravityVm::new_default();
    let closure = load_buffer(&mut vm, &module).expect("module loads");
    let result = vm.run_main(closure).expect("main runs");
    assert_eq!(result, Value::Int(42));
}

#[test]
fn function_round_trip_preserves_shape() {
    let body = vec![
        Instr::asb(Op::LoadI, 1, 7),
        Instr::ab(Op::LoadK, 2, 0),
        Instr::abc(Op::Add, 3, 1, 2),
        Instr::a(Op::Ret, 3),
    ];
    let module = format!(
        r#"{{
            "type": "function",
            "identifier": "adder",
            "nparam": 2,
            "nlocal": 3,
            "ntemp": 1,
            "nup": 0,
            "bytecode": "{}",
            "pool": [35, 2.5, "text", true, null]
        }}"#,
        hex(&body)
    );

    let mut vm = GravityVm::new_default();
    let closure = load_buffer(&mut vm, &module).expect("function loads");
    let func = vm.heap().closure(closure).func;

    {
        let f = vm.heap().function(func);
        assert_eq!(f.identifier.as_deref(), Some("adder"));
        assert_eq!(f.nparams, 2);
        assert_eq!(f.nlocals, 3);
        assert_eq!(f.ntemps, 1);
        let code = f.code();
        assert_eq!(code.bytecode.len(), 4);
        assert_eq!(code.cpool.len(), 5);
        assert_eq!(code.cpool[0], Value::Int(35));
        assert_eq!(code.cpool[1], Value::Float(2.5));
        assert_eq!(code.cpool[3], Value::Bool(true));
        assert_eq!(code.cpool[4], Value::Null);
    }

    // serialize it back and reload: arity, code and pool are preserved
    let json = serialize_function(&vm, func);
    let closure2 = load_buffer(&mut vm, &json.to_string()).expect("reload");
    let func2 = vm.heap().closure(closure2).func;
    let (f1_code, f2_code) = {
        let f1 = vm.heap().function(func);
        let f2 = vm.heap().function(func2);
        assert_eq!(f1.nparams, f2.nparams);
        assert_eq!(f1.nlocals, f2.nlocals);
        assert_eq!(f1.ntemps, f2.ntemps);
        assert_eq!(f1.nupvalues, f2.nupvalues);
        (f1.code().bytecode.clone(), f2.code().bytecode.clone())
    };
    assert_eq!(f1_code, f2_code);
    let pool_equal = {
        let f1 = vm.heap().function(func);
        let f2 = vm.heap().function(func2);
        f1.code().cpool.len() == f2.code().cpool.len()
    };
    assert!(pool_equal);
}

#[test]
fn class_deserializes_with_superclass_resolution() {
    // two classes in the pool: B extends A; superclass resolves by name in
    // the second pass
    let module = r#"{
        "type": "function",
        "identifier": "$moduleinit",
        "nparam": 1,
        "nlocal": 1,
        "pool": [
            { "type": "class", "identifier": "A", "nivar": 2 },
            { "type": "class", "identifier": "B", "super": "A", "nivar": 1 }
        ]
    }"#;

    let mut vm = GravityVm::new_default();
    let closure = load_buffer(&mut vm, module).expect("module loads");
    let func = vm.heap().closure(closure).func;
    let (a, b) = {
        let code = vm.heap().function(func).code();
        (code.cpool[0], code.cpool[1])
    };
    let a = a.as_object().unwrap();
    let b = b.as_object().unwrap();

    assert_eq!(vm.heap().class(a).identifier, "A");
    assert_eq!(vm.heap().class(b).identifier, "B");
    assert_eq!(vm.heap().class(b).superclass, Some(a));
    assert!(vm.heap().class(b).superlook.is_none());
    // parent slots come first: B has its own ivar plus A's two
    assert_eq!(vm.heap().class(b).nivars, 3);
}

#[test]
fn class_methods_deserialize_as_closures() {
    let getx_hex = hex(&[Instr::asb(Op::LoadI, 1, 5), Instr::a(Op::Ret, 1)]);
    let module = format!(
        r#"{{
            "type": "function",
            "identifier": "$moduleinit",
            "nparam": 1,
            "nlocal": 1,
            "pool": [
                {{
                    "type": "class",
                    "identifier": "Widget",
                    "nivar": 0,
                    "getx": {{
                        "type": "function",
                        "identifier": "getx",
                        "nparam": 1,
                        "nlocal": 1,
                        "bytecode": "{}"
                    }}
                }}
            ]
        }}"#,
        getx_hex
    );

    let mut vm = GravityVm::new_default();
    let closure = load_buffer(&mut vm, &module).expect("module loads");
    let func = vm.heap().closure(closure).func;
    let widget = {
        let code = vm.heap().function(func).code();
        code.cpool[0].as_object().unwrap()
    };
    let key = Value::Object(vm.intern("getx"));
    let method = gravity::core::oop::class_lookup(vm.heap(), widget, key).expect("method bound");
    let mref = method.as_object().unwrap();
    assert!(matches!(vm.heap().get(mref), GravityObject::Closure(_)));

    // and it runs
    let result = vm.run_closure(mref, Value::Null, &[]).expect("method runs");
    assert_eq!(result, Value::Int(5));
}

#[test]
fn computed_property_deserializes_as_special() {
    let get_hex = hex(&[Instr::asb(Op::LoadI, 1, 9), Instr::a(Op::Ret, 1)]);
    let module = format!(
        r#"{{
            "type": "function",
            "identifier": "$moduleinit",
            "nparam": 1,
            "nlocal": 1,
            "pool": [
                {{
                    "type": "class",
                    "identifier": "Box",
                    "nivar": 0,
                    "area": {{
                        "type": "var",
                        "identifier": "area",
                        "index": 65534,
                        "$get": {{
                            "type": "function",
                            "identifier": "area",
                            "nparam": 1,
                            "nlocal": 1,
                            "bytecode": "{}"
                        }}
                    }}
                }}
            ]
        }}"#,
        get_hex
    );

    let mut vm = GravityVm::new_default();
    let closure = load_buffer(&mut vm, &module).expect("module loads");
    let func = vm.heap().closure(closure).func;
    let class = {
        let code = vm.heap().function(func).code();
        code.cpool[0].as_object().unwrap()
    };
    let key = Value::Object(vm.intern("area"));
    let prop = gravity::core::oop::class_lookup(vm.heap(), class, key).expect("property bound");
    let pref = prop.as_object().unwrap();
    let pfunc = match vm.heap().get(pref) {
        GravityObject::Closure(c) => c.func,
        GravityObject::Function(_) => pref,
        other => panic!("unexpected binding {:?}", other),
    };
    assert!(matches!(
        vm.heap().function(pfunc).kind,
        FunctionKind::Special { .. }
    ));
}

#[test]
fn unknown_object_type_is_an_error() {
    let module = r#"{
        "type": "function",
        "identifier": "$moduleinit",
        "pool": [ { "type": "wormhole" } ]
    }"#;
    let mut vm = GravityVm::new_default();
    assert!(load_buffer(&mut vm, module).is_err());
}

#[test]
fn missing_superclass_is_an_error() {
    let module = r#"{
        "type": "function",
        "identifier": "$moduleinit",
        "pool": [ { "type": "class", "identifier": "Orphan", "super": "Ghost" } ]
    }"#;
    let mut vm = GravityVm::new_default();
    let err = load_buffer(&mut vm, module).unwrap_err();
    let text = format!("{}", err);
    assert!(text.contains("Unable to find superclass Ghost of class Orphan."));
}

#[test]
fn range_and_map_values_deserialize() {
    let module = r#"{
        "type": "function",
        "identifier": "$moduleinit",
        "pool": [
            { "type": "range", "from": 3, "to": 9 },
            { "type": "map", "answer": 42, "label": "ok" }
        ]
    }"#;
    let mut vm = GravityVm::new_default();
    let closure = load_buffer(&mut vm, module).expect("module loads");
    let func = vm.heap().closure(closure).func;
    let (rangev, mapv) = {
        let code = vm.heap().function(func).code();
        (code.cpool[0], code.cpool[1])
    };

    let r = rangev.as_object().unwrap();
    match vm.heap().get(r) {
        GravityObject::Range(rg) => {
            assert_eq!(rg.from, 3);
            assert_eq!(rg.to, 9);
        }
        other => panic!("expected Range, got {:?}", other),
    }

    let m = mapv.as_object().unwrap();
    let key = vm.new_string("answer");
    let got = match vm.heap().get(m) {
        GravityObject::Map(map) => map.table.lookup(vm.heap(), key),
        other => panic!("expected Map, got {:?}", other),
    };
    assert_eq!(got, Some(Value::Int(42)));
}

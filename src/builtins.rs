// File: src/builtins.rs
//
// Host function registry. Installs the root bindings scripts see on startup
// (print, console, Math, fs, String, Number, Boolean, Array, Promise) and
// provides the native members of arrays and promises.

use crate::runtime::object::{Modifiers, Object, SlotKind};
use crate::runtime::promise::Promise;
use crate::runtime::value::{NativeFunction, Value, VmError, VmResult};
use crate::runtime::Array;
use crate::vm::Vm;
use std::cell::RefCell;
use std::rc::Rc;

fn native<F>(name: &str, func: F) -> Value
where
    F: Fn(&mut Vm, &[Value]) -> VmResult<Value> + 'static,
{
    Value::Native(NativeFunction::new(name, func))
}

fn namespace(entries: Vec<(&str, Value)>) -> Value {
    let mut object = Object::literal();
    for (name, value) in entries {
        object.define(name, value, SlotKind::Var, Modifiers::public());
    }
    Value::object(object)
}

fn arg(args: &[Value], index: usize) -> Value {
    args.get(index).cloned().unwrap_or(Value::Undefined)
}

/// Register the root environment bindings
pub fn install(vm: &mut Vm) {
    vm.define_global(
        "print",
        native("print", |vm, args| {
            let line = args
                .iter()
                .map(Value::to_display_string)
                .collect::<Vec<_>>()
                .join(" ");
            vm.write_line(line);
            Ok(Value::Undefined)
        }),
    );

    vm.define_global(
        "console",
        namespace(vec![
            (
                "log",
                native("console.log", |vm, args| {
                    let line = args
                        .iter()
                        .map(Value::to_display_string)
                        .collect::<Vec<_>>()
                        .join(" ");
                    vm.write_line(line);
                    Ok(Value::Undefined)
                }),
            ),
            (
                "error",
                native("console.error", |_vm, args| {
                    let line = args
                        .iter()
                        .map(Value::to_display_string)
                        .collect::<Vec<_>>()
                        .join(" ");
                    eprintln!("{}", line);
                    Ok(Value::Undefined)
                }),
            ),
        ]),
    );

    vm.define_global(
        "Math",
        namespace(vec![
            ("PI", Value::Number(std::f64::consts::PI)),
            ("E", Value::Number(std::f64::consts::E)),
            ("abs", native("Math.abs", |_, args| Ok(Value::Number(arg(args, 0).as_number().abs())))),
            ("floor", native("Math.floor", |_, args| {
                Ok(Value::Number(arg(args, 0).as_number().floor()))
            })),
            ("ceil", native("Math.ceil", |_, args| {
                Ok(Value::Number(arg(args, 0).as_number().ceil()))
            })),
            ("trunc", native("Math.trunc", |_, args| {
                Ok(Value::Number(arg(args, 0).as_number().trunc()))
            })),
            ("sqrt", native("Math.sqrt", |_, args| {
                Ok(Value::Number(arg(args, 0).as_number().sqrt()))
            })),
            ("pow", native("Math.pow", |_, args| {
                Ok(Value::Number(arg(args, 0).as_number().powf(arg(args, 1).as_number())))
            })),
            ("max", native("Math.max", |_, args| {
                let result = args
                    .iter()
                    .map(Value::as_number)
                    .fold(f64::NEG_INFINITY, f64::max);
                Ok(Value::Number(result))
            })),
            ("min", native("Math.min", |_, args| {
                let result = args.iter().map(Value::as_number).fold(f64::INFINITY, f64::min);
                Ok(Value::Number(result))
            })),
            ("random", native("Math.random", |_, _| Ok(Value::Number(rand::random::<f64>())))),
        ]),
    );

    vm.define_global(
        "fs",
        namespace(vec![
            (
                "read_file",
                native("fs.read_file", |_, args| {
                    let path = arg(args, 0).to_display_string();
                    std::fs::read_to_string(&path)
                        .map(Value::str)
                        .map_err(|e| VmError::thrown(format!("Failed to read {}: {}", path, e)))
                }),
            ),
            (
                "write_file",
                native("fs.write_file", |_, args| {
                    let path = arg(args, 0).to_display_string();
                    let content = arg(args, 1).to_display_string();
                    std::fs::write(&path, content)
                        .map(|_| Value::Undefined)
                        .map_err(|e| VmError::thrown(format!("Failed to write {}: {}", path, e)))
                }),
            ),
            (
                "exists",
                native("fs.exists", |_, args| {
                    let path = arg(args, 0).to_display_string();
                    Ok(Value::Boolean(std::path::Path::new(&path).exists()))
                }),
            ),
        ]),
    );

    vm.define_global(
        "String",
        native("String", |_, args| Ok(Value::str(arg(args, 0).to_display_string()))),
    );
    vm.define_global(
        "Number",
        native("Number", |_, args| Ok(Value::Number(arg(args, 0).as_number()))),
    );
    vm.define_global(
        "Boolean",
        native("Boolean", |_, args| Ok(Value::Boolean(arg(args, 0).is_truthy()))),
    );
    vm.define_global(
        "Array",
        native("Array", |_, args| Ok(Value::array(Array::from_values(args.to_vec())))),
    );

    vm.define_global(
        "Promise",
        namespace(vec![
            (
                "resolve",
                native("Promise.resolve", |_, args| {
                    Ok(Value::Promise(Promise::resolved(arg(args, 0))))
                }),
            ),
            (
                "reject",
                native("Promise.reject", |_, args| {
                    Ok(Value::Promise(Promise::rejected(arg(args, 0))))
                }),
            ),
        ]),
    );
}

/// Built-in array methods, looked up by property name. Each call site gets a
/// native bound to this array.
pub fn array_member(array: &Rc<RefCell<Array>>, name: &str) -> Option<Value> {
    match name {
        "push" => {
            let array = Rc::clone(array);
            Some(native("push", move |_, args| {
                let mut borrowed = array.borrow_mut();
                for value in args {
                    borrowed.push(value.clone());
                }
                Ok(Value::Number(borrowed.len() as f64))
            }))
        }
        "pop" => {
            let array = Rc::clone(array);
            Some(native("pop", move |_, _| Ok(array.borrow_mut().pop())))
        }
        "join" => {
            let array = Rc::clone(array);
            Some(native("join", move |_, args| {
                let separator = match args.first() {
                    Some(Value::Undefined) | None => ",".to_string(),
                    Some(value) => value.to_display_string(),
                };
                let joined = array
                    .borrow()
                    .values()
                    .iter()
                    .map(Value::to_display_string)
                    .collect::<Vec<_>>()
                    .join(&separator);
                Ok(Value::str(joined))
            }))
        }
        "reduce" => {
            let array = Rc::clone(array);
            Some(native("reduce", move |vm, args| {
                let callback = arg(args, 0);
                let values = array.borrow().values();
                let mut iter = values.into_iter().enumerate();

                let mut accumulator = match args.get(1) {
                    Some(initial) => initial.clone(),
                    None => match iter.next() {
                        Some((_, first)) => first,
                        None => {
                            return Err(VmError::thrown(
                                "reduce of empty array with no initial value",
                            ))
                        }
                    },
                };
                for (index, value) in iter {
                    accumulator = vm.call_function(
                        &callback,
                        vec![accumulator, value, Value::Number(index as f64)],
                    )?;
                }
                Ok(accumulator)
            }))
        }
        _ => None,
    }
}

/// Promise members: `then` and `catch` return a new promise settled by the
/// callback's result.
pub fn promise_member(promise: &Rc<RefCell<Promise>>, name: &str) -> Value {
    match name {
        "then" => {
            let promise = Rc::clone(promise);
            native("then", move |vm, args| {
                let callback = args.first().cloned();
                let target = Promise::new();
                vm.register_reaction(&promise, callback, None, Rc::clone(&target));
                Ok(Value::Promise(target))
            })
        }
        "catch" => {
            let promise = Rc::clone(promise);
            native("catch", move |vm, args| {
                let callback = args.first().cloned();
                let target = Promise::new();
                vm.register_reaction(&promise, None, callback, Rc::clone(&target));
                Ok(Value::Promise(target))
            })
        }
        _ => Value::Undefined,
    }
}

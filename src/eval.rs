//! In-process evaluation of a resolved [`Program`].
//!
//! Definitions are initialized lazily on first use and memoized, so the
//! order of `Program::definitions` never matters to evaluation. A definition
//! whose initializer needs itself (directly or through others) fails with
//! [`EvalError::CircularInitialization`]; cycles through function bodies are
//! fine because bodies only run when called.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::io;
use std::rc::Rc;

use serde_json::Number;

use crate::expression::{is_builtin, Closure, Expression};
use crate::host::StdStreams;
use crate::identity::Identity;
use crate::program::Program;
use crate::value::{StreamHandle, Value};

/// Nesting limit for function calls.
pub const MAX_CALL_DEPTH: usize = 256;

#[derive(Debug, thiserror::Error)]
pub enum EvalError {
    #[error("`{0}` is not bound")]
    UnboundIdentifier(String),
    #[error("definition `{0}` is not part of the program")]
    MissingDefinition(Identity),
    #[error("a {0} value is not callable")]
    NotCallable(&'static str),
    #[error("a {type_name} value has no member `{property}`")]
    InvalidMember {
        type_name: &'static str,
        property: String,
    },
    #[error("{builtin}: {message}")]
    TypeError {
        builtin: &'static str,
        message: String,
    },
    #[error("i/o on {stream} failed")]
    Io {
        stream: &'static str,
        #[source]
        source: io::Error,
    },
    #[error("definition `{0}` depends on itself during initialization")]
    CircularInitialization(Identity),
    #[error("call depth exceeded {0}")]
    CallDepthExceeded(usize),
    #[error("program produced a {0}, which has no data representation")]
    OpaqueResult(&'static str),
}

/// Evaluates the program's entry closure.
pub fn evaluate_program(program: &Program, streams: &dyn StdStreams) -> Result<Value, EvalError> {
    let interp = Interpreter::new(program, streams);
    let result = interp.eval_closure(&program.entry)?;
    result.into_value()
}

/// Evaluates the entry closure to a callable and applies it to `args`.
pub fn invoke_program(
    program: &Program,
    streams: &dyn StdStreams,
    args: Vec<Value>,
) -> Result<Value, EvalError> {
    let interp = Interpreter::new(program, streams);
    let callee = interp.eval_closure(&program.entry)?;
    let args = args.into_iter().map(Runtime::Data).collect();
    interp.apply(callee, args)?.into_value()
}

#[derive(Clone)]
enum Runtime<'p> {
    Data(Value),
    Function(Rc<FunctionValue<'p>>),
    Builtin(&'static str),
    /// The `process` object exposing the standard streams.
    Process,
}

impl Runtime<'_> {
    fn type_name(&self) -> &'static str {
        match self {
            Runtime::Data(v) => v.type_name(),
            Runtime::Function(_) | Runtime::Builtin(_) => "function",
            Runtime::Process => "process object",
        }
    }

    fn into_value(self) -> Result<Value, EvalError> {
        match self {
            Runtime::Data(v) => Ok(v),
            other => Err(EvalError::OpaqueResult(other.type_name())),
        }
    }
}

struct FunctionValue<'p> {
    params: &'p [String],
    body: &'p Expression,
    env: Env<'p>,
}

struct Frame<'p> {
    bindings: Vec<(&'p str, Runtime<'p>)>,
    parent: Option<Rc<Frame<'p>>>,
}

/// Lexical environment: local frames, then the owning closure's references.
#[derive(Clone)]
struct Env<'p> {
    references: &'p BTreeMap<String, Identity>,
    locals: Option<Rc<Frame<'p>>>,
}

impl<'p> Env<'p> {
    fn local(&self, name: &str) -> Option<Runtime<'p>> {
        let mut frame = self.locals.as_deref();
        while let Some(f) = frame {
            if let Some((_, v)) = f.bindings.iter().rev().find(|(n, _)| *n == name) {
                return Some(v.clone());
            }
            frame = f.parent.as_deref();
        }
        None
    }
}

struct Interpreter<'p> {
    definitions: HashMap<&'p Identity, &'p Closure>,
    globals: RefCell<HashMap<&'p Identity, Runtime<'p>>>,
    initializing: RefCell<HashSet<&'p Identity>>,
    depth: Cell<usize>,
    streams: &'p dyn StdStreams,
}

impl<'p> Interpreter<'p> {
    fn new(program: &'p Program, streams: &'p dyn StdStreams) -> Self {
        Self {
            definitions: program
                .definitions
                .iter()
                .map(|e| (&e.identity, &e.closure))
                .collect(),
            globals: RefCell::new(HashMap::new()),
            initializing: RefCell::new(HashSet::new()),
            depth: Cell::new(0),
            streams,
        }
    }

    fn eval_closure(&self, closure: &'p Closure) -> Result<Runtime<'p>, EvalError> {
        let env = Env {
            references: &closure.references,
            locals: None,
        };
        self.eval(&closure.expression, &env)
    }

    fn global(&self, identity: &'p Identity) -> Result<Runtime<'p>, EvalError> {
        if let Some(v) = self.globals.borrow().get(identity) {
            return Ok(v.clone());
        }
        let closure = *self
            .definitions
            .get(identity)
            .ok_or_else(|| EvalError::MissingDefinition(identity.clone()))?;
        if !self.initializing.borrow_mut().insert(identity) {
            return Err(EvalError::CircularInitialization(identity.clone()));
        }
        let result = self.eval_closure(closure);
        self.initializing.borrow_mut().remove(identity);
        let value = result?;
        self.globals.borrow_mut().insert(identity, value.clone());
        Ok(value)
    }

    fn lookup(&self, name: &str, env: &Env<'p>) -> Result<Runtime<'p>, EvalError> {
        if let Some(v) = env.local(name) {
            return Ok(v);
        }
        let references: &'p BTreeMap<String, Identity> = env.references;
        if let Some(identity) = references.get(name) {
            return self.global(identity);
        }
        match name {
            "process" => Ok(Runtime::Process),
            _ if is_builtin(name) => Ok(Runtime::Builtin(builtin_name(name))),
            _ => Err(EvalError::UnboundIdentifier(name.to_string())),
        }
    }

    fn eval(&self, expr: &'p Expression, env: &Env<'p>) -> Result<Runtime<'p>, EvalError> {
        match expr {
            Expression::Identifier { name } => self.lookup(name, env),
            Expression::StringLiteral { value } => Ok(Runtime::Data(Value::String(value.clone()))),
            Expression::Literal { value } => Ok(Runtime::Data(Value::from_json(value.clone()))),
            Expression::Member { object, property } => {
                let object = self.eval(object, env)?;
                member_of(object, property)
            }
            Expression::Call { callee, arguments } => {
                let callee = self.eval(callee, env)?;
                let args = arguments
                    .iter()
                    .map(|a| self.eval(a, env))
                    .collect::<Result<Vec<_>, _>>()?;
                self.apply(callee, args)
            }
            Expression::Function { params, body } => Ok(Runtime::Function(Rc::new(FunctionValue {
                params,
                body,
                env: env.clone(),
            }))),
            Expression::Sequence { expressions } => {
                let mut last = Runtime::Data(Value::Null);
                for e in expressions {
                    last = self.eval(e, env)?;
                }
                Ok(last)
            }
        }
    }

    fn apply(&self, callee: Runtime<'p>, args: Vec<Runtime<'p>>) -> Result<Runtime<'p>, EvalError> {
        match callee {
            Runtime::Function(f) => {
                let depth = self.depth.get();
                if depth >= MAX_CALL_DEPTH {
                    return Err(EvalError::CallDepthExceeded(MAX_CALL_DEPTH));
                }
                let params: &'p [String] = f.params;
                let body: &'p Expression = f.body;
                let mut args = args.into_iter();
                let bindings = params
                    .iter()
                    .map(|p| (p.as_str(), args.next().unwrap_or(Runtime::Data(Value::Null))))
                    .collect();
                let env = Env {
                    references: f.env.references,
                    locals: Some(Rc::new(Frame {
                        bindings,
                        parent: f.env.locals.clone(),
                    })),
                };
                self.depth.set(depth + 1);
                let result = self.eval(body, &env);
                self.depth.set(depth);
                result
            }
            Runtime::Builtin(name) => {
                let args = args
                    .into_iter()
                    .map(|a| match a {
                        Runtime::Data(v) => Ok(v),
                        other => Err(EvalError::TypeError {
                            builtin: name,
                            message: format!("cannot take a {} argument", other.type_name()),
                        }),
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                self.builtin(name, args).map(Runtime::Data)
            }
            other => Err(EvalError::NotCallable(other.type_name())),
        }
    }

    fn builtin(&self, name: &'static str, args: Vec<Value>) -> Result<Value, EvalError> {
        let type_error = |message: String| EvalError::TypeError {
            builtin: name,
            message,
        };
        let arg = |i: usize| args.get(i).cloned().unwrap_or(Value::Null);

        match name {
            "write" => {
                let stream = match arg(0) {
                    Value::Stream(s @ (StreamHandle::Stdout | StreamHandle::Stderr)) => s,
                    other => {
                        return Err(type_error(format!(
                            "first argument must be stdout or stderr, got {}",
                            other.type_name()
                        )))
                    }
                };
                let text = arg(1).to_text();
                self.streams
                    .write_all(stream, text.as_bytes())
                    .map_err(|source| EvalError::Io {
                        stream: stream.as_str(),
                        source,
                    })?;
                Ok(Value::Null)
            }
            "read" => match arg(0) {
                Value::Stream(StreamHandle::Stdin) => self
                    .streams
                    .read_to_string(StreamHandle::Stdin)
                    .map(Value::String)
                    .map_err(|source| EvalError::Io {
                        stream: "stdin",
                        source,
                    }),
                other => Err(type_error(format!(
                    "argument must be stdin, got {}",
                    other.type_name()
                ))),
            },
            "concat" => Ok(Value::String(args.iter().map(Value::to_text).collect())),
            "json" => Ok(Value::String(arg(0).to_json().to_string())),
            "parse" => match arg(0) {
                Value::String(text) => serde_json::from_str(&text)
                    .map(Value::from_json)
                    .map_err(|e| type_error(format!("invalid JSON: {e}"))),
                other => Err(type_error(format!(
                    "argument must be a string, got {}",
                    other.type_name()
                ))),
            },
            "add" => add_numbers(&args).map_err(type_error),
            "get" => match (arg(0), arg(1)) {
                (Value::Object(map), Value::String(key)) => {
                    Ok(map.get(&key).cloned().unwrap_or(Value::Null))
                }
                (Value::Array(items), Value::Number(n)) => Ok(n
                    .as_u64()
                    .and_then(|i| items.get(i as usize).cloned())
                    .unwrap_or(Value::Null)),
                (container, key) => Err(type_error(format!(
                    "cannot index a {} with a {}",
                    container.type_name(),
                    key.type_name()
                ))),
            },
            _ => Err(EvalError::UnboundIdentifier(name.to_string())),
        }
    }
}

fn builtin_name(name: &str) -> &'static str {
    crate::expression::BUILTINS
        .iter()
        .copied()
        .find(|b| *b == name)
        .unwrap_or("builtin")
}

fn member_of<'p>(object: Runtime<'p>, property: &str) -> Result<Runtime<'p>, EvalError> {
    let invalid = |type_name| EvalError::InvalidMember {
        type_name,
        property: property.to_string(),
    };
    match object {
        Runtime::Process => StreamHandle::from_name(property)
            .map(|s| Runtime::Data(Value::Stream(s)))
            .ok_or_else(|| invalid("process object")),
        Runtime::Data(Value::Object(map)) => {
            Ok(Runtime::Data(map.get(property).cloned().unwrap_or(Value::Null)))
        }
        Runtime::Data(Value::Array(items)) if property == "length" => {
            Ok(Runtime::Data(Value::from(items.len() as i64)))
        }
        Runtime::Data(Value::String(s)) if property == "length" => {
            Ok(Runtime::Data(Value::from(s.chars().count() as i64)))
        }
        other => Err(invalid(other.type_name())),
    }
}

/// Integer sum when every operand is an integer and nothing overflows,
/// float sum otherwise.
fn add_numbers(args: &[Value]) -> Result<Value, String> {
    let mut numbers = Vec::with_capacity(args.len());
    for a in args {
        match a {
            Value::Number(n) => numbers.push(n),
            other => return Err(format!("cannot add a {}", other.type_name())),
        }
    }

    let int_sum = numbers
        .iter()
        .try_fold(0i64, |acc, n| n.as_i64().and_then(|i| acc.checked_add(i)));
    if let Some(sum) = int_sum {
        return Ok(Value::from(sum));
    }

    let sum: f64 = numbers.iter().filter_map(|n| n.as_f64()).sum();
    Number::from_f64(sum)
        .map(Value::Number)
        .ok_or_else(|| "sum is not a finite number".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expression::{call, function, identifier, literal, member, sequence, string_literal};
    use crate::memory_host::SimulatedStreams;
    use serde_json::json;

    fn id(loc: &str, name: &str) -> Identity {
        Identity::new(loc, name)
    }

    fn program(entry: Closure, defs: Vec<(Identity, Closure)>) -> Program {
        let mut p = Program::new(entry);
        for (i, c) in defs {
            p.push(i, c);
        }
        p
    }

    fn greet() -> Closure {
        Closure::leaf(function(
            ["name"],
            call(
                identifier("concat"),
                vec![string_literal("hello, "), identifier("name")],
            ),
        ))
    }

    #[test]
    fn calls_referenced_function() {
        let p = program(
            Closure::leaf(call(identifier("main"), vec![string_literal("ada")]))
                .with_reference("main", id("/g", "greet")),
            vec![(id("/g", "greet"), greet())],
        );
        let streams = SimulatedStreams::default();
        assert_eq!(evaluate_program(&p, &streams).unwrap(), Value::from("hello, ada"));
    }

    #[test]
    fn writes_go_through_the_supplied_streams() {
        let main = Closure::leaf(function(
            ["out", "input"],
            sequence(vec![
                call(
                    identifier("write"),
                    vec![
                        identifier("out"),
                        call(identifier("read"), vec![identifier("input")]),
                    ],
                ),
                literal(json!(7)),
            ]),
        ));
        let p = program(
            Closure::leaf(call(
                identifier("main"),
                vec![
                    member(identifier("process"), "stdout"),
                    member(identifier("process"), "stdin"),
                ],
            ))
            .with_reference("main", id("/m", "main")),
            vec![(id("/m", "main"), main)],
        );
        let streams = SimulatedStreams::with_stdin("echo me");
        assert_eq!(evaluate_program(&p, &streams).unwrap(), Value::from(7));
        assert_eq!(streams.stdout(), "echo me");
    }

    #[test]
    fn invoke_applies_entry_to_arguments() {
        let p = program(
            Closure::leaf(identifier("main")).with_reference("main", id("/g", "greet")),
            vec![(id("/g", "greet"), greet())],
        );
        let streams = SimulatedStreams::default();
        let out = invoke_program(&p, &streams, vec![Value::from("bob")]).unwrap();
        assert_eq!(out, Value::from("hello, bob"));
    }

    #[test]
    fn definitions_initialize_in_any_order() {
        // `b` is listed before the `a` it depends on.
        let p = program(
            Closure::leaf(identifier("b")).with_reference("b", id("/m", "b")),
            vec![
                (
                    id("/m", "b"),
                    Closure::leaf(call(identifier("add"), vec![identifier("a"), literal(json!(1))]))
                        .with_reference("a", id("/m", "a")),
                ),
                (id("/m", "a"), Closure::leaf(literal(json!(41)))),
            ],
        );
        let out = evaluate_program(&p, &SimulatedStreams::default()).unwrap();
        assert_eq!(out, Value::from(42));
    }

    #[test]
    fn mutual_recursion_through_functions_is_allowed() {
        // f and g only mention each other inside function bodies.
        let p = program(
            Closure::leaf(call(identifier("f"), vec![])).with_reference("f", id("/m", "f")),
            vec![
                (
                    id("/m", "f"),
                    Closure::leaf(function(Vec::<String>::new(), identifier("g")))
                        .with_reference("g", id("/m", "g")),
                ),
                (
                    id("/m", "g"),
                    Closure::leaf(function(Vec::<String>::new(), identifier("f")))
                        .with_reference("f", id("/m", "f")),
                ),
            ],
        );
        let err = evaluate_program(&p, &SimulatedStreams::default()).unwrap_err();
        assert!(matches!(err, EvalError::OpaqueResult("function")), "{err}");
    }

    #[test]
    fn value_cycles_are_reported() {
        let p = program(
            Closure::leaf(identifier("a")).with_reference("a", id("/m", "a")),
            vec![
                (
                    id("/m", "a"),
                    Closure::leaf(identifier("b")).with_reference("b", id("/m", "b")),
                ),
                (
                    id("/m", "b"),
                    Closure::leaf(identifier("a")).with_reference("a", id("/m", "a")),
                ),
            ],
        );
        let err = evaluate_program(&p, &SimulatedStreams::default()).unwrap_err();
        assert!(matches!(err, EvalError::CircularInitialization(_)), "{err}");
    }

    #[test]
    fn runaway_recursion_hits_the_depth_limit() {
        let p = program(
            Closure::leaf(call(identifier("loop"), vec![])).with_reference("loop", id("/m", "loop")),
            vec![(
                id("/m", "loop"),
                Closure::leaf(function(
                    Vec::<String>::new(),
                    call(identifier("loop"), vec![]),
                ))
                .with_reference("loop", id("/m", "loop")),
            )],
        );
        let err = evaluate_program(&p, &SimulatedStreams::default()).unwrap_err();
        assert!(matches!(err, EvalError::CallDepthExceeded(MAX_CALL_DEPTH)));
    }

    #[test]
    fn builtins_cover_json_and_lookup() {
        let streams = SimulatedStreams::default();
        let run = |expr: Expression| evaluate_program(&Program::new(Closure::leaf(expr)), &streams);

        assert_eq!(
            run(call(identifier("json"), vec![literal(json!({"a": [1]}))])).unwrap(),
            Value::from(r#"{"a":[1]}"#)
        );
        assert_eq!(
            run(call(
                identifier("get"),
                vec![
                    call(identifier("parse"), vec![string_literal(r#"{"k":"v"}"#)]),
                    string_literal("k")
                ]
            ))
            .unwrap(),
            Value::from("v")
        );
        assert_eq!(
            run(call(identifier("add"), vec![literal(json!(1)), literal(json!(0.5))])).unwrap(),
            Value::from_json(json!(1.5))
        );
        assert_eq!(
            run(member(literal(json!([1, 2, 3])), "length")).unwrap(),
            Value::from(3)
        );
        assert!(matches!(
            run(call(identifier("add"), vec![string_literal("x")])).unwrap_err(),
            EvalError::TypeError { builtin: "add", .. }
        ));
        assert!(matches!(
            run(call(literal(json!(1)), vec![])).unwrap_err(),
            EvalError::NotCallable("number")
        ));
    }

    #[test]
    fn missing_parameters_are_null() {
        let p = Program::new(Closure::leaf(call(
            function(["a", "b"], identifier("b")),
            vec![literal(json!(1))],
        )));
        assert_eq!(
            evaluate_program(&p, &SimulatedStreams::default()).unwrap(),
            Value::Null
        );
    }
}

//! Code as data: the closed expression tree and the closure that pairs it
//! with the identities of its free names.

use std::collections::{BTreeMap, BTreeSet};

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::identity::Identity;
use crate::value::Value;

/// Names the evaluator provides without a reference entry.
pub const BUILTINS: &[&str] = &[
    "process", "write", "read", "concat", "json", "parse", "add", "get",
];

pub fn is_builtin(name: &str) -> bool {
    BUILTINS.contains(&name)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Expression {
    Identifier {
        name: String,
    },
    StringLiteral {
        value: String,
    },
    /// Any JSON value embedded as a constant.
    Literal {
        value: JsonValue,
    },
    Member {
        object: Box<Expression>,
        property: String,
    },
    Call {
        callee: Box<Expression>,
        #[serde(default)]
        arguments: Vec<Expression>,
    },
    Function {
        #[serde(default)]
        params: Vec<String>,
        body: Box<Expression>,
    },
    /// Evaluates each expression in order and yields the last one.
    Sequence {
        expressions: Vec<Expression>,
    },
}

pub fn identifier(name: impl Into<String>) -> Expression {
    Expression::Identifier { name: name.into() }
}

pub fn string_literal(value: impl Into<String>) -> Expression {
    Expression::StringLiteral {
        value: value.into(),
    }
}

pub fn literal(value: JsonValue) -> Expression {
    Expression::Literal { value }
}

pub fn member(object: Expression, property: impl Into<String>) -> Expression {
    Expression::Member {
        object: Box::new(object),
        property: property.into(),
    }
}

pub fn call(callee: Expression, arguments: Vec<Expression>) -> Expression {
    Expression::Call {
        callee: Box::new(callee),
        arguments,
    }
}

pub fn function<P, S>(params: P, body: Expression) -> Expression
where
    P: IntoIterator<Item = S>,
    S: Into<String>,
{
    Expression::Function {
        params: params.into_iter().map(Into::into).collect(),
        body: Box::new(body),
    }
}

pub fn sequence(expressions: Vec<Expression>) -> Expression {
    Expression::Sequence { expressions }
}

impl Expression {
    /// Expression that evaluates back to `value` inside a synthesized entry
    /// point. Stream handles become `process.<stream>`.
    pub fn from_argument(value: &Value) -> Expression {
        match value {
            Value::Stream(handle) => member(identifier("process"), handle.as_str()),
            Value::String(s) => string_literal(s.clone()),
            other => literal(other.to_json()),
        }
    }

    /// Identifiers that occur free, in first-occurrence order, including
    /// builtins.
    pub fn free_identifiers(&self) -> Vec<String> {
        let mut out = Vec::new();
        let mut bound: Vec<&str> = Vec::new();
        collect_free(self, &mut bound, &mut out);
        out
    }
}

fn collect_free<'a>(expr: &'a Expression, bound: &mut Vec<&'a str>, out: &mut Vec<String>) {
    match expr {
        Expression::Identifier { name } => {
            if !bound.contains(&name.as_str()) && !out.contains(name) {
                out.push(name.clone());
            }
        }
        Expression::StringLiteral { .. } | Expression::Literal { .. } => {}
        Expression::Member { object, .. } => collect_free(object, bound, out),
        Expression::Call { callee, arguments } => {
            collect_free(callee, bound, out);
            for arg in arguments {
                collect_free(arg, bound, out);
            }
        }
        Expression::Function { params, body } => {
            let mark = bound.len();
            bound.extend(params.iter().map(String::as_str));
            collect_free(body, bound, out);
            bound.truncate(mark);
        }
        Expression::Sequence { expressions } => {
            for e in expressions {
                collect_free(e, bound, out);
            }
        }
    }
}

/// One resolvable unit of code.
///
/// `references` maps each non-builtin free name of `expression` to the
/// definition it denotes. Iteration order is ascending local name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Closure {
    pub expression: Expression,
    #[serde(default)]
    pub references: BTreeMap<String, Identity>,
}

impl Closure {
    pub fn new(expression: Expression, references: BTreeMap<String, Identity>) -> Self {
        Self {
            expression,
            references,
        }
    }

    /// A closure with no external references.
    pub fn leaf(expression: Expression) -> Self {
        Self::new(expression, BTreeMap::new())
    }

    pub fn with_reference(mut self, local: impl Into<String>, identity: Identity) -> Self {
        self.references.insert(local.into(), identity);
        self
    }

    /// Distinct referenced identities in reference-map order.
    pub fn referenced_identities(&self) -> Vec<&Identity> {
        let mut seen = BTreeSet::new();
        self.references
            .values()
            .filter(|id| seen.insert(*id))
            .collect()
    }

    /// Free names that are neither builtins nor covered by `references`.
    pub fn unbound_identifiers(&self) -> Vec<String> {
        self.expression
            .free_identifiers()
            .into_iter()
            .filter(|name| !is_builtin(name) && !self.references.contains_key(name))
            .collect()
    }
}

// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Protocol expressions and their evaluation stack.
//!
//! Expressions are deliberately small: a literal value or a reference to a
//! variable provided by an enclosing block (`index` inside a repeat) or by
//! the start arguments. Evaluation captures the value once; later frame
//! changes do not retroactively alter an evaluated demand.

use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum EvalError {
    #[error("undefined variable: {0}")]
    UndefinedVariable(String),
}

/// A literal value or a variable reference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Expr {
    Literal { value: Value },
    Var { name: String },
}

impl Expr {
    pub fn literal(value: impl Into<Value>) -> Self {
        Expr::Literal { value: value.into() }
    }

    pub fn var(name: impl Into<String>) -> Self {
        Expr::Var { name: name.into() }
    }

    pub fn eval(&self, stack: &EvalStack) -> Result<Value, EvalError> {
        match self {
            Expr::Literal { value } => Ok(value.clone()),
            Expr::Var { name } => stack
                .lookup(name)
                .cloned()
                .ok_or_else(|| EvalError::UndefinedVariable(name.clone())),
        }
    }
}

/// Layered variable frames. Cheap to clone; pushing a frame returns a new
/// stack sharing the existing frames.
#[derive(Debug, Clone, Default)]
pub struct EvalStack {
    frames: Vec<Arc<HashMap<String, Value>>>,
}

impl EvalStack {
    pub fn new() -> Self {
        Self::default()
    }

    /// New stack with `frame` layered on top.
    pub fn push(&self, frame: HashMap<String, Value>) -> Self {
        let mut frames = self.frames.clone();
        frames.push(Arc::new(frame));
        Self { frames }
    }

    /// Innermost binding wins.
    pub fn lookup(&self, name: &str) -> Option<&Value> {
        self.frames.iter().rev().find_map(|frame| frame.get(name))
    }
}

#[cfg(test)]
#[path = "expr_tests.rs"]
mod tests;

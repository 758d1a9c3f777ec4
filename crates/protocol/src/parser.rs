// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Step-tree parsing.

use labrun_core::{
    Block, BlockState, DeviceDemands, Expr, NodePath, ParallelBlock, RepeatBlock, RepeatCount,
    SegmentBlock, SequenceBlock, StateBlock, UnitState, Value,
};
use serde_yaml::Value as Yaml;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ParseError {
    #[error("invalid YAML: {message}")]
    Syntax { message: String, location: Option<(usize, usize)> },

    #[error("{step}: missing process")]
    MissingProcess { step: String },

    /// State attributes with nothing to wrap.
    #[error("{step}: dangling attributes")]
    DanglingAttributes { step: String },

    #[error("{step}: more than one content form")]
    AmbiguousStep { step: String },

    #[error("{step}: bad attribute '{key}': {detail}")]
    BadAttribute { step: String, key: String, detail: String },

    #[error("protocol has no steps")]
    MissingSteps,
}

impl ParseError {
    pub fn notice(&self) -> labrun_core::Notice {
        let range = match self {
            ParseError::Syntax { location, .. } => *location,
            _ => None,
        };
        match range {
            Some(range) => labrun_core::Notice::with_range(self.to_string(), range),
            None => labrun_core::Notice::new(self.to_string()),
        }
    }
}

/// Parsed protocol, ready to instantiate.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedProtocol {
    pub name: Option<String>,
    pub root: Block,
}

impl ParsedProtocol {
    pub fn export(&self) -> serde_json::Value {
        serde_json::json!({
            "name": self.name,
            "root": self.root.export(),
        })
    }
}

/// Parse a draft source into a protocol, or every error found.
pub fn parse_protocol(source: &str) -> Result<ParsedProtocol, Vec<ParseError>> {
    let doc: Yaml = serde_yaml::from_str(source).map_err(|e| {
        vec![ParseError::Syntax {
            message: e.to_string(),
            location: e.location().map(|l| (l.index(), l.index())),
        }]
    })?;

    let Some(map) = doc.as_mapping() else {
        return Err(vec![ParseError::Syntax {
            message: "protocol must be a mapping".into(),
            location: None,
        }]);
    };

    let name = map
        .get(Yaml::from("name"))
        .and_then(Yaml::as_str)
        .map(str::to_string);

    let Some(steps) = map.get(Yaml::from("steps")).and_then(Yaml::as_sequence) else {
        return Err(vec![ParseError::MissingSteps]);
    };

    let mut errors = Vec::new();
    let children: Vec<Block> = steps
        .iter()
        .enumerate()
        .filter_map(|(index, step)| parse_step(step, &format!("steps[{index}]"), &mut errors))
        .collect();

    if !errors.is_empty() {
        return Err(errors);
    }
    Ok(ParsedProtocol { name, root: Block::Sequence(SequenceBlock { children }) })
}

const STATE_KEYS: [&str; 3] = ["devices", "name", "settle"];
const CONTENT_KEYS: [&str; 6] = ["wait", "noop", "actions", "parallel", "repeat", "do"];

fn parse_step(value: &Yaml, step: &str, errors: &mut Vec<ParseError>) -> Option<Block> {
    let Some(map) = value.as_mapping() else {
        errors.push(ParseError::BadAttribute {
            step: step.to_string(),
            key: String::new(),
            detail: "step must be a mapping".into(),
        });
        return None;
    };

    for key in map.keys() {
        let Some(key) = key.as_str() else {
            errors.push(ParseError::BadAttribute {
                step: step.to_string(),
                key: format!("{key:?}"),
                detail: "keys must be strings".into(),
            });
            return None;
        };
        if !STATE_KEYS.contains(&key) && !CONTENT_KEYS.contains(&key) {
            errors.push(ParseError::BadAttribute {
                step: step.to_string(),
                key: key.to_string(),
                detail: "unknown attribute".into(),
            });
            return None;
        }
    }

    let mut present: Vec<&str> = CONTENT_KEYS
        .iter()
        .copied()
        .filter(|key| map.contains_key(Yaml::from(*key)))
        .collect();
    // `repeat` consumes its `do` body; bare `do` nests a sub-step.
    if present.contains(&"repeat") {
        present.retain(|key| *key != "do");
    }

    let state = parse_state(map, step, errors)?;

    let content = match present.as_slice() {
        [] => {
            if state.is_empty() {
                errors.push(ParseError::MissingProcess { step: step.to_string() });
            } else {
                errors.push(ParseError::DanglingAttributes { step: step.to_string() });
            }
            return None;
        }
        [key] => parse_content(key, map, step, errors)?,
        _ => {
            errors.push(ParseError::AmbiguousStep { step: step.to_string() });
            return None;
        }
    };

    if state.is_empty() {
        Some(content)
    } else {
        // A nested state collapses: the outer keeps what the inner leaves.
        let block = match content {
            Block::State(inner) => {
                let (kept, owned) = state.split(&inner.state);
                let merged = kept.merge(&owned);
                Block::State(Box::new(StateBlock {
                    state: merged,
                    settle: settle_flag(map) || inner.settle,
                    child: inner.child,
                }))
            }
            child => Block::State(Box::new(StateBlock {
                state,
                settle: settle_flag(map),
                child,
            })),
        };
        Some(block)
    }
}

fn settle_flag(map: &serde_yaml::Mapping) -> bool {
    map.get(Yaml::from("settle")).and_then(Yaml::as_bool).unwrap_or(false)
}

fn parse_state(
    map: &serde_yaml::Mapping,
    step: &str,
    errors: &mut Vec<ParseError>,
) -> Option<BlockState> {
    let mut state = BlockState::empty();

    if let Some(devices) = map.get(Yaml::from("devices")) {
        let Some(devices) = devices.as_mapping() else {
            errors.push(ParseError::BadAttribute {
                step: step.to_string(),
                key: "devices".into(),
                detail: "must map node paths to values".into(),
            });
            return None;
        };
        let mut demands = DeviceDemands::new();
        for (path, value) in devices {
            let Some(path) = path.as_str() else {
                errors.push(ParseError::BadAttribute {
                    step: step.to_string(),
                    key: "devices".into(),
                    detail: "node paths must be strings".into(),
                });
                return None;
            };
            let Some(expr) = parse_expr(value) else {
                errors.push(ParseError::BadAttribute {
                    step: step.to_string(),
                    key: path.to_string(),
                    detail: "unsupported value".into(),
                });
                return None;
            };
            demands.insert(NodePath::from_dotted(path), expr);
        }
        state.insert(UnitState::Devices(demands));
    }

    if let Some(name) = map.get(Yaml::from("name")) {
        match name.as_str() {
            Some(name) => state.insert(UnitState::Name(name.to_string())),
            None => {
                errors.push(ParseError::BadAttribute {
                    step: step.to_string(),
                    key: "name".into(),
                    detail: "must be a string".into(),
                });
                return None;
            }
        }
    }

    Some(state)
}

/// Scalars starting with `$` reference a runtime variable.
fn parse_expr(value: &Yaml) -> Option<Expr> {
    match value {
        Yaml::Null => Some(Expr::literal(Value::Null)),
        Yaml::Bool(b) => Some(Expr::literal(*b)),
        Yaml::Number(n) => n.as_f64().map(Expr::literal),
        Yaml::String(s) => match s.strip_prefix('$') {
            Some(name) => Some(Expr::var(name)),
            None => Some(Expr::literal(s.as_str())),
        },
        _ => None,
    }
}

fn parse_content(
    key: &str,
    map: &serde_yaml::Mapping,
    step: &str,
    errors: &mut Vec<ParseError>,
) -> Option<Block> {
    match key {
        "wait" => {
            let duration = map.get(Yaml::from("wait")).and_then(Yaml::as_u64);
            match duration {
                Some(duration_ms) => Some(Block::Segment(SegmentBlock {
                    namespace: "timer".into(),
                    process: serde_json::json!({ "duration_ms": duration_ms }),
                })),
                None => {
                    errors.push(ParseError::BadAttribute {
                        step: step.to_string(),
                        key: "wait".into(),
                        detail: "must be a duration in milliseconds".into(),
                    });
                    None
                }
            }
        }
        "noop" => Some(Block::Segment(SegmentBlock {
            namespace: "noop".into(),
            process: serde_json::Value::Null,
        })),
        "actions" => {
            let Some(actions) = map.get(Yaml::from("actions")).and_then(Yaml::as_sequence) else {
                errors.push(ParseError::BadAttribute {
                    step: step.to_string(),
                    key: "actions".into(),
                    detail: "must be a list of steps".into(),
                });
                return None;
            };
            let before = errors.len();
            let children: Vec<Block> = actions
                .iter()
                .enumerate()
                .filter_map(|(index, child)| {
                    parse_step(child, &format!("{step}.actions[{index}]"), errors)
                })
                .collect();
            if errors.len() > before {
                return None;
            }
            Some(Block::Sequence(SequenceBlock { children }))
        }
        "parallel" => {
            let Some(branches) = map.get(Yaml::from("parallel")).and_then(Yaml::as_sequence)
            else {
                errors.push(ParseError::BadAttribute {
                    step: step.to_string(),
                    key: "parallel".into(),
                    detail: "must be a list of steps".into(),
                });
                return None;
            };
            let before = errors.len();
            let children: Vec<Block> = branches
                .iter()
                .enumerate()
                .filter_map(|(index, child)| {
                    parse_step(child, &format!("{step}.parallel[{index}]"), errors)
                })
                .collect();
            if errors.len() > before {
                return None;
            }
            Some(Block::Parallel(ParallelBlock { children }))
        }
        "repeat" => {
            let count = match map.get(Yaml::from("repeat")) {
                Some(Yaml::Number(n)) => n.as_u64().map(RepeatCount::Times),
                Some(Yaml::String(s)) if s == "forever" => Some(RepeatCount::Forever),
                _ => None,
            };
            let Some(count) = count else {
                errors.push(ParseError::BadAttribute {
                    step: step.to_string(),
                    key: "repeat".into(),
                    detail: "must be a positive count or \"forever\"".into(),
                });
                return None;
            };
            let Some(body) = map.get(Yaml::from("do")) else {
                errors.push(ParseError::BadAttribute {
                    step: step.to_string(),
                    key: "do".into(),
                    detail: "repeat requires a body".into(),
                });
                return None;
            };
            let child = parse_step(body, &format!("{step}.do"), errors)?;
            Some(Block::Repeat(Box::new(RepeatBlock { count, child })))
        }
        "do" => {
            let body = map.get(Yaml::from("do"))?;
            parse_step(body, &format!("{step}.do"), errors)
        }
        _ => None,
    }
}

#[cfg(test)]
#[path = "parser_tests.rs"]
mod tests;

// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The parsed protocol tree.
//!
//! Blocks are immutable; the runtime instantiates a program per block at run
//! time. Points address a resume position inside a block and round-trip
//! through their exported form.

use crate::state::BlockState;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum PointError {
    #[error("point does not match block: expected {expected} point, got {got}")]
    Shape { expected: &'static str, got: &'static str },
    #[error("child index {index} out of range ({len} children)")]
    IndexOutOfRange { index: u32, len: usize },
    #[error("malformed point payload: {0}")]
    Malformed(String),
}

/// Leaf block carrying a namespaced process descriptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentBlock {
    /// Process namespace, resolved against the process registry.
    pub namespace: String,
    /// Process-specific payload, opaque to the core.
    pub process: Json,
}

/// Wraps a child with a block state and a settle flag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateBlock {
    pub state: BlockState,
    /// Wait for the state to settle before entering the child.
    #[serde(default)]
    pub settle: bool,
    pub child: Block,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequenceBlock {
    pub children: Vec<Block>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParallelBlock {
    pub children: Vec<Block>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RepeatCount {
    Times(u64),
    Forever,
}

impl RepeatCount {
    pub fn is_done(&self, iteration: u64) -> bool {
        match self {
            RepeatCount::Times(n) => iteration >= *n,
            RepeatCount::Forever => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepeatBlock {
    pub count: RepeatCount,
    pub child: Block,
}

/// Immutable node of the parsed tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Block {
    Segment(SegmentBlock),
    State(Box<StateBlock>),
    Sequence(SequenceBlock),
    Parallel(ParallelBlock),
    Repeat(Box<RepeatBlock>),
}

crate::simple_display! {
    Block {
        Segment(..) => "segment",
        State(..) => "state",
        Sequence(..) => "sequence",
        Parallel(..) => "parallel",
        Repeat(..) => "repeat",
    }
}

impl Block {
    pub fn kind(&self) -> &'static str {
        match self {
            Block::Segment(_) => "segment",
            Block::State(_) => "state",
            Block::Sequence(_) => "sequence",
            Block::Parallel(_) => "parallel",
            Block::Repeat(_) => "repeat",
        }
    }

    /// Serializable form for client display.
    pub fn export(&self) -> Json {
        serde_json::to_value(self).unwrap_or(Json::Null)
    }

    /// Parse and validate a client-supplied point against this block.
    pub fn import_point(&self, data: &Json) -> Result<Point, PointError> {
        let point: Point =
            serde_json::from_value(data.clone()).map_err(|e| PointError::Malformed(e.to_string()))?;
        self.validate_point(&point)?;
        Ok(point)
    }

    fn validate_point(&self, point: &Point) -> Result<(), PointError> {
        match (self, point) {
            (Block::Segment(_), Point::Segment { .. }) => Ok(()),
            (Block::State(block), Point::State { child }) => match child {
                Some(child) => block.child.validate_point(child),
                None => Ok(()),
            },
            (Block::Sequence(block), Point::Sequence { index, child }) => {
                let len = block.children.len();
                if *index as usize >= len {
                    return Err(PointError::IndexOutOfRange { index: *index, len });
                }
                match child {
                    Some(child) => block.children[*index as usize].validate_point(child),
                    None => Ok(()),
                }
            }
            (Block::Parallel(block), Point::Parallel { children }) => {
                let len = block.children.len();
                for (index, child) in children {
                    if *index as usize >= len {
                        return Err(PointError::IndexOutOfRange { index: *index, len });
                    }
                    block.children[*index as usize].validate_point(child)?;
                }
                Ok(())
            }
            (Block::Repeat(block), Point::Repeat { child, .. }) => match child {
                Some(child) => block.child.validate_point(child),
                None => Ok(()),
            },
            (block, point) => {
                Err(PointError::Shape { expected: block.kind(), got: point.kind() })
            }
        }
    }
}

/// A resume position inside a block, mirroring the block's shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Point {
    Segment {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        process: Option<Json>,
    },
    State {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        child: Option<Box<Point>>,
    },
    Sequence {
        index: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        child: Option<Box<Point>>,
    },
    Parallel {
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        children: BTreeMap<u32, Point>,
    },
    Repeat {
        iteration: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        child: Option<Box<Point>>,
    },
}

impl Point {
    pub fn kind(&self) -> &'static str {
        match self {
            Point::Segment { .. } => "segment",
            Point::State { .. } => "state",
            Point::Sequence { .. } => "sequence",
            Point::Parallel { .. } => "parallel",
            Point::Repeat { .. } => "repeat",
        }
    }

    /// Serializable form; the inverse of [`Block::import_point`].
    pub fn export(&self) -> Json {
        serde_json::to_value(self).unwrap_or(Json::Null)
    }
}

#[cfg(test)]
#[path = "block_tests.rs"]
mod tests;

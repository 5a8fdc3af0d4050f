//! Language-neutral syntax tree consumed by the inference engine.
//!
//! A [`SourceParser`] turns source text into a [`SyntaxNode`] tree. Only the
//! constructs the engine pattern-matches on get dedicated kinds; everything
//! else is kept as [`NodeKind::Other`] so that nested calls remain reachable.
//!
//! Child layout by kind:
//!
//! | Kind        | Children                                        |
//! |-------------|-------------------------------------------------|
//! | `Call`      | callee, then positional args, then `Keyword`s   |
//! | `Attribute` | the object expression                           |
//! | `Assign`    | target, value                                   |
//! | `Dict`      | `Pair`s                                         |
//! | `Pair`      | key, value                                      |
//! | `Keyword`   | value                                           |
//! | `ClassDef`  | body statements                                 |

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Str(String),
    Number(String),
    Bool(bool),
    None,
}

#[derive(Debug, Clone, PartialEq)]
pub enum NodeKind {
    Module,
    ClassDef { name: String },
    FunctionDef { name: String },
    Call,
    Attribute { attr: String },
    Name { id: String },
    Literal(Literal),
    Assign,
    Dict,
    Pair,
    Keyword { name: String },
    Other(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct SyntaxNode {
    pub kind: NodeKind,
    /// One-based source line.
    pub line: usize,
    pub children: Vec<SyntaxNode>,
}

impl SyntaxNode {
    pub fn new(kind: NodeKind, line: usize, children: Vec<SyntaxNode>) -> Self {
        Self {
            kind,
            line,
            children,
        }
    }

    pub fn leaf(kind: NodeKind, line: usize) -> Self {
        Self::new(kind, line, Vec::new())
    }

    pub fn as_str_literal(&self) -> Option<&str> {
        match &self.kind {
            NodeKind::Literal(Literal::Str(s)) => Some(s),
            _ => None,
        }
    }

    pub fn as_name(&self) -> Option<&str> {
        match &self.kind {
            NodeKind::Name { id } => Some(id),
            _ => None,
        }
    }

    /// Positional arguments of a `Call`; empty for other kinds.
    pub fn positional_args(&self) -> &[SyntaxNode] {
        if self.kind != NodeKind::Call || self.children.is_empty() {
            return &[];
        }
        let args = &self.children[1..];
        let end = args
            .iter()
            .position(|c| matches!(c.kind, NodeKind::Keyword { .. }))
            .unwrap_or(args.len());
        &args[..end]
    }
}

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("{path}: syntax error near line {line}")]
    Syntax { path: PathBuf, line: usize },
    #[error("{path}: parser unavailable: {message}")]
    Parser { path: PathBuf, message: String },
    #[error("{path}: nesting deeper than {limit} levels near line {line}")]
    TooDeep {
        path: PathBuf,
        line: usize,
        limit: usize,
    },
}

/// Turns source text into a [`SyntaxNode`] tree.
pub trait SourceParser: Send + Sync {
    fn parse(&self, path: &std::path::Path, source: &str) -> Result<SyntaxNode, ParseError>;
}

/// Depth-first traversal with enter/leave hooks.
///
/// `enter` returning `false` skips the node's children.
pub trait Visitor {
    fn enter(&mut self, node: &SyntaxNode) -> bool;

    fn leave(&mut self, _node: &SyntaxNode) {}
}

pub fn walk<V: Visitor + ?Sized>(visitor: &mut V, root: &SyntaxNode) {
    // Explicit stack of (node, next child index); only entered nodes are pushed.
    let mut stack: Vec<(&SyntaxNode, usize)> = Vec::new();
    if !visitor.enter(root) {
        visitor.leave(root);
        return;
    }
    stack.push((root, 0));

    while let Some(top) = stack.last_mut() {
        let node = top.0;
        match node.children.get(top.1) {
            Some(child) => {
                top.1 += 1;
                if visitor.enter(child) {
                    stack.push((child, 0));
                } else {
                    visitor.leave(child);
                }
            }
            None => {
                stack.pop();
                visitor.leave(node);
            }
        }
    }
}

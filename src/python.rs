//! Python front end for the syntax tree, backed by tree-sitter.

use std::path::Path;
use tree_sitter::{Node, Parser};

use crate::syntax::{Literal, NodeKind, ParseError, SourceParser, SyntaxNode};

/// Deepest concrete syntax tree accepted. Conversion recurses once per level,
/// so anything deeper is reported as a parse failure instead.
pub const MAX_DEPTH: usize = 160;

#[derive(Debug, Default, Clone, Copy)]
pub struct PythonParser;

impl PythonParser {
    pub fn new() -> Self {
        Self
    }
}

impl SourceParser for PythonParser {
    fn parse(&self, path: &Path, source: &str) -> Result<SyntaxNode, ParseError> {
        let mut parser = Parser::new();
        let lang: tree_sitter::Language = tree_sitter_python::LANGUAGE.into();
        parser
            .set_language(&lang)
            .map_err(|e| ParseError::Parser {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?;

        let tree = parser.parse(source, None).ok_or_else(|| ParseError::Parser {
            path: path.to_path_buf(),
            message: "parse returned no tree".to_string(),
        })?;

        let root = tree.root_node();
        if root.has_error() {
            return Err(ParseError::Syntax {
                path: path.to_path_buf(),
                line: first_error_line(root).unwrap_or(1),
            });
        }
        if let Some(line) = line_beyond_depth(root, MAX_DEPTH) {
            return Err(ParseError::TooDeep {
                path: path.to_path_buf(),
                line,
                limit: MAX_DEPTH,
            });
        }

        Ok(convert(root, source.as_bytes()))
    }
}

/// Line of the first error or missing node, visiting only subtrees that
/// contain errors.
fn first_error_line(root: Node) -> Option<usize> {
    let mut cursor = root.walk();
    loop {
        let node = cursor.node();
        if node.is_error() || node.is_missing() {
            return Some(node.start_position().row + 1);
        }
        if node.has_error() && cursor.goto_first_child() {
            continue;
        }
        loop {
            if cursor.goto_next_sibling() {
                break;
            }
            if !cursor.goto_parent() {
                return None;
            }
        }
    }
}

/// Line of the first node nested more than `limit` levels below `root`.
fn line_beyond_depth(root: Node, limit: usize) -> Option<usize> {
    let mut cursor = root.walk();
    let mut depth = 0usize;
    loop {
        if depth > limit {
            return Some(cursor.node().start_position().row + 1);
        }
        if cursor.goto_first_child() {
            depth += 1;
            continue;
        }
        loop {
            if cursor.goto_next_sibling() {
                break;
            }
            if !cursor.goto_parent() {
                return None;
            }
            depth -= 1;
        }
    }
}

fn text<'a>(node: Node, src: &'a [u8]) -> &'a str {
    node.utf8_text(src).unwrap_or("")
}

fn named_children(node: Node) -> Vec<Node> {
    let mut cursor = node.walk();
    node.named_children(&mut cursor)
        .filter(|c| c.kind() != "comment")
        .collect()
}

fn convert_all(nodes: Vec<Node>, src: &[u8]) -> Vec<SyntaxNode> {
    nodes.into_iter().map(|n| convert(n, src)).collect()
}

fn field_text(node: Node, field: &str, src: &[u8]) -> String {
    node.child_by_field_name(field)
        .map(|n| text(n, src).to_string())
        .unwrap_or_default()
}

fn convert(node: Node, src: &[u8]) -> SyntaxNode {
    let line = node.start_position().row + 1;
    let other = |node: Node| {
        SyntaxNode::new(
            NodeKind::Other(node.kind().to_string()),
            line,
            convert_all(named_children(node), src),
        )
    };

    match node.kind() {
        "module" => SyntaxNode::new(NodeKind::Module, line, convert_all(named_children(node), src)),
        "expression_statement" => {
            let mut children = named_children(node);
            if children.len() == 1 {
                convert(children.remove(0), src)
            } else {
                other(node)
            }
        }
        "decorated_definition" => match node.child_by_field_name("definition") {
            Some(def) => convert(def, src),
            None => other(node),
        },
        "class_definition" => {
            let body = node
                .child_by_field_name("body")
                .map(|b| convert_all(named_children(b), src))
                .unwrap_or_default();
            SyntaxNode::new(
                NodeKind::ClassDef {
                    name: field_text(node, "name", src),
                },
                line,
                body,
            )
        }
        "function_definition" => {
            let body = node
                .child_by_field_name("body")
                .map(|b| convert_all(named_children(b), src))
                .unwrap_or_default();
            SyntaxNode::new(
                NodeKind::FunctionDef {
                    name: field_text(node, "name", src),
                },
                line,
                body,
            )
        }
        "call" => {
            let mut children = Vec::new();
            if let Some(callee) = node.child_by_field_name("function") {
                children.push(convert(callee, src));
            }
            if let Some(args) = node.child_by_field_name("arguments") {
                if args.kind() == "argument_list" {
                    let (keywords, positional): (Vec<Node>, Vec<Node>) = named_children(args)
                        .into_iter()
                        .partition(|a| a.kind() == "keyword_argument");
                    children.extend(convert_all(positional, src));
                    children.extend(keywords.into_iter().map(|kw| {
                        let value = kw
                            .child_by_field_name("value")
                            .map(|v| vec![convert(v, src)])
                            .unwrap_or_default();
                        SyntaxNode::new(
                            NodeKind::Keyword {
                                name: field_text(kw, "name", src),
                            },
                            kw.start_position().row + 1,
                            value,
                        )
                    }));
                } else {
                    children.push(convert(args, src));
                }
            }
            SyntaxNode::new(NodeKind::Call, line, children)
        }
        "attribute" => {
            let object = node
                .child_by_field_name("object")
                .map(|o| vec![convert(o, src)])
                .unwrap_or_default();
            SyntaxNode::new(
                NodeKind::Attribute {
                    attr: field_text(node, "attribute", src),
                },
                line,
                object,
            )
        }
        "identifier" => SyntaxNode::leaf(
            NodeKind::Name {
                id: text(node, src).to_string(),
            },
            line,
        ),
        "string" => match string_literal(node, src) {
            Some(value) => SyntaxNode::leaf(NodeKind::Literal(Literal::Str(value)), line),
            None => other(node),
        },
        "concatenated_string" => {
            let parts: Option<Vec<String>> = named_children(node)
                .into_iter()
                .map(|part| string_literal(part, src))
                .collect();
            match parts {
                Some(parts) => SyntaxNode::leaf(NodeKind::Literal(Literal::Str(parts.concat())), line),
                None => other(node),
            }
        }
        "integer" | "float" => SyntaxNode::leaf(
            NodeKind::Literal(Literal::Number(text(node, src).to_string())),
            line,
        ),
        "true" => SyntaxNode::leaf(NodeKind::Literal(Literal::Bool(true)), line),
        "false" => SyntaxNode::leaf(NodeKind::Literal(Literal::Bool(false)), line),
        "none" => SyntaxNode::leaf(NodeKind::Literal(Literal::None), line),
        "assignment" => match (node.child_by_field_name("left"), node.child_by_field_name("right")) {
            (Some(left), Some(right)) => SyntaxNode::new(
                NodeKind::Assign,
                line,
                vec![convert(left, src), convert(right, src)],
            ),
            _ => other(node),
        },
        "dictionary" => SyntaxNode::new(NodeKind::Dict, line, convert_all(named_children(node), src)),
        "pair" => match (node.child_by_field_name("key"), node.child_by_field_name("value")) {
            (Some(key), Some(value)) => SyntaxNode::new(
                NodeKind::Pair,
                line,
                vec![convert(key, src), convert(value, src)],
            ),
            _ => other(node),
        },
        _ => other(node),
    }
}

/// Value of a plain string literal; `None` for f-strings with interpolations.
fn string_literal(node: Node, src: &[u8]) -> Option<String> {
    if node.kind() != "string" {
        return None;
    }
    let mut cursor = node.walk();
    if node
        .named_children(&mut cursor)
        .any(|c| c.kind() == "interpolation")
    {
        return None;
    }

    let raw = text(node, src);
    let body = raw.trim_start_matches(|c: char| c.is_ascii_alphabetic());
    for quote in ["\"\"\"", "'''", "\"", "'"] {
        if let Some(inner) = body
            .strip_prefix(quote)
            .and_then(|rest| rest.strip_suffix(quote))
        {
            return Some(inner.to_string());
        }
    }
    None
}

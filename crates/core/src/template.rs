//! Kernel template language.
//!
//! Templates are device source with four kinds of holes:
//!
//! * `{{name}}` substitutes a scalar or string binding; `{{type}}` is the C
//!   type of the first tensor binding.
//! * `SIZE_k(t)` is the extent of dimension `k` of tensor `t`.
//! * `OFFSET_k(t, i0, .., i{k-1})` is the flat element offset
//!   `((i0)*s0)+..` built from the strides of `t`.
//! * `VALUE_k(t, i0, ..)` is `t[OFFSET_k(t, i0, ..)]`.
//!
//! Source is parsed once into a small tree and rendered against a
//! [`BindingSet`], so nested macros resolve inner-first without any textual
//! rescanning. Inside macro arguments `{..}` groups like `(..)`, which lets
//! authors write index expressions that contain commas.

use std::collections::BTreeSet;
use std::fmt;

use anyhow::{bail, Context, Result};

use crate::types::{Binding, BindingSet, TensorDescriptor};

/// Reserved placeholder resolved from the designated tensor's dtype.
pub const TYPE_PLACEHOLDER: &str = "type";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MacroKind {
    Size,
    Offset,
    Value,
}

impl MacroKind {
    fn prefix(self) -> &'static str {
        match self {
            Self::Size => "SIZE_",
            Self::Offset => "OFFSET_",
            Self::Value => "VALUE_",
        }
    }

    /// Split an identifier like `VALUE_4` into its kind and rank.
    fn from_identifier(ident: &str) -> Option<(Self, usize)> {
        [Self::Size, Self::Offset, Self::Value]
            .into_iter()
            .find_map(|kind| {
                let digits = ident.strip_prefix(kind.prefix())?;
                if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
                    return None;
                }
                digits.parse().ok().map(|rank| (kind, rank))
            })
    }
}

impl fmt::Display for MacroKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.prefix().trim_end_matches('_'))
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Node {
    Text(String),
    Placeholder(String),
    /// `(..)` or `{..}` inside a macro argument; both render as parentheses.
    Group(Vec<Node>),
    Macro {
        kind: MacroKind,
        rank: usize,
        line: usize,
        args: Vec<Vec<Node>>,
    },
}

/// A parsed kernel template.
#[derive(Debug, Clone, PartialEq)]
pub struct KernelTemplate {
    function: String,
    nodes: Vec<Node>,
}

impl KernelTemplate {
    pub fn parse(function: &str, source: &str) -> Result<Self> {
        let mut parser = Parser {
            function,
            src: source,
            bytes: source.as_bytes(),
            pos: 0,
        };
        let (nodes, _) = parser.parse_nodes(Scope::Top)?;
        Ok(Self {
            function: function.to_string(),
            nodes,
        })
    }

    pub fn function(&self) -> &str {
        &self.function
    }

    /// Names of every `{{..}}` placeholder, macro arguments included.
    pub fn placeholders(&self) -> BTreeSet<String> {
        let mut names = BTreeSet::new();
        collect_placeholders(&self.nodes, &mut names);
        names
    }

    /// Placeholders and macro calls still present, rendered as they appear
    /// in source. Empty for a fully resolved kernel.
    pub fn unresolved(&self) -> Vec<String> {
        let mut items = Vec::new();
        collect_unresolved(&self.nodes, &mut items);
        items
    }

    pub fn render(&self, bindings: &BindingSet<'_>) -> Result<String> {
        let renderer = Renderer {
            function: &self.function,
            bindings,
        };
        let mut out = String::new();
        renderer.render_nodes(&self.nodes, &mut out)?;
        Ok(out)
    }
}

/// Parse and render `source` in one step.
pub fn resolve(function: &str, source: &str, bindings: &BindingSet<'_>) -> Result<String> {
    KernelTemplate::parse(function, source)?.render(bindings)
}

fn collect_placeholders(nodes: &[Node], names: &mut BTreeSet<String>) {
    for node in nodes {
        match node {
            Node::Text(_) => {}
            Node::Placeholder(name) => {
                names.insert(name.clone());
            }
            Node::Group(inner) => collect_placeholders(inner, names),
            Node::Macro { args, .. } => {
                for arg in args {
                    collect_placeholders(arg, names);
                }
            }
        }
    }
}

fn collect_unresolved(nodes: &[Node], items: &mut Vec<String>) {
    for node in nodes {
        match node {
            Node::Text(_) => {}
            Node::Placeholder(name) => items.push(format!("{{{{{name}}}}}")),
            Node::Group(inner) => collect_unresolved(inner, items),
            Node::Macro { kind, rank, .. } => items.push(format!("{kind}_{rank}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scope {
    Top,
    Argument,
    Group(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stop {
    End,
    Comma,
    Close,
}

struct Parser<'a> {
    function: &'a str,
    src: &'a str,
    bytes: &'a [u8],
    pos: usize,
}

fn is_ident_start(b: u8) -> bool {
    b.is_ascii_alphabetic() || b == b'_'
}

fn is_ident_char(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

impl Parser<'_> {
    fn line_at(&self, pos: usize) -> usize {
        self.bytes[..pos].iter().filter(|&&b| b == b'\n').count() + 1
    }

    fn ident_end(&self, start: usize) -> usize {
        let mut end = start;
        while end < self.bytes.len() && is_ident_char(self.bytes[end]) {
            end += 1;
        }
        end
    }

    fn skip_spaces(&self, mut pos: usize) -> usize {
        while pos < self.bytes.len() && self.bytes[pos].is_ascii_whitespace() {
            pos += 1;
        }
        pos
    }

    /// `{{ ident }}` starting at `start`, returning the name and end offset.
    fn placeholder_at(&self, start: usize) -> Option<(String, usize)> {
        if !self.src[start..].starts_with("{{") {
            return None;
        }
        let name_start = self.skip_spaces(start + 2);
        if name_start >= self.bytes.len() || !is_ident_start(self.bytes[name_start]) {
            return None;
        }
        let name_end = self.ident_end(name_start);
        let close = self.skip_spaces(name_end);
        if !self.src[close..].starts_with("}}") {
            return None;
        }
        Some((self.src[name_start..name_end].to_string(), close + 2))
    }

    fn flush_text(&self, nodes: &mut Vec<Node>, text_start: usize) {
        if text_start < self.pos {
            nodes.push(Node::Text(self.src[text_start..self.pos].to_string()));
        }
    }

    fn parse_nodes(&mut self, scope: Scope) -> Result<(Vec<Node>, Stop)> {
        let mut nodes = Vec::new();
        let mut text_start = self.pos;

        while self.pos < self.bytes.len() {
            let b = self.bytes[self.pos];

            if b == b'{' {
                if let Some((name, end)) = self.placeholder_at(self.pos) {
                    self.flush_text(&mut nodes, text_start);
                    nodes.push(Node::Placeholder(name));
                    self.pos = end;
                    text_start = end;
                    continue;
                }
            }

            if is_ident_start(b) && (self.pos == 0 || !is_ident_char(self.bytes[self.pos - 1])) {
                let end = self.ident_end(self.pos);
                let call = MacroKind::from_identifier(&self.src[self.pos..end])
                    .filter(|_| self.bytes.get(end) == Some(&b'('));
                if let Some((kind, rank)) = call {
                    self.flush_text(&mut nodes, text_start);
                    let line = self.line_at(self.pos);
                    self.pos = end + 1;
                    let args = self.parse_args().with_context(|| {
                        format!(
                            "kernel `{}`: malformed {kind}_{rank} call at line {line}",
                            self.function
                        )
                    })?;
                    nodes.push(Node::Macro {
                        kind,
                        rank,
                        line,
                        args,
                    });
                    text_start = self.pos;
                } else {
                    self.pos = end;
                }
                continue;
            }

            if scope != Scope::Top {
                match b {
                    b'(' | b'{' => {
                        self.flush_text(&mut nodes, text_start);
                        self.pos += 1;
                        let close = if b == b'(' { b')' } else { b'}' };
                        let (inner, _) = self.parse_nodes(Scope::Group(close))?;
                        nodes.push(Node::Group(inner));
                        text_start = self.pos;
                        continue;
                    }
                    b')' | b'}' => {
                        let expected = match scope {
                            Scope::Group(close) => close,
                            _ => b')',
                        };
                        if b != expected {
                            bail!(
                                "unbalanced `{}` at line {}, expected `{}`",
                                b as char,
                                self.line_at(self.pos),
                                expected as char
                            );
                        }
                        self.flush_text(&mut nodes, text_start);
                        self.pos += 1;
                        return Ok((nodes, Stop::Close));
                    }
                    b',' if scope == Scope::Argument => {
                        self.flush_text(&mut nodes, text_start);
                        self.pos += 1;
                        return Ok((nodes, Stop::Comma));
                    }
                    _ => {}
                }
            }

            self.pos += 1;
        }

        self.flush_text(&mut nodes, text_start);
        if scope != Scope::Top {
            bail!("unbalanced parentheses: reached end of template inside a macro call");
        }
        Ok((nodes, Stop::End))
    }

    fn parse_args(&mut self) -> Result<Vec<Vec<Node>>> {
        let mut args = Vec::new();
        loop {
            let (arg, stop) = self.parse_nodes(Scope::Argument)?;
            args.push(arg);
            match stop {
                Stop::Comma => continue,
                Stop::Close | Stop::End => return Ok(args),
            }
        }
    }
}

struct Renderer<'a, 'buf> {
    function: &'a str,
    bindings: &'a BindingSet<'buf>,
}

impl Renderer<'_, '_> {
    fn render_nodes(&self, nodes: &[Node], out: &mut String) -> Result<()> {
        for node in nodes {
            match node {
                Node::Text(text) => out.push_str(text),
                Node::Placeholder(name) => out.push_str(&self.placeholder(name)?),
                Node::Group(inner) => {
                    out.push('(');
                    self.render_nodes(inner, out)?;
                    out.push(')');
                }
                Node::Macro {
                    kind,
                    rank,
                    line,
                    args,
                } => {
                    let expanded = self.expand_macro(*kind, *rank, args).with_context(|| {
                        format!(
                            "kernel `{}`: cannot expand {kind}_{rank} at line {line}",
                            self.function
                        )
                    })?;
                    out.push_str(&expanded);
                }
            }
        }
        Ok(())
    }

    fn placeholder(&self, name: &str) -> Result<String> {
        if name == TYPE_PLACEHOLDER {
            let Some((tensor, desc)) = self.bindings.designated_tensor() else {
                bail!(
                    "kernel `{}`: `{{{{type}}}}` needs at least one tensor binding",
                    self.function
                );
            };
            let Some(c_type) = desc.dtype().c_type() else {
                bail!(
                    "kernel `{}`: tensor `{tensor}` has unsupported dtype {} for `{{{{type}}}}`",
                    self.function,
                    desc.dtype()
                );
            };
            return Ok(c_type.to_string());
        }

        match self.bindings.get(name) {
            None => bail!(
                "kernel `{}`: unbound placeholder `{{{{{name}}}}}`",
                self.function
            ),
            Some(binding) => binding.scalar_text().with_context(|| {
                format!(
                    "kernel `{}`: placeholder `{{{{{name}}}}}` is bound to a tensor",
                    self.function
                )
            }),
        }
    }

    fn expand_macro(&self, kind: MacroKind, rank: usize, args: &[Vec<Node>]) -> Result<String> {
        let mut rendered = Vec::with_capacity(args.len());
        for (position, arg) in args.iter().enumerate() {
            let mut text = String::new();
            self.render_nodes(arg, &mut text)?;
            let text = text.trim().to_string();
            if text.is_empty() {
                bail!("argument {} is empty", position + 1);
            }
            rendered.push(text);
        }

        let (name, indices) = rendered
            .split_first()
            .context("missing tensor argument")?;
        let desc = self.tensor(name)?;

        match kind {
            MacroKind::Size => {
                if !indices.is_empty() {
                    bail!("expects 1 argument, got {}", rendered.len());
                }
                match desc.shape().get(rank) {
                    Some(extent) => Ok(extent.to_string()),
                    None => bail!(
                        "dimension {rank} out of range for `{name}` of rank {}",
                        desc.rank()
                    ),
                }
            }
            MacroKind::Offset | MacroKind::Value => {
                if indices.len() != rank {
                    bail!("expects {} arguments, got {}", rank + 1, rendered.len());
                }
                if rank > desc.rank() {
                    bail!("`{name}` has rank {}, fewer than {rank} indices", desc.rank());
                }
                let terms = indices
                    .iter()
                    .zip(desc.strides())
                    .map(|(index, stride)| format_term(index, *stride))
                    .collect::<Vec<_>>();
                let flat = if terms.is_empty() {
                    "0".to_string()
                } else {
                    terms.join("+")
                };
                Ok(match kind {
                    MacroKind::Value => format!("{name}[{flat}]"),
                    _ => format!("({flat})"),
                })
            }
        }
    }

    fn tensor(&self, name: &str) -> Result<&TensorDescriptor<'_>> {
        match self.bindings.get(name) {
            None => bail!("unknown tensor `{name}`"),
            Some(Binding::Tensor(desc)) => {
                if desc.strides().len() != desc.rank() {
                    bail!(
                        "tensor `{name}` has {} strides for rank {}",
                        desc.strides().len(),
                        desc.rank()
                    );
                }
                Ok(desc)
            }
            Some(other) => bail!("`{name}` is bound to a {}, not a tensor", other.kind()),
        }
    }
}

fn format_term(index: &str, stride: isize) -> String {
    if stride < 0 {
        format!("(({index})*({stride}))")
    } else {
        format!("(({index})*{stride})")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DType;

    fn tensor(dtype: DType, shape: &[usize]) -> TensorDescriptor<'static> {
        let strides = TensorDescriptor::contiguous_strides(shape);
        TensorDescriptor::layout_only(dtype, shape, &strides)
    }

    fn bindings() -> BindingSet<'static> {
        BindingSet::new()
            .with_tensor("input", tensor(DType::F32, &[2, 3, 4, 5]))
            .with_tensor("flow", tensor(DType::F32, &[2, 2, 4, 5]))
            .with_int("n", 120)
    }

    fn err_text(result: Result<String>) -> String {
        format!("{:#}", result.expect_err("resolution should fail"))
    }

    #[test]
    fn test_scalar_and_type_substitution() {
        let source = "{{type}} x = {{ n }}; float e = {{eps}}; bool b = {{flag}}; {{name}}";
        let set = bindings()
            .with_float("eps", 1e-7)
            .with_bool("flag", false)
            .with_str("name", "kernel_body");
        let out = resolve("k", source, &set).expect("template should resolve");
        assert_eq!(
            out,
            "float x = 120; float e = 1e-7; bool b = false; kernel_body"
        );
    }

    #[test]
    fn test_type_follows_first_tensor() {
        let set = BindingSet::new()
            .with_tensor("a", tensor(DType::F64, &[1]))
            .with_tensor("b", tensor(DType::F16, &[1]));
        assert_eq!(resolve("k", "{{type}}", &set).expect("resolve"), "double");

        let set = BindingSet::new().with_tensor("a", tensor(DType::U8, &[1]));
        assert_eq!(
            resolve("k", "{{type}}", &set).expect("resolve"),
            "unsigned char"
        );
    }

    #[test]
    fn test_size_macro() {
        let out = resolve("k", "SIZE_0(input) SIZE_3( input )", &bindings()).expect("resolve");
        assert_eq!(out, "2 5");
    }

    #[test]
    fn test_offset_and_value_macros() {
        let out = resolve("k", "OFFSET_2(input, a, b)", &bindings()).expect("resolve");
        assert_eq!(out, "(((a)*60)+((b)*20))");

        let out = resolve("k", "VALUE_4(flow, n, 1, y, x)", &bindings()).expect("resolve");
        assert_eq!(out, "flow[((n)*40)+((1)*20)+((y)*5)+((x)*1)]");

        let out = resolve("k", "OFFSET_0(input) VALUE_0(input)", &bindings()).expect("resolve");
        assert_eq!(out, "(0) input[0]");
    }

    #[test]
    fn test_nested_macros_and_brace_groups() {
        let source = "VALUE_2(input, SIZE_0(input) - 1, {a, b}[0] + (c * SIZE_1(flow)))";
        let out = resolve("k", source, &bindings()).expect("resolve");
        assert_eq!(
            out,
            "input[((2 - 1)*60)+(((a, b)[0] + (c * 2))*20)]"
        );
    }

    #[test]
    fn test_placeholder_inside_macro_argument() {
        let set = bindings().with_str("target", "flow");
        let out = resolve("k", "SIZE_1({{target}}) OFFSET_1(input, {{n}})", &set).expect("resolve");
        assert_eq!(out, "2 (((120)*60))");
    }

    #[test]
    fn test_negative_strides_are_parenthesised() {
        let set = BindingSet::new().with_tensor(
            "rev",
            TensorDescriptor::layout_only(DType::F32, &[4, 3], &[-3, 1]),
        );
        let out = resolve("k", "OFFSET_2(rev, i, j)", &set).expect("resolve");
        assert_eq!(out, "(((i)*(-3))+((j)*1))");
    }

    #[test]
    fn test_macros_need_identifier_boundary_and_call() {
        let source = "MY_SIZE_1(input) SIZE_1 ; SIZE_x(input) { block }";
        let out = resolve("k", source, &bindings()).expect("resolve");
        assert_eq!(out, source);
    }

    #[test]
    fn test_unbound_placeholder_names_kernel_and_placeholder() {
        let message = err_text(resolve("softsplat_out", "int x = {{missing}};", &bindings()));
        assert!(message.contains("softsplat_out"), "{message}");
        assert!(message.contains("{{missing}}"), "{message}");
    }

    #[test]
    fn test_placeholder_bound_to_tensor_is_error() {
        let message = err_text(resolve("k", "{{input}}", &bindings()));
        assert!(message.contains("bound to a tensor"), "{message}");
    }

    #[test]
    fn test_type_without_tensor_or_with_unsupported_dtype() {
        let message = err_text(resolve("k", "{{type}}", &BindingSet::new()));
        assert!(message.contains("tensor binding"), "{message}");

        let set = BindingSet::new().with_tensor("mask", tensor(DType::Bool, &[4]));
        let message = err_text(resolve("k", "{{type}}", &set));
        assert!(message.contains("unsupported dtype bool"), "{message}");

        let set = BindingSet::new().with_tensor("w", tensor(DType::BF16, &[4]));
        assert!(resolve("k", "{{type}}", &set).is_err());
    }

    #[test]
    fn test_unknown_or_scalar_tensor_reference() {
        let message = err_text(resolve("k", "SIZE_0(nope)", &bindings()));
        assert!(message.contains("unknown tensor `nope`"), "{message}");

        let message = err_text(resolve("k", "SIZE_0(n)", &bindings()));
        assert!(message.contains("`n` is bound to a int"), "{message}");
    }

    #[test]
    fn test_rank_and_arity_errors() {
        let message = err_text(resolve("k", "SIZE_4(input)", &bindings()));
        assert!(message.contains("dimension 4 out of range"), "{message}");

        let message = err_text(resolve("k", "OFFSET_2(input, a)", &bindings()));
        assert!(message.contains("expects 3 arguments, got 2"), "{message}");

        let message = err_text(resolve("k", "VALUE_5(input, a, b, c, d, e)", &bindings()));
        assert!(message.contains("rank 4"), "{message}");

        let message = err_text(resolve("k", "SIZE_0(input, a)", &bindings()));
        assert!(message.contains("expects 1 argument"), "{message}");
    }

    #[test]
    fn test_empty_argument_is_error() {
        let message = err_text(resolve("k", "OFFSET_1(input, )", &bindings()));
        assert!(message.contains("argument 2 is empty"), "{message}");
    }

    #[test]
    fn test_unbalanced_macro_calls() {
        let message = err_text(resolve("k", "int a = SIZE_0(input;", &bindings()));
        assert!(message.contains("malformed SIZE_0 call at line 1"), "{message}");

        let message = err_text(resolve("k", "\nVALUE_1(input, {a)", &bindings()));
        assert!(message.contains("line 2"), "{message}");
        assert!(message.contains("unbalanced"), "{message}");
    }

    #[test]
    fn test_top_level_braces_are_plain_text() {
        let source = "extern \"C\" __global__ void k() { if (x) { y(); } }";
        assert_eq!(resolve("k", source, &bindings()).expect("resolve"), source);
    }

    #[test]
    fn test_placeholders_and_unresolved_items() {
        let template =
            KernelTemplate::parse("k", "{{a}} VALUE_1(input, {{b}}) SIZE_0(x)").expect("parse");
        let names: Vec<String> = template.placeholders().into_iter().collect();
        assert_eq!(names, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(
            template.unresolved(),
            vec!["{{a}}".to_string(), "VALUE_1".to_string(), "SIZE_0".to_string()]
        );

        let resolved = KernelTemplate::parse("k", "float x = input[0];").expect("parse");
        assert!(resolved.unresolved().is_empty());
    }
}

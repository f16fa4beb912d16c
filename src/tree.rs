//! Syntax-tree helpers shared by the type oracle adapter and the detectors.

use ruff_python_ast::visitor::{walk_expr, walk_stmt, Visitor};
use ruff_python_ast::{self as ast, Expr, ModModule, Stmt};
use ruff_text_size::{Ranged, TextRange, TextSize};

/// Identity of an expression node within one analysis unit.
///
/// Two distinct call nodes never share a source range, so the range is a
/// stable key for as long as the unit's source text is unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExprId(TextRange);

impl ExprId {
    pub fn of(expr: &Expr) -> Self {
        Self(expr.range())
    }
}

/// Where the `reveal_type` directive for a target goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    /// Appended at this offset, the end of the enclosing simple statement.
    AfterStatement(TextSize),
    /// Wrapped around the receiver name where it stands.
    Inline,
}

/// A call expression to classify, with its directive placement.
#[derive(Debug, Clone, Copy)]
pub struct Target<'a> {
    pub expr: &'a Expr,
    pub placement: Placement,
}

enum Scope<'a> {
    Statement { end: TextSize, rebound: Vec<&'a str> },
    Inline,
}

#[derive(Default)]
struct TargetCollector<'a> {
    scopes: Vec<Scope<'a>>,
    targets: Vec<Target<'a>>,
}

impl<'a> TargetCollector<'a> {
    fn placement_for(&self, expr: &'a Expr) -> Placement {
        let Some(receiver) = call_receiver(expr) else {
            return Placement::Inline;
        };
        match self.scopes.last() {
            Some(Scope::Statement { end, rebound })
                if !rebound.contains(&receiver.id.as_str()) =>
            {
                Placement::AfterStatement(*end)
            }
            _ => Placement::Inline,
        }
    }
}

impl<'a> Visitor<'a> for TargetCollector<'a> {
    fn visit_stmt(&mut self, stmt: &'a Stmt) {
        self.scopes.push(statement_scope(stmt));
        walk_stmt(self, stmt);
        self.scopes.pop();
    }

    fn visit_annotation(&mut self, _expr: &'a Expr) {}

    fn visit_expr(&mut self, expr: &'a Expr) {
        match expr {
            Expr::Call(_) => {
                let placement = self.placement_for(expr);
                self.targets.push(Target { expr, placement });
                walk_expr(self, expr);
            }
            // Names bound inside these scopes are not visible after the statement.
            Expr::Lambda(_)
            | Expr::ListComp(_)
            | Expr::SetComp(_)
            | Expr::DictComp(_)
            | Expr::Generator(_) => {
                self.scopes.push(Scope::Inline);
                walk_expr(self, expr);
                self.scopes.pop();
            }
            _ => walk_expr(self, expr),
        }
    }
}

/// Simple statements after which control flow continues accept an appended
/// directive, unless the directive would observe a name the statement rebinds.
fn statement_scope(stmt: &Stmt) -> Scope<'_> {
    let mut rebound = match stmt {
        Stmt::Expr(_) | Stmt::Assert(_) => Vec::new(),
        Stmt::Delete(delete) => delete.targets.iter().flat_map(bound_names).collect(),
        Stmt::Assign(assign) => assign.targets.iter().flat_map(bound_names).collect(),
        Stmt::AnnAssign(ann_assign) => bound_names(&ann_assign.target),
        Stmt::AugAssign(aug_assign) => bound_names(&aug_assign.target),
        _ => return Scope::Inline,
    };
    let mut walrus = NamedTargets::default();
    walrus.visit_stmt(stmt);
    rebound.extend(walrus.names);
    Scope::Statement {
        end: stmt.end(),
        rebound,
    }
}

/// Names bound by `:=` anywhere inside a statement.
#[derive(Default)]
struct NamedTargets<'a> {
    names: Vec<&'a str>,
}

impl<'a> Visitor<'a> for NamedTargets<'a> {
    fn visit_expr(&mut self, expr: &'a Expr) {
        if let Expr::Named(named) = expr {
            self.names.extend(bound_names(&named.target));
        }
        walk_expr(self, expr);
    }
}

/// Collect every call expression in the module, in source order.
pub fn collect_call_targets(module: &ModModule) -> Vec<Target<'_>> {
    let mut collector = TargetCollector::default();
    collector.visit_body(&module.body);
    let mut targets = collector.targets;
    targets.sort_by_key(|t| (t.expr.start(), t.expr.end()));
    targets
}

/// The receiver of `name.method(...)`, or None when the call is not made on
/// a plain name (`f()`, `a.b.c()`, `f().g()`).
pub fn call_receiver(expr: &Expr) -> Option<&ast::ExprName> {
    let Expr::Call(call) = expr else {
        return None;
    };
    let Expr::Attribute(attr) = &*call.func else {
        return None;
    };
    let Expr::Name(name) = &*attr.value else {
        return None;
    };
    Some(name)
}

/// The method name of `receiver.method(...)`.
pub fn call_method(call: &ast::ExprCall) -> Option<&str> {
    match &*call.func {
        Expr::Attribute(attr) => Some(attr.attr.as_str()),
        _ => None,
    }
}

/// True when the call carries the literal keyword `inplace=True`.
pub fn is_inplace(call: &ast::ExprCall) -> bool {
    call.arguments.keywords.iter().any(|keyword| {
        keyword.arg.as_ref().map(|s| s.as_str()) == Some("inplace")
            && matches!(
                keyword.value,
                Expr::BooleanLiteral(ast::ExprBooleanLiteral { value: true, .. })
            )
    })
}

/// Names bound by a binding target: `x`, `x, y`, `[x, (y, *z)]`.
pub fn bound_names(target: &Expr) -> Vec<&str> {
    match target {
        Expr::Name(name) => vec![name.id.as_str()],
        Expr::Tuple(tuple) => tuple.elts.iter().flat_map(bound_names).collect(),
        Expr::List(list) => list.elts.iter().flat_map(bound_names).collect(),
        Expr::Starred(starred) => bound_names(&starred.value),
        _ => Vec::new(),
    }
}

/// Root names written by the assignments directly in `body`.
///
/// Attribute and subscript targets count as writes to the name they hang
/// off: `row.x = 1` and `row["x"] = 1` both write `row`. Returns the
/// offending target when one has no named root.
pub fn assigned_names(body: &[Stmt]) -> Result<Vec<&str>, &Expr> {
    let mut names = Vec::new();
    for stmt in body {
        match stmt {
            Stmt::Assign(assign) => {
                for target in &assign.targets {
                    target_roots(target, &mut names)?;
                }
            }
            Stmt::AnnAssign(ann_assign) => target_roots(&ann_assign.target, &mut names)?,
            Stmt::AugAssign(aug_assign) => target_roots(&aug_assign.target, &mut names)?,
            _ => {}
        }
    }
    Ok(names)
}

fn target_roots<'a>(target: &'a Expr, names: &mut Vec<&'a str>) -> Result<(), &'a Expr> {
    match target {
        Expr::Name(name) => {
            names.push(name.id.as_str());
            Ok(())
        }
        Expr::Attribute(attr) => target_roots(&attr.value, names),
        Expr::Subscript(subscript) => target_roots(&subscript.value, names),
        Expr::Starred(starred) => target_roots(&starred.value, names),
        Expr::Tuple(tuple) => tuple.elts.iter().try_for_each(|e| target_roots(e, names)),
        Expr::List(list) => list.elts.iter().try_for_each(|e| target_roots(e, names)),
        _ => Err(target),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ruff_python_parser::parse_module;

    fn first_stmt(source: &str) -> Stmt {
        let parsed = parse_module(source).unwrap();
        parsed.into_syntax().body.into_iter().next().unwrap()
    }

    #[test]
    fn test_should_extract_receiver_of_simple_call() {
        // arrange
        let stmt = first_stmt("df.merge(other)");
        let Stmt::Expr(expr_stmt) = &stmt else {
            panic!("Expected Expr statement");
        };

        // act
        let receiver = call_receiver(&expr_stmt.value);

        // assert
        assert_eq!(receiver.map(|n| n.id.as_str()), Some("df"));
    }

    #[test]
    fn test_should_not_extract_receiver_of_chained_or_bare_call() {
        for source in ["df.abs().sum()", "load()", "a.b.c()"] {
            let stmt = first_stmt(source);
            let Stmt::Expr(expr_stmt) = &stmt else {
                panic!("Expected Expr statement");
            };
            assert!(call_receiver(&expr_stmt.value).is_none(), "{source}");
        }
    }

    #[test]
    fn test_should_detect_inplace_keyword() {
        let cases = [
            ("df.dropna(inplace=True)", true),
            ("df.dropna(inplace=False)", false),
            ("df.dropna(inplace=flag)", false),
            ("df.dropna()", false),
        ];
        for (source, expected) in cases {
            let stmt = first_stmt(source);
            let Stmt::Expr(expr_stmt) = &stmt else {
                panic!("Expected Expr statement");
            };
            let Expr::Call(call) = &*expr_stmt.value else {
                panic!("Expected Call");
            };
            assert_eq!(is_inplace(call), expected, "{source}");
        }
    }

    #[test]
    fn test_should_collect_loop_bound_names() {
        // arrange
        let stmt = first_stmt("for i, (row, *rest) in df.iterrows():\n    pass\n");
        let Stmt::For(for_stmt) = &stmt else {
            panic!("Expected For");
        };

        // act
        let names = bound_names(&for_stmt.target);

        // assert
        assert_eq!(names, vec!["i", "row", "rest"]);
    }

    #[test]
    fn test_should_unwrap_assigned_targets_to_root_names() {
        // arrange
        let source = r#"
for row in rows:
    row["x"] = 1
    other.attr = 2
    total: int = 0
    count += 1
    a, b.c = 1, 2
"#;
        let parsed = parse_module(source).unwrap();
        let module = parsed.into_syntax();
        let Stmt::For(for_stmt) = &module.body[0] else {
            panic!("Expected For");
        };

        // act
        let names = assigned_names(&for_stmt.body).unwrap();

        // assert
        assert_eq!(names, vec!["row", "other", "total", "count", "a", "b"]);
    }

    #[test]
    fn test_should_fail_on_target_without_named_root() {
        // arrange
        let parsed = parse_module("for row in rows:\n    make().x = 1\n").unwrap();
        let module = parsed.into_syntax();
        let Stmt::For(for_stmt) = &module.body[0] else {
            panic!("Expected For");
        };

        // act
        let result = assigned_names(&for_stmt.body);

        // assert
        assert!(matches!(result, Err(Expr::Call(_))));
    }

    #[test]
    fn test_should_place_directives_by_statement_kind() {
        // arrange
        let source = r#"x = df.abs()
for row in df.iterrows():
    print(row)
df = df.dropna()
result = [r.sum() for r in frames]
"#;
        let parsed = parse_module(source).unwrap();
        let module = parsed.syntax();

        // act
        let targets = collect_call_targets(module);
        let placements: Vec<(Option<&str>, Placement)> = targets
            .iter()
            .map(|t| (call_receiver(t.expr).map(|n| n.id.as_str()), t.placement))
            .collect();

        // assert
        assert_eq!(placements.len(), 5);
        assert_eq!(
            placements[0],
            (Some("df"), Placement::AfterStatement(module.body[0].end()))
        );
        assert_eq!(placements[1], (Some("df"), Placement::Inline));
        // print(row) has no receiver
        assert_eq!(placements[2], (None, Placement::Inline));
        // df is rebound by its own statement
        assert_eq!(placements[3], (Some("df"), Placement::Inline));
        // r only exists inside the comprehension
        assert_eq!(placements[4], (Some("r"), Placement::Inline));
    }

    #[test]
    fn test_should_collect_targets_in_source_order() {
        // arrange
        let source = "a = b.c(d.e())\n";
        let parsed = parse_module(source).unwrap();

        // act
        let targets = collect_call_targets(parsed.syntax());
        let receivers: Vec<&str> = targets
            .iter()
            .filter_map(|t| call_receiver(t.expr))
            .map(|n| n.id.as_str())
            .collect();

        // assert
        assert_eq!(receivers, vec!["b", "d"]);
    }

    #[test]
    fn test_should_inline_directive_when_walrus_rebinds_receiver() {
        // arrange
        let source = "(df := df.abs())\n(total := df.sum())\n";
        let parsed = parse_module(source).unwrap();
        let module = parsed.syntax();

        // act
        let targets = collect_call_targets(module);

        // assert
        assert_eq!(targets.len(), 2);
        assert_eq!(targets[0].placement, Placement::Inline);
        assert_eq!(
            targets[1].placement,
            Placement::AfterStatement(module.body[1].end())
        );
    }
}

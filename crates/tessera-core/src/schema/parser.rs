use pest::Parser;
use pest::error::{ErrorVariant, LineColLocation};
use pest::iterators::Pair;
use pest_derive::Parser;

use crate::attribute::AttributeType;
use crate::error::ErrorCode;

use super::compiler::{CompileError, Position};
use super::types::PermissionKind;

#[derive(Parser)]
#[grammar = "schema/grammar.pest"]
struct SchemaParser;

/// Identifier together with where it appeared in the source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Ident {
    pub text: String,
    pub position: Position,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SchemaAst {
    pub entities: Vec<EntityAst>,
    pub rules: Vec<RuleAst>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct EntityAst {
    pub name: Ident,
    pub members: Vec<MemberAst>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum MemberAst {
    Relation {
        name: Ident,
        subjects: Vec<(Ident, Option<Ident>)>,
    },
    Attribute {
        name: Ident,
        attribute_type: AttributeType,
    },
    Permission {
        kind: PermissionKind,
        name: Ident,
        expr: ExprAst,
    },
}

impl MemberAst {
    pub fn name(&self) -> &Ident {
        match self {
            Self::Relation { name, .. }
            | Self::Attribute { name, .. }
            | Self::Permission { name, .. } => name,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BinaryOp {
    Or,
    And,
    Not,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ExprAst {
    Identifier(Ident),
    Walk(Ident, Ident),
    Call(Ident, Vec<Ident>),
    Negated(Box<ExprAst>),
    Binary(BinaryOp, Box<ExprAst>, Box<ExprAst>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RuleAst {
    pub name: Ident,
    pub parameters: Vec<(Ident, AttributeType)>,
    pub body: String,
    pub body_position: Position,
}

fn position(pair: &Pair<'_, Rule>) -> Position {
    let (line, column) = pair.as_span().start_pos().line_col();
    Position { line, column }
}

fn ident(pair: Pair<'_, Rule>) -> Ident {
    Ident {
        position: position(&pair),
        text: pair.as_str().to_string(),
    }
}

fn missing(context: &str, at: Position) -> CompileError {
    CompileError::new(ErrorCode::SchemaCompile, at, format!("missing {context}"))
}

fn syntax_error(err: pest::error::Error<Rule>) -> CompileError {
    let (line, column) = match err.line_col {
        LineColLocation::Pos(pos) | LineColLocation::Span(pos, _) => pos,
    };
    let detail = match &err.variant {
        ErrorVariant::ParsingError { positives, .. } if !positives.is_empty() => {
            let expected = positives
                .iter()
                .map(|r| format!("{r:?}"))
                .collect::<Vec<_>>()
                .join(", ");
            format!("unexpected token, expected {expected}")
        }
        variant => variant.message().into_owned(),
    };
    CompileError::new(ErrorCode::SchemaCompile, Position { line, column }, detail)
}

pub(crate) fn parse(input: &str) -> Result<SchemaAst, CompileError> {
    let pairs = SchemaParser::parse(Rule::schema, input).map_err(syntax_error)?;

    let mut entities = Vec::new();
    let mut rules = Vec::new();

    for pair in pairs {
        if pair.as_rule() != Rule::schema {
            continue;
        }
        for inner in pair.into_inner() {
            match inner.as_rule() {
                Rule::entity_def => entities.push(parse_entity(inner)?),
                Rule::rule_def => rules.push(parse_rule(inner)?),
                _ => {}
            }
        }
    }

    Ok(SchemaAst { entities, rules })
}

fn parse_entity(pair: Pair<'_, Rule>) -> Result<EntityAst, CompileError> {
    let at = position(&pair);
    let mut inner = pair.into_inner().filter(|p| p.as_rule() != Rule::kw_entity);
    let name = ident(inner.next().ok_or_else(|| missing("entity name", at))?);
    let body = inner.next().ok_or_else(|| missing("entity body", at))?;

    let members = body
        .into_inner()
        .map(|item| match item.as_rule() {
            Rule::relation_def => parse_relation(item),
            Rule::attribute_def => parse_attribute(item),
            Rule::permission_def => parse_permission(item),
            other => Err(CompileError::new(
                ErrorCode::SchemaCompile,
                position(&item),
                format!("unexpected {other:?}"),
            )),
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(EntityAst { name, members })
}

fn parse_relation(pair: Pair<'_, Rule>) -> Result<MemberAst, CompileError> {
    let at = position(&pair);
    let mut inner = pair.into_inner().filter(|p| p.as_rule() != Rule::kw_relation);
    let name = ident(inner.next().ok_or_else(|| missing("relation name", at))?);

    let subjects = inner
        .map(|subject| {
            let mut parts = subject.into_inner();
            let type_name = ident(parts.next().ok_or_else(|| missing("subject type", at))?);
            let relation = parts.next().map(ident);
            Ok((type_name, relation))
        })
        .collect::<Result<Vec<_>, CompileError>>()?;

    Ok(MemberAst::Relation { name, subjects })
}

fn parse_attribute_type(pair: Pair<'_, Rule>) -> Result<AttributeType, CompileError> {
    let at = position(&pair);
    pair.as_str()
        .parse()
        .map_err(|e: crate::attribute::AttributeParseError| {
            CompileError::new(ErrorCode::SchemaCompile, at, e.to_string())
        })
}

fn parse_attribute(pair: Pair<'_, Rule>) -> Result<MemberAst, CompileError> {
    let at = position(&pair);
    let mut inner = pair.into_inner().filter(|p| p.as_rule() != Rule::kw_attribute);
    let name = ident(inner.next().ok_or_else(|| missing("attribute name", at))?);
    let attribute_type =
        parse_attribute_type(inner.next().ok_or_else(|| missing("attribute type", at))?)?;

    Ok(MemberAst::Attribute {
        name,
        attribute_type,
    })
}

fn parse_permission(pair: Pair<'_, Rule>) -> Result<MemberAst, CompileError> {
    let at = position(&pair);
    let mut inner = pair.into_inner();
    let kind_pair = inner.next().ok_or_else(|| missing("permission keyword", at))?;
    let kind = match kind_pair.into_inner().next().map(|p| p.as_rule()) {
        Some(Rule::kw_action) => PermissionKind::Action,
        _ => PermissionKind::Permission,
    };
    let name = ident(inner.next().ok_or_else(|| missing("permission name", at))?);
    let expr = parse_expr(inner.next().ok_or_else(|| missing("permission expression", at))?)?;

    Ok(MemberAst::Permission { kind, name, expr })
}

fn parse_expr(pair: Pair<'_, Rule>) -> Result<ExprAst, CompileError> {
    let at = position(&pair);
    let mut inner = pair.into_inner();
    let mut left = parse_term(inner.next().ok_or_else(|| missing("expression term", at))?)?;

    // Operators share one precedence level and associate to the left.
    while let Some(op) = inner.next() {
        let op = match op.as_rule() {
            Rule::or_op => BinaryOp::Or,
            Rule::and_op => BinaryOp::And,
            _ => BinaryOp::Not,
        };
        let right =
            parse_term(inner.next().ok_or_else(|| missing("term after operator", at))?)?;
        left = ExprAst::Binary(op, Box::new(left), Box::new(right));
    }

    Ok(left)
}

fn parse_term(pair: Pair<'_, Rule>) -> Result<ExprAst, CompileError> {
    let at = position(&pair);
    let inner = pair
        .into_inner()
        .next()
        .ok_or_else(|| missing("term content", at))?;
    match inner.as_rule() {
        Rule::expr => parse_expr(inner),
        Rule::negated => {
            let operand = inner
                .into_inner()
                .find(|p| p.as_rule() == Rule::term)
                .ok_or_else(|| missing("operand of not", at))?;
            Ok(ExprAst::Negated(Box::new(parse_term(operand)?)))
        }
        Rule::call => {
            let mut parts = inner.into_inner().map(ident);
            let name = parts.next().ok_or_else(|| missing("rule name", at))?;
            Ok(ExprAst::Call(name, parts.collect()))
        }
        Rule::walk => {
            let mut parts = inner.into_inner().map(ident);
            let relation = parts.next().ok_or_else(|| missing("walk relation", at))?;
            let target = parts.next().ok_or_else(|| missing("walk target", at))?;
            Ok(ExprAst::Walk(relation, target))
        }
        Rule::identifier => Ok(ExprAst::Identifier(ident(inner))),
        other => Err(CompileError::new(
            ErrorCode::SchemaCompile,
            at,
            format!("unexpected {other:?}"),
        )),
    }
}

fn parse_rule(pair: Pair<'_, Rule>) -> Result<RuleAst, CompileError> {
    let at = position(&pair);
    let mut name = None;
    let mut parameters = Vec::new();
    let mut body = None;

    for part in pair.into_inner() {
        match part.as_rule() {
            Rule::identifier => name = Some(ident(part)),
            Rule::rule_params => {
                for param in part.into_inner() {
                    let param_at = position(&param);
                    let mut p = param.into_inner();
                    let param_name =
                        ident(p.next().ok_or_else(|| missing("parameter name", param_at))?);
                    let param_type = parse_attribute_type(
                        p.next().ok_or_else(|| missing("parameter type", param_at))?,
                    )?;
                    parameters.push((param_name, param_type));
                }
            }
            Rule::rule_body => {
                body = Some((part.as_str().trim().to_string(), position(&part)));
            }
            _ => {}
        }
    }

    let name = name.ok_or_else(|| missing("rule name", at))?;
    let (body, body_position) = body.ok_or_else(|| missing("rule body", at))?;

    Ok(RuleAst {
        name,
        parameters,
        body,
        body_position,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(ast: &SchemaAst) -> Vec<&str> {
        ast.entities.iter().map(|e| e.name.text.as_str()).collect()
    }

    #[test]
    fn parses_empty_entities() {
        let ast = parse("entity user {} entity organization {}").unwrap();

        assert_eq!(names(&ast), vec!["user", "organization"]);
        assert!(ast.entities[0].members.is_empty());
    }

    #[test]
    fn parses_relation_with_userset_subject() {
        let ast = parse("entity group {\n  relation member @user @group#member\n}").unwrap();

        match &ast.entities[0].members[0] {
            MemberAst::Relation { name, subjects } => {
                assert_eq!(name.text, "member");
                assert_eq!(name.position, Position { line: 2, column: 12 });
                assert_eq!(subjects.len(), 2);
                assert_eq!(subjects[0].0.text, "user");
                assert!(subjects[0].1.is_none());
                assert_eq!(subjects[1].1.as_ref().unwrap().text, "member");
            }
            other => panic!("expected relation, got {other:?}"),
        }
    }

    #[test]
    fn parses_attribute_types() {
        let ast = parse("entity doc { attribute tags string[] attribute public boolean }").unwrap();

        assert!(matches!(
            &ast.entities[0].members[0],
            MemberAst::Attribute { attribute_type: AttributeType::StringArray, .. }
        ));
        assert!(matches!(
            &ast.entities[0].members[1],
            MemberAst::Attribute { attribute_type: AttributeType::Boolean, .. }
        ));
    }

    #[test]
    fn action_keyword_is_recorded() {
        let ast = parse("entity doc { relation owner @user action edit = owner }").unwrap();

        assert!(matches!(
            &ast.entities[0].members[1],
            MemberAst::Permission { kind: PermissionKind::Action, .. }
        ));
    }

    #[test]
    fn operators_associate_left() {
        let ast = parse("entity doc { permission p = a or b and c }").unwrap();

        let MemberAst::Permission { expr, .. } = &ast.entities[0].members[0] else {
            panic!("expected permission");
        };
        match expr {
            ExprAst::Binary(BinaryOp::And, left, _) => {
                assert!(matches!(left.as_ref(), ExprAst::Binary(BinaryOp::Or, _, _)))
            }
            other => panic!("expected and at root, got {other:?}"),
        }
    }

    #[test]
    fn parses_walk_call_and_negation() {
        let ast =
            parse("entity doc { permission p = parent.view and check(balance, tier) not not banned }")
                .unwrap();

        let MemberAst::Permission { expr, .. } = &ast.entities[0].members[0] else {
            panic!("expected permission");
        };
        let ExprAst::Binary(BinaryOp::Not, left, right) = expr else {
            panic!("expected exclusion at root, got {expr:?}");
        };
        assert!(matches!(right.as_ref(), ExprAst::Negated(_)));
        let ExprAst::Binary(BinaryOp::And, walk, call) = left.as_ref() else {
            panic!("expected and");
        };
        assert!(matches!(walk.as_ref(), ExprAst::Walk(r, t) if r.text == "parent" && t.text == "view"));
        assert!(matches!(call.as_ref(), ExprAst::Call(n, args) if n.text == "check" && args.len() == 2));
    }

    #[test]
    fn parses_rule_with_nested_braces_in_body() {
        let src = "rule check_balance(balance integer, tags string[]) {\n  balance > 5000 && 'a' in tags\n}";
        let ast = parse(src).unwrap();

        let rule = &ast.rules[0];
        assert_eq!(rule.name.text, "check_balance");
        assert_eq!(rule.parameters.len(), 2);
        assert_eq!(rule.parameters[1].1, AttributeType::StringArray);
        assert_eq!(rule.body, "balance > 5000 && 'a' in tags");
    }

    #[test]
    fn comments_are_ignored() {
        let ast = parse("// users\nentity user {} /* block\ncomment */ entity doc {}").unwrap();

        assert_eq!(names(&ast), vec!["user", "doc"]);
    }

    #[test]
    fn keywords_cannot_be_identifiers() {
        let err = parse("entity relation {}").unwrap_err();

        assert_eq!(err.code, ErrorCode::SchemaCompile);
        assert_eq!(err.position, Some(Position { line: 1, column: 8 }));
    }

    #[test]
    fn identifiers_may_start_with_keywords() {
        let ast = parse("entity order { relation notes @user }").unwrap();

        assert_eq!(names(&ast), vec!["order"]);
    }

    #[test]
    fn syntax_error_carries_line_and_column() {
        let err = parse("entity user {}\nentity doc {\n  relation owner user\n}").unwrap_err();

        assert_eq!(err.code, ErrorCode::SchemaCompile);
        assert_eq!(err.position.map(|p| p.line), Some(3));
    }
}

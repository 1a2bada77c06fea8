use std::collections::{HashMap, HashSet};
use std::fmt;

use serde::Serialize;

use crate::attribute::AttributeType;
use crate::error::ErrorCode;
use crate::rule::parse_expression;

use super::parser::{self, BinaryOp, EntityAst, ExprAst, Ident, MemberAst, RuleAst, SchemaAst};
use super::types::{
    AttributeDef, EntityDefinition, MemberKind, PermissionDef, RelationDef, RewriteRule,
    RuleDefinition, RuleParameter, Schema, SubjectTypeRef,
};

/// 1-based source location.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct Position {
    pub line: usize,
    pub column: usize,
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.line, self.column)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CompileError {
    pub code: ErrorCode,
    pub position: Option<Position>,
    pub detail: String,
}

impl CompileError {
    pub(crate) fn new(code: ErrorCode, position: Position, detail: impl Into<String>) -> Self {
        Self {
            code,
            position: Some(position),
            detail: detail.into(),
        }
    }

    pub(crate) fn unpositioned(code: ErrorCode, detail: impl Into<String>) -> Self {
        Self {
            code,
            position: None,
            detail: detail.into(),
        }
    }

    fn at(code: ErrorCode, ident: &Ident, detail: impl Into<String>) -> Self {
        Self::new(code, ident.position, detail)
    }
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(pos) = self.position {
            write!(f, "{pos}: ")?;
        }
        write!(f, "{}: {}", self.code, self.detail)
    }
}

impl std::error::Error for CompileError {}

/// Parses and validates schema source into a compiled [`Schema`].
pub fn compile_schema(input: &str) -> Result<Schema, CompileError> {
    let ast = parser::parse(input)?;
    Compiler::new(&ast)?.compile()
}

struct Compiler<'a> {
    ast: &'a SchemaAst,
    entities: HashMap<&'a str, &'a EntityAst>,
    rules: HashMap<&'a str, &'a RuleAst>,
}

fn member_kind(member: &MemberAst) -> MemberKind {
    match member {
        MemberAst::Relation { .. } => MemberKind::Relation,
        MemberAst::Attribute { .. } => MemberKind::Attribute,
        MemberAst::Permission { .. } => MemberKind::Permission,
    }
}

impl<'a> Compiler<'a> {
    fn new(ast: &'a SchemaAst) -> Result<Self, CompileError> {
        if ast.entities.is_empty() {
            return Err(CompileError::unpositioned(
                ErrorCode::NoEntityReferencesFoundInSchema,
                "schema declares no entities",
            ));
        }

        let mut entities = HashMap::new();
        for entity in &ast.entities {
            if entities.insert(entity.name.text.as_str(), entity).is_some() {
                return Err(CompileError::at(
                    ErrorCode::DuplicatedEntityReference,
                    &entity.name,
                    format!("entity '{}' is declared more than once", entity.name.text),
                ));
            }
            let mut seen = HashSet::new();
            for member in &entity.members {
                let name = member.name();
                if !seen.insert(name.text.as_str()) {
                    return Err(CompileError::at(
                        ErrorCode::DuplicatedRelationReference,
                        name,
                        format!("'{}' is declared more than once in entity '{}'", name.text, entity.name.text),
                    ));
                }
            }
        }

        let mut rules = HashMap::new();
        for rule in &ast.rules {
            if rules.insert(rule.name.text.as_str(), rule).is_some() {
                return Err(CompileError::at(
                    ErrorCode::DuplicatedRuleReference,
                    &rule.name,
                    format!("rule '{}' is declared more than once", rule.name.text),
                ));
            }
        }

        Ok(Self {
            ast,
            entities,
            rules,
        })
    }

    fn member(&self, entity: &str, name: &str) -> Option<&'a MemberAst> {
        self.entities
            .get(entity)
            .and_then(|e| e.members.iter().find(|m| m.name().text == name))
    }

    fn compile(&self) -> Result<Schema, CompileError> {
        let rules = self
            .ast
            .rules
            .iter()
            .map(compile_rule)
            .collect::<Result<Vec<_>, _>>()?;

        let entities = self
            .ast
            .entities
            .iter()
            .map(|entity| self.compile_entity(entity))
            .collect::<Result<Vec<_>, _>>()?;

        let schema = Schema { entities, rules };
        self.check_cycles(&schema)?;
        Ok(schema)
    }

    fn compile_entity(&self, entity: &EntityAst) -> Result<EntityDefinition, CompileError> {
        let mut relations = Vec::new();
        let mut attributes = Vec::new();
        let mut permissions = Vec::new();

        for member in &entity.members {
            match member {
                MemberAst::Relation { name, subjects } => {
                    relations.push(self.compile_relation(name, subjects)?);
                }
                MemberAst::Attribute {
                    name,
                    attribute_type,
                } => attributes.push(AttributeDef {
                    name: name.text.clone(),
                    attribute_type: *attribute_type,
                }),
                MemberAst::Permission { kind, name, expr } => permissions.push(PermissionDef {
                    name: name.text.clone(),
                    kind: *kind,
                    rule: self.compile_expr(entity, expr)?,
                }),
            }
        }

        Ok(EntityDefinition {
            name: entity.name.text.clone(),
            relations,
            attributes,
            permissions,
        })
    }

    fn compile_relation(
        &self,
        name: &Ident,
        subjects: &[(Ident, Option<Ident>)],
    ) -> Result<RelationDef, CompileError> {
        let mut subject_types = Vec::new();
        for (type_name, relation) in subjects {
            if !self.entities.contains_key(type_name.text.as_str()) {
                return Err(CompileError::at(
                    ErrorCode::EntityDefinitionNotFound,
                    type_name,
                    format!("entity '{}' is not defined", type_name.text),
                ));
            }
            if let Some(rel) = relation {
                let target = self.member(&type_name.text, &rel.text);
                if !matches!(target, Some(MemberAst::Relation { .. } | MemberAst::Permission { .. })) {
                    return Err(CompileError::at(
                        ErrorCode::RelationReferenceNotFoundInEntityReferences,
                        rel,
                        format!("'{}#{}' is not a relation or permission", type_name.text, rel.text),
                    ));
                }
            }
            subject_types.push(SubjectTypeRef {
                type_name: type_name.text.clone(),
                relation: relation.as_ref().map(|r| r.text.clone()),
            });
        }
        Ok(RelationDef {
            name: name.text.clone(),
            subject_types,
        })
    }

    fn compile_expr(&self, entity: &EntityAst, expr: &ExprAst) -> Result<RewriteRule, CompileError> {
        match expr {
            ExprAst::Identifier(ident) => self.compile_leaf(entity, ident),
            ExprAst::Walk(relation, target) => self.compile_walk(entity, relation, target),
            ExprAst::Call(rule, arguments) => self.compile_call(entity, rule, arguments),
            ExprAst::Negated(inner) => Ok(RewriteRule::Negation(Box::new(
                self.compile_expr(entity, inner)?,
            ))),
            ExprAst::Binary(op, left, right) => {
                let left = self.compile_expr(entity, left)?;
                let right = self.compile_expr(entity, right)?;
                Ok(match (*op, left) {
                    (BinaryOp::Or, RewriteRule::Union(mut children)) => {
                        children.push(right);
                        RewriteRule::Union(children)
                    }
                    (BinaryOp::Or, left) => RewriteRule::Union(vec![left, right]),
                    (BinaryOp::And, RewriteRule::Intersection(mut children)) => {
                        children.push(right);
                        RewriteRule::Intersection(children)
                    }
                    (BinaryOp::And, left) => RewriteRule::Intersection(vec![left, right]),
                    (BinaryOp::Not, left) => RewriteRule::Exclusion(Box::new(left), Box::new(right)),
                })
            }
        }
    }

    fn compile_leaf(&self, entity: &EntityAst, ident: &Ident) -> Result<RewriteRule, CompileError> {
        match self.member(&entity.name.text, &ident.text) {
            Some(MemberAst::Relation { .. }) => Ok(RewriteRule::Relation(ident.text.clone())),
            Some(MemberAst::Permission { .. }) => Ok(RewriteRule::Permission(ident.text.clone())),
            Some(MemberAst::Attribute { attribute_type, .. }) => {
                if *attribute_type != AttributeType::Boolean {
                    return Err(CompileError::at(
                        ErrorCode::InvalidRuleReference,
                        ident,
                        format!(
                            "attribute '{}' is {attribute_type}, only boolean attributes can be used directly",
                            ident.text
                        ),
                    ));
                }
                Ok(RewriteRule::Attribute(ident.text.clone()))
            }
            None => Err(CompileError::at(
                ErrorCode::UndefinedRelationReference,
                ident,
                format!("'{}' is not defined on entity '{}'", ident.text, entity.name.text),
            )),
        }
    }

    fn compile_walk(
        &self,
        entity: &EntityAst,
        relation: &Ident,
        target: &Ident,
    ) -> Result<RewriteRule, CompileError> {
        let subjects = match self.member(&entity.name.text, &relation.text) {
            Some(MemberAst::Relation { subjects, .. }) => subjects,
            Some(other) => {
                return Err(CompileError::at(
                    ErrorCode::NotSupportedRelationWalk,
                    relation,
                    format!("'{}' is a {:?}, only relations can be walked", relation.text, member_kind(other)),
                ));
            }
            None => {
                return Err(CompileError::at(
                    ErrorCode::UndefinedRelationReference,
                    relation,
                    format!("'{}' is not defined on entity '{}'", relation.text, entity.name.text),
                ));
            }
        };

        let reachable = subjects.iter().any(|(type_name, _)| {
            matches!(
                self.member(&type_name.text, &target.text),
                Some(MemberAst::Relation { .. } | MemberAst::Permission { .. })
            )
        });
        if !reachable {
            return Err(CompileError::at(
                ErrorCode::UndefinedRelationReference,
                target,
                format!("'{}' is not defined on any type referenced by '{}'", target.text, relation.text),
            ));
        }

        Ok(RewriteRule::Arrow {
            tupleset: relation.text.clone(),
            computed: target.text.clone(),
        })
    }

    fn compile_call(
        &self,
        entity: &EntityAst,
        rule: &Ident,
        arguments: &[Ident],
    ) -> Result<RewriteRule, CompileError> {
        let definition = self.rules.get(rule.text.as_str()).ok_or_else(|| {
            CompileError::at(
                ErrorCode::UndefinedRuleReference,
                rule,
                format!("rule '{}' is not defined", rule.text),
            )
        })?;

        if definition.parameters.len() != arguments.len() {
            return Err(CompileError::at(
                ErrorCode::InvalidRuleReference,
                rule,
                format!(
                    "rule '{}' takes {} arguments, {} given",
                    rule.text,
                    definition.parameters.len(),
                    arguments.len()
                ),
            ));
        }

        for ((_, expected), argument) in definition.parameters.iter().zip(arguments) {
            match self.member(&entity.name.text, &argument.text) {
                Some(MemberAst::Attribute { attribute_type, .. }) if attribute_type == expected => {}
                Some(MemberAst::Attribute { attribute_type, .. }) => {
                    return Err(CompileError::at(
                        ErrorCode::InvalidRuleReference,
                        argument,
                        format!(
                            "attribute '{}' is {attribute_type}, rule '{}' expects {expected}",
                            argument.text, rule.text
                        ),
                    ));
                }
                _ => {
                    return Err(CompileError::at(
                        ErrorCode::InvalidRuleReference,
                        argument,
                        format!("'{}' is not an attribute of entity '{}'", argument.text, entity.name.text),
                    ));
                }
            }
        }

        Ok(RewriteRule::Call {
            rule: rule.text.clone(),
            arguments: arguments.iter().map(|a| a.text.clone()).collect(),
        })
    }

    /// Rejects permissions that reach themselves without crossing a relation.
    fn check_cycles(&self, schema: &Schema) -> Result<(), CompileError> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Visiting,
            Done,
        }

        fn permission_refs(rule: &RewriteRule, out: &mut Vec<String>) {
            match rule {
                RewriteRule::Permission(name) => out.push(name.clone()),
                other => other.children().into_iter().for_each(|c| permission_refs(c, out)),
            }
        }

        fn visit<'s>(
            entity: &'s EntityDefinition,
            name: &'s str,
            marks: &mut HashMap<&'s str, Mark>,
            path: &mut Vec<&'s str>,
        ) -> Option<Vec<String>> {
            match marks.get(name) {
                Some(Mark::Done) => return None,
                Some(Mark::Visiting) => {
                    let start = path.iter().position(|p| *p == name).unwrap_or(0);
                    let mut cycle: Vec<String> = path[start..].iter().map(|s| s.to_string()).collect();
                    cycle.push(name.to_string());
                    return Some(cycle);
                }
                None => {}
            }
            marks.insert(name, Mark::Visiting);
            path.push(name);
            if let Some(permission) = entity.get_permission(name) {
                let mut refs = Vec::new();
                permission_refs(&permission.rule, &mut refs);
                for next in refs {
                    if let Some(target) = entity.get_permission(&next)
                        && let Some(cycle) = visit(entity, &target.name, marks, path)
                    {
                        return Some(cycle);
                    }
                }
            }
            path.pop();
            marks.insert(name, Mark::Done);
            None
        }

        for entity in &schema.entities {
            let mut marks = HashMap::new();
            for permission in &entity.permissions {
                let mut path = Vec::new();
                if let Some(cycle) = visit(entity, &permission.name, &mut marks, &mut path) {
                    let culprit = cycle.first().cloned().unwrap_or_default();
                    let ident = self
                        .member(&entity.name, &culprit)
                        .map(|m| m.name().clone());
                    let detail = format!(
                        "permission cycle in entity '{}': {}",
                        entity.name,
                        cycle.join(" -> ")
                    );
                    return Err(match ident {
                        Some(ident) => {
                            CompileError::at(ErrorCode::CircularPermissionReference, &ident, detail)
                        }
                        None => CompileError::unpositioned(
                            ErrorCode::CircularPermissionReference,
                            detail,
                        ),
                    });
                }
            }
        }
        Ok(())
    }
}

fn compile_rule(rule: &RuleAst) -> Result<RuleDefinition, CompileError> {
    let expression = parse_expression(&rule.body).map_err(|e| {
        CompileError::new(
            ErrorCode::InvalidRuleExpression,
            rule.body_position,
            format!("rule '{}': {e}", rule.name.text),
        )
    })?;

    let parameters: Vec<RuleParameter> = rule
        .parameters
        .iter()
        .map(|(name, parameter_type)| RuleParameter {
            name: name.text.clone(),
            parameter_type: *parameter_type,
        })
        .collect();

    for variable in expression.free_variables() {
        if !parameters.iter().any(|p| p.name == variable) {
            return Err(CompileError::new(
                ErrorCode::InvalidRuleExpression,
                rule.body_position,
                format!("rule '{}' references undeclared variable '{variable}'", rule.name.text),
            ));
        }
    }

    Ok(RuleDefinition {
        name: rule.name.text.clone(),
        parameters,
        body: rule.body.clone(),
        expression,
    })
}

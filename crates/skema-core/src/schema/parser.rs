use pest::Parser;
use pest::iterators::Pair;
use pest_derive::Parser;

use super::types::{
    BinaryOperator, CaveatDefinition, CaveatExpression, CaveatParameter, CaveatParameterTypeRef,
    Expression, Index, ObjectDefinition, Permission, Relation, RelationRefExpression, Schema,
    TextRange, TopLevelDefinition, TypeExpr, TypeRef, UseFlag, WithCaveat,
};

#[derive(Parser)]
#[grammar = "schema/grammar.pest"]
struct SchemaParser;

// Positioned syntax error: the furthest point the grammar reached, plus the
// token descriptions that would have been accepted there.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("parse error at line {}, column {}: {message}", .index.line, .index.column)]
pub struct ParseError {
    pub message: String,
    pub index: Index,
    pub expected: Vec<String>,
}

pub fn parse(input: &str) -> Result<Schema, ParseError> {
    let mut pairs =
        SchemaParser::parse(Rule::schema, input).map_err(|e| ParseError::from_pest(&e))?;
    let schema_pair = pairs.next().ok_or_else(|| missing_token("schema", None))?;

    let mut definitions = Vec::new();
    for item in schema_pair.into_inner() {
        match item.as_rule() {
            Rule::use_flag => definitions.push(TopLevelDefinition::Use(build_use_flag(item)?)),
            Rule::caveat_def => {
                definitions.push(TopLevelDefinition::Caveat(build_caveat_def(item)?));
            }
            Rule::object_def => {
                definitions.push(TopLevelDefinition::Object(build_object_def(item)?));
            }
            Rule::EOI => {}
            other => return Err(unexpected_rule(other, &item)),
        }
    }

    tracing::debug!(definitions = definitions.len(), "parsed schema");
    Ok(Schema {
        source: input.to_string(),
        definitions,
    })
}

// Convenience wrapper dropping error detail.
pub fn parse_schema(input: &str) -> Option<Schema> {
    parse(input).ok()
}

impl ParseError {
    fn from_pest(err: &pest::error::Error<Rule>) -> Self {
        use pest::error::{ErrorVariant, InputLocation, LineColLocation};

        let (line, column) = match err.line_col {
            LineColLocation::Pos((line, column)) => (line, column),
            LineColLocation::Span((line, column), _) => (line, column),
        };
        let offset = match err.location {
            InputLocation::Pos(offset) => offset,
            InputLocation::Span((offset, _)) => offset,
        };
        let index = Index {
            offset,
            line,
            column,
        };

        match &err.variant {
            ErrorVariant::ParsingError { positives, .. } => {
                let mut expected = Vec::new();
                for rule in positives {
                    let description = rule_description(*rule);
                    if !expected.contains(&description) {
                        expected.push(description);
                    }
                }
                let message = if expected.is_empty() {
                    "unexpected input".to_string()
                } else {
                    format!("expected {}", expected.join(", "))
                };
                ParseError {
                    message,
                    index,
                    expected,
                }
            }
            ErrorVariant::CustomError { message } => ParseError {
                message: message.clone(),
                index,
                expected: Vec::new(),
            },
        }
    }
}

fn rule_description(rule: Rule) -> String {
    let text = match rule {
        Rule::ident => "identifier",
        Rule::path | Rule::path_segment => "path",
        Rule::use_flag | Rule::kw_use => "`use`",
        Rule::object_def | Rule::kw_definition => "`definition`",
        Rule::caveat_def | Rule::kw_caveat => "`caveat`",
        Rule::relation_decl | Rule::kw_relation => "`relation`",
        Rule::permission_decl | Rule::kw_permission => "`permission`",
        Rule::kw_with | Rule::with_clause => "`with`",
        Rule::kw_and => "`and`",
        Rule::kw_expiration | Rule::with_expiration => "`expiration`",
        Rule::kw_nil | Rule::nil_expr => "`nil`",
        Rule::with_caveat => "caveat name",
        Rule::type_expr | Rule::type_ref => "type reference",
        Rule::wildcard => "`:*`",
        Rule::subject_relation => "`#` relation",
        Rule::exclusion_expr | Rule::intersection_expr | Rule::union_expr => "expression",
        Rule::exclusion_op => "`-`",
        Rule::intersection_op => "`&`",
        Rule::union_op => "`+`",
        Rule::arrow_expr => "arrow expression",
        Rule::named_arrow => "named arrow expression",
        Rule::rel_ref => "relation or permission name",
        Rule::caveat_params | Rule::caveat_param => "caveat parameter",
        Rule::param_type => "parameter type",
        Rule::caveat_expr
        | Rule::cel_ternary
        | Rule::cel_or
        | Rule::cel_and
        | Rule::cel_rel
        | Rule::cel_add
        | Rule::cel_mul
        | Rule::cel_unary
        | Rule::cel_member => "caveat expression",
        Rule::EOI => "end of input",
        other => return format!("{other:?}"),
    };
    text.to_string()
}

fn range_of(pair: &Pair<'_, Rule>) -> TextRange {
    let span = pair.as_span();
    let (start_line, start_column) = span.start_pos().line_col();
    let (end_line, end_column) = span.end_pos().line_col();
    TextRange {
        start: Index {
            offset: span.start(),
            line: start_line,
            column: start_column,
        },
        end: Index {
            offset: span.end(),
            line: end_line,
            column: end_column,
        },
    }
}

fn missing_token(context: &str, range: Option<TextRange>) -> ParseError {
    ParseError {
        message: format!("missing token: {context}"),
        index: range.map(|r| r.start).unwrap_or(Index {
            offset: 0,
            line: 1,
            column: 1,
        }),
        expected: Vec::new(),
    }
}

fn unexpected_rule(rule: Rule, pair: &Pair<'_, Rule>) -> ParseError {
    ParseError {
        message: format!("unexpected rule: {rule:?}"),
        index: range_of(pair).start,
        expected: Vec::new(),
    }
}

fn build_use_flag(pair: Pair<'_, Rule>) -> Result<UseFlag, ParseError> {
    let range = range_of(&pair);
    let mut feature_name = None;
    for item in pair.into_inner() {
        match item.as_rule() {
            Rule::kw_use => {}
            Rule::ident => feature_name = Some(item.as_str().to_string()),
            other => return Err(unexpected_rule(other, &item)),
        }
    }
    Ok(UseFlag {
        feature_name: feature_name.ok_or_else(|| missing_token("feature name", Some(range)))?,
        range,
    })
}

fn build_object_def(pair: Pair<'_, Rule>) -> Result<ObjectDefinition, ParseError> {
    let range = range_of(&pair);
    let mut name = None;
    let mut relations = Vec::new();
    let mut permissions = Vec::new();

    for item in pair.into_inner() {
        match item.as_rule() {
            Rule::kw_definition => {}
            Rule::path => name = Some(item.as_str().to_string()),
            Rule::relation_decl => relations.push(build_relation(item)?),
            Rule::permission_decl => permissions.push(build_permission(item)?),
            other => return Err(unexpected_rule(other, &item)),
        }
    }

    Ok(ObjectDefinition {
        name: name.ok_or_else(|| missing_token("definition name", Some(range)))?,
        relations,
        permissions,
        range,
    })
}

fn build_relation(pair: Pair<'_, Rule>) -> Result<Relation, ParseError> {
    let range = range_of(&pair);
    let mut name = None;
    let mut allowed_types = None;

    for item in pair.into_inner() {
        match item.as_rule() {
            Rule::kw_relation => {}
            Rule::ident => name = Some(item.as_str().to_string()),
            Rule::type_expr => allowed_types = Some(build_type_expr(item)?),
            other => return Err(unexpected_rule(other, &item)),
        }
    }

    Ok(Relation {
        name: name.ok_or_else(|| missing_token("relation name", Some(range)))?,
        allowed_types: allowed_types.ok_or_else(|| missing_token("relation types", Some(range)))?,
        range,
    })
}

fn build_type_expr(pair: Pair<'_, Rule>) -> Result<TypeExpr, ParseError> {
    let range = range_of(&pair);
    let mut types = Vec::new();
    for item in pair.into_inner() {
        match item.as_rule() {
            Rule::type_ref => types.push(build_type_ref(item)?),
            other => return Err(unexpected_rule(other, &item)),
        }
    }
    if types.is_empty() {
        return Err(missing_token("type reference", Some(range)));
    }
    Ok(TypeExpr { types, range })
}

fn build_type_ref(pair: Pair<'_, Rule>) -> Result<TypeRef, ParseError> {
    let range = range_of(&pair);
    let mut path = None;
    let mut subject_relation = None;
    let mut wildcard = false;
    let mut caveat = None;
    let mut expiration = false;

    for item in pair.into_inner() {
        match item.as_rule() {
            Rule::path => path = Some(item.as_str().to_string()),
            Rule::wildcard => wildcard = true,
            Rule::subject_relation => {
                let ident = item
                    .into_inner()
                    .next()
                    .ok_or_else(|| missing_token("subject relation name", Some(range)))?;
                subject_relation = Some(ident.as_str().to_string());
            }
            Rule::with_clause => {
                for clause in item.into_inner() {
                    match clause.as_rule() {
                        Rule::kw_with => {}
                        Rule::with_expiration => expiration = true,
                        Rule::with_caveat => {
                            let (with_caveat, and_expiration) = build_with_caveat(clause)?;
                            caveat = Some(with_caveat);
                            expiration = expiration || and_expiration;
                        }
                        other => return Err(unexpected_rule(other, &clause)),
                    }
                }
            }
            other => return Err(unexpected_rule(other, &item)),
        }
    }

    Ok(TypeRef {
        path: path.ok_or_else(|| missing_token("type path", Some(range)))?,
        subject_relation,
        wildcard,
        caveat,
        expiration,
        range,
    })
}

fn build_with_caveat(pair: Pair<'_, Rule>) -> Result<(WithCaveat, bool), ParseError> {
    let range = range_of(&pair);
    let mut caveat = None;
    let mut and_expiration = false;
    for item in pair.into_inner() {
        match item.as_rule() {
            Rule::path => {
                caveat = Some(WithCaveat {
                    path: item.as_str().to_string(),
                    range: range_of(&item),
                });
            }
            Rule::kw_and => {}
            Rule::kw_expiration => and_expiration = true,
            other => return Err(unexpected_rule(other, &item)),
        }
    }
    Ok((
        caveat.ok_or_else(|| missing_token("caveat path", Some(range)))?,
        and_expiration,
    ))
}

fn build_permission(pair: Pair<'_, Rule>) -> Result<Permission, ParseError> {
    let range = range_of(&pair);
    let mut name = None;
    let mut expr = None;

    for item in pair.into_inner() {
        match item.as_rule() {
            Rule::kw_permission => {}
            Rule::ident => name = Some(item.as_str().to_string()),
            Rule::exclusion_expr => expr = Some(build_expression(item)?),
            other => return Err(unexpected_rule(other, &item)),
        }
    }

    Ok(Permission {
        name: name.ok_or_else(|| missing_token("permission name", Some(range)))?,
        expr: expr.ok_or_else(|| missing_token("permission expression", Some(range)))?,
        range,
    })
}

// Each precedence level is a left fold over its operand pairs; a level with
// a single operand collapses to that operand's node.
fn build_expression(pair: Pair<'_, Rule>) -> Result<Expression, ParseError> {
    let range = range_of(&pair);
    let mut inner = pair.into_inner();
    let first = inner
        .next()
        .ok_or_else(|| missing_token("expression term", Some(range)))?;
    let mut expr = build_operand(first)?;

    while let Some(op_pair) = inner.next() {
        let operator = match op_pair.as_rule() {
            Rule::union_op => BinaryOperator::Union,
            Rule::intersection_op => BinaryOperator::Intersection,
            Rule::exclusion_op => BinaryOperator::Exclusion,
            other => return Err(unexpected_rule(other, &op_pair)),
        };
        let rhs_pair = inner
            .next()
            .ok_or_else(|| missing_token("expression term after operator", Some(range)))?;
        let rhs = build_operand(rhs_pair)?;
        let combined = TextRange {
            start: expr.range().start,
            end: rhs.range().end,
        };
        expr = Expression::Binary {
            operator,
            left: Box::new(expr),
            right: Box::new(rhs),
            range: combined,
        };
    }

    Ok(expr)
}

fn build_operand(pair: Pair<'_, Rule>) -> Result<Expression, ParseError> {
    let range = range_of(&pair);
    match pair.as_rule() {
        Rule::exclusion_expr | Rule::intersection_expr | Rule::union_expr => build_expression(pair),
        Rule::nil_expr => Ok(Expression::Nil { range }),
        Rule::rel_ref => Ok(Expression::RelationRef(RelationRefExpression {
            relation_name: pair.as_str().to_string(),
            range,
        })),
        Rule::arrow_expr => {
            let mut inner = pair.into_inner();
            let source = inner
                .next()
                .ok_or_else(|| missing_token("arrow source", Some(range)))?;
            let target = inner
                .next()
                .ok_or_else(|| missing_token("arrow target", Some(range)))?;
            Ok(Expression::Arrow {
                source: build_relation_ref(&source),
                target: target.as_str().to_string(),
                range,
            })
        }
        Rule::named_arrow => {
            let mut inner = pair.into_inner();
            let source = inner
                .next()
                .ok_or_else(|| missing_token("arrow source", Some(range)))?;
            let function_name = inner
                .next()
                .ok_or_else(|| missing_token("arrow function", Some(range)))?;
            let target = inner
                .next()
                .ok_or_else(|| missing_token("arrow target", Some(range)))?;
            Ok(Expression::NamedArrow {
                source: build_relation_ref(&source),
                function_name: function_name.as_str().to_string(),
                target: target.as_str().to_string(),
                range,
            })
        }
        other => Err(unexpected_rule(other, &pair)),
    }
}

fn build_relation_ref(pair: &Pair<'_, Rule>) -> RelationRefExpression {
    RelationRefExpression {
        relation_name: pair.as_str().to_string(),
        range: range_of(pair),
    }
}

fn build_caveat_def(pair: Pair<'_, Rule>) -> Result<CaveatDefinition, ParseError> {
    let range = range_of(&pair);
    let mut name = None;
    let mut parameters = Vec::new();
    let mut expression = None;

    for item in pair.into_inner() {
        match item.as_rule() {
            Rule::kw_caveat => {}
            Rule::path => name = Some(item.as_str().to_string()),
            Rule::caveat_params => {
                for param in item.into_inner() {
                    parameters.push(build_caveat_param(param)?);
                }
            }
            Rule::caveat_expr => {
                expression = Some(CaveatExpression {
                    range: range_of(&item),
                });
            }
            other => return Err(unexpected_rule(other, &item)),
        }
    }

    Ok(CaveatDefinition {
        name: name.ok_or_else(|| missing_token("caveat name", Some(range)))?,
        parameters,
        expression: expression.ok_or_else(|| missing_token("caveat expression", Some(range)))?,
        range,
    })
}

fn build_caveat_param(pair: Pair<'_, Rule>) -> Result<CaveatParameter, ParseError> {
    let range = range_of(&pair);
    let mut name = None;
    let mut param_type = None;

    for item in pair.into_inner() {
        match item.as_rule() {
            Rule::ident => name = Some(item.as_str().to_string()),
            Rule::param_type => param_type = Some(build_param_type(item)?),
            other => return Err(unexpected_rule(other, &item)),
        }
    }

    Ok(CaveatParameter {
        name: name.ok_or_else(|| missing_token("parameter name", Some(range)))?,
        param_type: param_type.ok_or_else(|| missing_token("parameter type", Some(range)))?,
        range,
    })
}

fn build_param_type(pair: Pair<'_, Rule>) -> Result<CaveatParameterTypeRef, ParseError> {
    let range = range_of(&pair);
    let mut name = None;
    let mut generics = Vec::new();

    for item in pair.into_inner() {
        match item.as_rule() {
            Rule::ident => name = Some(item.as_str().to_string()),
            Rule::param_type => generics.push(build_param_type(item)?),
            other => return Err(unexpected_rule(other, &item)),
        }
    }

    Ok(CaveatParameterTypeRef {
        name: name.ok_or_else(|| missing_token("parameter type name", Some(range)))?,
        generics,
        range,
    })
}

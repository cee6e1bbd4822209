use std::collections::HashSet;

use super::parser::parse;
use super::types::{
    BinaryOperator, CaveatDefinition, CaveatParameterTypeRef, Expression, ObjectDefinition,
    Permission, Relation, Schema, TopLevelDefinition, TypeRef,
};

// Re-namespaces every definition name, type-reference path, and caveat
// reference under `<prefix>/`. Returns the source untouched (byte-for-byte)
// when nothing needed rewriting, and None when the source does not parse.
pub fn rewrite_schema(source: &str, prefix: &str) -> Option<String> {
    let mut schema = match parse(source) {
        Ok(schema) => schema,
        Err(err) => {
            tracing::debug!(error = %err, "rewrite skipped: schema does not parse");
            return None;
        }
    };

    let mut changed = false;
    for definition in &mut schema.definitions {
        match definition {
            TopLevelDefinition::Use(_) => {}
            TopLevelDefinition::Caveat(caveat) => {
                changed |= apply_prefix(&mut caveat.name, prefix);
            }
            TopLevelDefinition::Object(object) => {
                changed |= apply_prefix(&mut object.name, prefix);
                for relation in &mut object.relations {
                    for type_ref in &mut relation.allowed_types.types {
                        changed |= apply_prefix(&mut type_ref.path, prefix);
                        if let Some(with_caveat) = &mut type_ref.caveat {
                            changed |= apply_prefix(&mut with_caveat.path, prefix);
                        }
                    }
                }
            }
        }
    }

    if !changed {
        tracing::debug!("rewrite was a no-op; returning original source");
        return Some(source.to_string());
    }
    Some(generate(&schema))
}

// A path already under exactly `prefix` is left alone; a different existing
// prefix gets replaced; an unqualified name gets qualified.
fn apply_prefix(path: &mut String, prefix: &str) -> bool {
    match path.split_once('/') {
        Some((head, _)) if head == prefix => false,
        Some((_, rest)) => {
            *path = format!("{prefix}/{rest}");
            true
        }
        None => {
            *path = format!("{prefix}/{path}");
            true
        }
    }
}

// Reports a redefined top-level definition name, if any. A source that does
// not parse is not this layer's problem to report.
pub fn check_schema(source: &str) -> Option<String> {
    let schema = parse(source).ok()?;
    let mut seen = HashSet::new();
    for definition in &schema.definitions {
        let name = match definition {
            TopLevelDefinition::Object(object) => &object.name,
            TopLevelDefinition::Caveat(caveat) => &caveat.name,
            TopLevelDefinition::Use(_) => continue,
        };
        if !seen.insert(name.as_str()) {
            return Some(format!("definition is redefined: {name}"));
        }
    }
    None
}

// Serializes the tree back into schema-language source. Permission
// expressions come out fully parenthesized so precedence survives any
// reading; caveat bodies are sliced verbatim from the original source.
pub fn generate(schema: &Schema) -> String {
    let mut blocks = Vec::new();
    for definition in &schema.definitions {
        match definition {
            TopLevelDefinition::Use(use_flag) => {
                blocks.push(format!("use {}", use_flag.feature_name));
            }
            TopLevelDefinition::Caveat(caveat) => blocks.push(generate_caveat(caveat, schema)),
            TopLevelDefinition::Object(object) => blocks.push(generate_object(object)),
        }
    }
    let mut out = blocks.join("\n\n");
    out.push('\n');
    out
}

fn generate_caveat(caveat: &CaveatDefinition, schema: &Schema) -> String {
    let parameters: Vec<String> = caveat
        .parameters
        .iter()
        .map(|p| format!("{} {}", p.name, serialize_param_type(&p.param_type)))
        .collect();
    format!(
        "caveat {}({}) {{\n\t{}\n}}",
        caveat.name,
        parameters.join(", "),
        caveat.expression.text(&schema.source)
    )
}

fn serialize_param_type(param_type: &CaveatParameterTypeRef) -> String {
    if param_type.generics.is_empty() {
        return param_type.name.clone();
    }
    let generics: Vec<String> = param_type
        .generics
        .iter()
        .map(serialize_param_type)
        .collect();
    format!("{}<{}>", param_type.name, generics.join(", "))
}

fn generate_object(object: &ObjectDefinition) -> String {
    if object.relations.is_empty() && object.permissions.is_empty() {
        return format!("definition {} {{}}", object.name);
    }
    let mut lines = Vec::new();
    for relation in &object.relations {
        lines.push(serialize_relation(relation));
    }
    for permission in &object.permissions {
        lines.push(serialize_permission(permission));
    }
    format!("definition {} {{\n\t{}\n}}", object.name, lines.join("\n\t"))
}

fn serialize_relation(relation: &Relation) -> String {
    let types: Vec<String> = relation
        .allowed_types
        .types
        .iter()
        .map(serialize_type_ref)
        .collect();
    format!("relation {}: {}", relation.name, types.join(" | "))
}

fn serialize_type_ref(type_ref: &TypeRef) -> String {
    let mut out = type_ref.path.clone();
    if type_ref.wildcard {
        out.push_str(":*");
    } else if let Some(subject_relation) = &type_ref.subject_relation {
        out.push('#');
        out.push_str(subject_relation);
    }
    match (&type_ref.caveat, type_ref.expiration) {
        (Some(caveat), true) => {
            out.push_str(&format!(" with {} and expiration", caveat.path));
        }
        (Some(caveat), false) => {
            out.push_str(&format!(" with {}", caveat.path));
        }
        (None, true) => out.push_str(" with expiration"),
        (None, false) => {}
    }
    out
}

fn serialize_permission(permission: &Permission) -> String {
    format!(
        "permission {} = {}",
        permission.name,
        serialize_expression(&permission.expr)
    )
}

fn serialize_expression(expr: &Expression) -> String {
    match expr {
        Expression::Binary {
            operator,
            left,
            right,
            ..
        } => {
            let op = match operator {
                BinaryOperator::Union => "+",
                BinaryOperator::Intersection => "&",
                BinaryOperator::Exclusion => "-",
            };
            format!(
                "({} {} {})",
                serialize_expression(left),
                op,
                serialize_expression(right)
            )
        }
        Expression::RelationRef(reference) => reference.relation_name.clone(),
        Expression::Arrow { source, target, .. } => {
            format!("{}->{}", source.relation_name, target)
        }
        Expression::NamedArrow {
            source,
            function_name,
            target,
            ..
        } => format!("{}.{}({})", source.relation_name, function_name, target),
        Expression::Nil { .. } => "nil".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn check_schema_reports_redefinition() {
        let message = check_schema("definition a {}\ndefinition a {}").unwrap();

        assert!(message.contains('a'), "message should name the definition");
        assert_eq!(message, "definition is redefined: a");
    }

    #[test]
    fn check_schema_accepts_distinct_definitions() {
        assert!(check_schema("definition a {}\ndefinition b {}").is_none());
    }

    #[test]
    fn check_schema_counts_caveats_as_definitions() {
        assert!(check_schema("caveat a(x int) { x == 1 }\ndefinition a {}").is_some());
    }

    #[test]
    fn check_schema_ignores_unparseable_input() {
        assert!(check_schema("definition ").is_none());
    }

    #[test]
    fn rewrite_fails_on_unparseable_input() {
        assert!(rewrite_schema("definition ", "acme").is_none());
    }

    #[test]
    fn rewrite_prefixes_definitions_and_references() {
        let source = concat!(
            "definition user {}\n",
            "definition document {\n",
            "\trelation viewer: user | user:* with ip_allowlist\n",
            "\tpermission view = viewer\n",
            "}\n",
            "caveat ip_allowlist(cidr string) { cidr == '10.0.0.0/8' }"
        );
        let rewritten = rewrite_schema(source, "acme").unwrap();

        assert!(rewritten.contains("definition acme/user {}"));
        assert!(rewritten.contains("definition acme/document {"));
        assert!(rewritten.contains("relation viewer: acme/user | acme/user:* with acme/ip_allowlist"));
        assert!(rewritten.contains("caveat acme/ip_allowlist(cidr string)"));
        // The caveat body is untouched source text.
        assert!(rewritten.contains("cidr == '10.0.0.0/8'"));
    }

    #[test]
    fn rewrite_replaces_a_different_prefix() {
        let rewritten = rewrite_schema("definition other/user {}", "acme").unwrap();

        assert_eq!(rewritten, "definition acme/user {}\n");
    }

    #[test]
    fn rewrite_is_a_noop_on_already_prefixed_source() {
        // Byte-for-byte, comments and spacing included.
        let source = "// compact\ndefinition acme/user {}   \ndefinition acme/doc { relation viewer: acme/user }";
        let rewritten = rewrite_schema(source, "acme").unwrap();

        assert_eq!(rewritten, source);
    }

    #[test]
    fn rewrite_is_idempotent() {
        let source = concat!(
            "definition user {}\n",
            "definition document {\n",
            "\trelation viewer: user\n",
            "\tpermission view = viewer - viewer\n",
            "}"
        );
        let once = rewrite_schema(source, "acme").unwrap();
        let twice = rewrite_schema(&once, "acme").unwrap();

        assert_eq!(once, twice);
    }

    #[test]
    fn generated_permissions_are_fully_parenthesized() {
        let schema = parse("definition d {\n\trelation a: d\n\tpermission p = a - a + a\n}")
            .unwrap();

        let generated = generate(&schema);
        assert!(generated.contains("permission p = (a - (a + a))"));
    }

    #[test]
    fn generated_arrows_and_nil() {
        let schema = parse(
            "definition d {\n\tpermission p = parent->view + group.any(member) + nil\n}",
        )
        .unwrap();

        let generated = generate(&schema);
        assert!(generated.contains("permission p = ((parent->view + group.any(member)) + nil)"));
    }

    #[test]
    fn generated_type_refs_keep_qualifiers() {
        let schema = parse(concat!(
            "definition d {\n",
            "\trelation a: user:* with cav and expiration\n",
            "\trelation b: group#member with expiration\n",
            "}"
        ))
        .unwrap();

        let generated = generate(&schema);
        assert!(generated.contains("relation a: user:* with cav and expiration"));
        assert!(generated.contains("relation b: group#member with expiration"));
    }

    #[test]
    fn generated_use_flags_survive() {
        let schema = parse("use expiration\ndefinition user {}").unwrap();

        let generated = generate(&schema);
        assert!(generated.starts_with("use expiration\n"));
        assert!(generated.contains("definition user {}"));
    }

    #[test]
    fn generated_output_reparses_and_is_stable() {
        let source = concat!(
            "use expiration\n",
            "caveat maxlen(n int, s string) {\n",
            "\ts.size() < n ? true : false\n",
            "}\n",
            "definition user {}\n",
            "definition document {\n",
            "\trelation org: org\n",
            "\trelation viewer: user | user:* with maxlen | org#member\n",
            "\tpermission view = (viewer + org->admin) & viewer - nil\n",
            "}"
        );
        let first = generate(&parse(source).unwrap());
        let second = generate(&parse(&first).unwrap());

        assert_eq!(first, second);
    }

    #[test]
    fn rewrite_roundtrip_is_idempotent_through_generation() {
        let source = "definition document {\n\trelation viewer: user\n\tpermission v = viewer\n}";
        let generated = generate(&parse(source).unwrap());
        let once = rewrite_schema(&generated, "t").unwrap();
        let twice = rewrite_schema(&once, "t").unwrap();

        assert_eq!(once, twice);
    }
}

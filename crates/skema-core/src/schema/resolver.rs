use std::collections::HashMap;
use std::iter::Peekable;

use super::types::{
    CaveatDefinition, Expression, ObjectDefinition, Permission, Relation, RelationRefExpression,
    Schema, TextRange, TopLevelDefinition, TypeRef,
};

// Post-parse symbol table. Borrows the schema it indexes; never mutates it.
// Resolution failures are outcomes (`Resolution::Unresolved`), not errors.
pub struct Resolver<'a> {
    schema: &'a Schema,
    definitions: HashMap<&'a str, &'a ObjectDefinition>,
    caveats: HashMap<&'a str, &'a CaveatDefinition>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedDefinition<'a> {
    def: &'a ObjectDefinition,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelationOrPermission<'a> {
    Relation(&'a Relation),
    Permission(&'a Permission),
}

impl<'a> RelationOrPermission<'a> {
    pub fn name(&self) -> &'a str {
        match self {
            RelationOrPermission::Relation(r) => &r.name,
            RelationOrPermission::Permission(p) => &p.name,
        }
    }

    pub fn range(&self) -> TextRange {
        match self {
            RelationOrPermission::Relation(r) => r.range,
            RelationOrPermission::Permission(p) => p.range,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReferenceKind {
    Type,
    Expression,
}

// A reference site: a TypeRef in a relation's allowed types, or a bare
// relation/permission reference inside a permission expression.
#[derive(Debug, Clone, Copy)]
pub enum ReferenceSite<'a> {
    Type {
        definition: &'a ObjectDefinition,
        type_ref: &'a TypeRef,
    },
    Expression {
        definition: &'a ObjectDefinition,
        reference: &'a RelationRefExpression,
    },
}

impl<'a> ReferenceSite<'a> {
    pub fn kind(&self) -> ReferenceKind {
        match self {
            ReferenceSite::Type { .. } => ReferenceKind::Type,
            ReferenceSite::Expression { .. } => ReferenceKind::Expression,
        }
    }

    pub fn range(&self) -> TextRange {
        match self {
            ReferenceSite::Type { type_ref, .. } => type_ref.range,
            ReferenceSite::Expression { reference, .. } => reference.range,
        }
    }

    pub fn owning_definition(&self) -> &'a ObjectDefinition {
        match self {
            ReferenceSite::Type { definition, .. } => definition,
            ReferenceSite::Expression { definition, .. } => definition,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub enum Resolution<'a> {
    Definition(&'a ObjectDefinition),
    RelationOrPermission {
        definition: &'a ObjectDefinition,
        target: RelationOrPermission<'a>,
    },
    Unresolved,
}

impl Resolution<'_> {
    pub fn is_resolved(&self) -> bool {
        !matches!(self, Resolution::Unresolved)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ResolvedReference<'a> {
    pub site: ReferenceSite<'a>,
    pub resolution: Resolution<'a>,
}

impl<'a> Resolver<'a> {
    pub fn new(schema: &'a Schema) -> Self {
        let mut definitions = HashMap::new();
        let mut caveats = HashMap::new();
        for def in &schema.definitions {
            match def {
                TopLevelDefinition::Object(object) => {
                    // First definition wins; duplicates are check_schema's
                    // problem, not the resolver's.
                    definitions.entry(object.name.as_str()).or_insert(object);
                }
                TopLevelDefinition::Caveat(caveat) => {
                    caveats.entry(caveat.name.as_str()).or_insert(caveat);
                }
                TopLevelDefinition::Use(_) => {}
            }
        }
        Resolver {
            schema,
            definitions,
            caveats,
        }
    }

    pub fn schema(&self) -> &'a Schema {
        self.schema
    }

    pub fn lookup_definition(&self, name: &str) -> Option<ResolvedDefinition<'a>> {
        self.definitions
            .get(name)
            .map(|def| ResolvedDefinition { def })
    }

    pub fn list_caveats(&self) -> Vec<&'a CaveatDefinition> {
        self.schema.caveat_definitions().collect()
    }

    pub fn lookup_caveat(&self, name: &str) -> Option<&'a CaveatDefinition> {
        self.caveats.get(name).copied()
    }

    pub fn resolve_relation_or_permission(
        &self,
        reference: &RelationRefExpression,
        owning_definition: &'a ObjectDefinition,
    ) -> Option<RelationOrPermission<'a>> {
        ResolvedDefinition {
            def: owning_definition,
        }
        .lookup_relation_or_permission(&reference.relation_name)
    }

    // Lazy, restartable, source-order walk over every reference site.
    pub fn resolved_references(&'a self) -> References<'a> {
        References {
            resolver: self,
            definitions: self.schema.definitions.iter(),
            members: None,
            sites: None,
        }
    }

    // Innermost TypeRef or RelationRefExpression containing the 1-indexed
    // position, with its owning definition.
    pub fn find_reference_node(&self, line: usize, column: usize) -> Option<ReferenceSite<'a>> {
        for definition in self.schema.object_definitions() {
            if !definition.range.contains(line, column) {
                continue;
            }
            for relation in &definition.relations {
                for type_ref in &relation.allowed_types.types {
                    if type_ref.range.contains(line, column) {
                        return Some(ReferenceSite::Type {
                            definition,
                            type_ref,
                        });
                    }
                }
            }
            for permission in &definition.permissions {
                for reference in ExpressionRefs::new(&permission.expr) {
                    if reference.range.contains(line, column) {
                        return Some(ReferenceSite::Expression {
                            definition,
                            reference,
                        });
                    }
                }
            }
        }
        None
    }

    fn resolve_type_ref(&self, type_ref: &TypeRef) -> Resolution<'a> {
        if let Some(with_caveat) = &type_ref.caveat {
            if !self.caveats.contains_key(with_caveat.path.as_str()) {
                return Resolution::Unresolved;
            }
        }
        let Some(definition) = self.definitions.get(type_ref.path.as_str()).copied() else {
            return Resolution::Unresolved;
        };
        match &type_ref.subject_relation {
            None => Resolution::Definition(definition),
            Some(relation_name) => {
                let resolved = ResolvedDefinition { def: definition };
                match resolved.lookup_relation_or_permission(relation_name) {
                    Some(target) => Resolution::RelationOrPermission { definition, target },
                    None => Resolution::Unresolved,
                }
            }
        }
    }
}

impl<'a> ResolvedDefinition<'a> {
    pub fn name(&self) -> &'a str {
        &self.def.name
    }

    pub fn node(&self) -> &'a ObjectDefinition {
        self.def
    }

    pub fn lookup_relation(&self, name: &str) -> Option<&'a Relation> {
        self.def.relations.iter().find(|r| r.name == name)
    }

    pub fn lookup_permission(&self, name: &str) -> Option<&'a Permission> {
        self.def.permissions.iter().find(|p| p.name == name)
    }

    // Relations take priority if a name appears in both lists.
    pub fn lookup_relation_or_permission(&self, name: &str) -> Option<RelationOrPermission<'a>> {
        self.lookup_relation(name)
            .map(RelationOrPermission::Relation)
            .or_else(|| {
                self.lookup_permission(name)
                    .map(RelationOrPermission::Permission)
            })
    }

    pub fn relation_names(&self) -> impl Iterator<Item = &'a str> + '_ {
        self.def.relations.iter().map(|r| r.name.as_str())
    }

    pub fn relations_and_permissions(&self) -> Members<'a> {
        Members::new(self.def)
    }
}

// Relations and permissions are parsed into two filtered lists; this merges
// them back into source order by range start.
pub struct Members<'a> {
    relations: Peekable<std::slice::Iter<'a, Relation>>,
    permissions: Peekable<std::slice::Iter<'a, Permission>>,
}

impl<'a> Members<'a> {
    fn new(def: &'a ObjectDefinition) -> Self {
        Members {
            relations: def.relations.iter().peekable(),
            permissions: def.permissions.iter().peekable(),
        }
    }
}

impl<'a> Iterator for Members<'a> {
    type Item = RelationOrPermission<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        match (self.relations.peek(), self.permissions.peek()) {
            (Some(relation), Some(permission)) => {
                if relation.range.start.offset <= permission.range.start.offset {
                    self.relations.next().map(RelationOrPermission::Relation)
                } else {
                    self.permissions.next().map(RelationOrPermission::Permission)
                }
            }
            (Some(_), None) => self.relations.next().map(RelationOrPermission::Relation),
            (None, Some(_)) => self.permissions.next().map(RelationOrPermission::Permission),
            (None, None) => None,
        }
    }
}

// Pre-order, source-order iterator over the relation references inside a
// permission expression (bare references plus arrow sources).
struct ExpressionRefs<'a> {
    stack: Vec<&'a Expression>,
}

impl<'a> ExpressionRefs<'a> {
    fn new(expr: &'a Expression) -> Self {
        ExpressionRefs { stack: vec![expr] }
    }
}

impl<'a> Iterator for ExpressionRefs<'a> {
    type Item = &'a RelationRefExpression;

    fn next(&mut self) -> Option<Self::Item> {
        while let Some(expr) = self.stack.pop() {
            match expr {
                Expression::Binary { left, right, .. } => {
                    self.stack.push(right);
                    self.stack.push(left);
                }
                Expression::RelationRef(reference) => return Some(reference),
                Expression::Arrow { source, .. } => return Some(source),
                Expression::NamedArrow { source, .. } => return Some(source),
                Expression::Nil { .. } => {}
            }
        }
        None
    }
}

enum SiteIter<'a> {
    Types(std::slice::Iter<'a, TypeRef>),
    Exprs(ExpressionRefs<'a>),
}

pub struct References<'a> {
    resolver: &'a Resolver<'a>,
    definitions: std::slice::Iter<'a, TopLevelDefinition>,
    members: Option<(&'a ObjectDefinition, Members<'a>)>,
    sites: Option<(&'a ObjectDefinition, SiteIter<'a>)>,
}

impl<'a> Iterator for References<'a> {
    type Item = ResolvedReference<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        let resolver = self.resolver;
        loop {
            if let Some((definition, sites)) = self.sites.as_mut() {
                let definition = *definition;
                match sites {
                    SiteIter::Types(types) => {
                        if let Some(type_ref) = types.next() {
                            return Some(ResolvedReference {
                                site: ReferenceSite::Type {
                                    definition,
                                    type_ref,
                                },
                                resolution: resolver.resolve_type_ref(type_ref),
                            });
                        }
                    }
                    SiteIter::Exprs(refs) => {
                        if let Some(reference) = refs.next() {
                            let resolution = match resolver
                                .resolve_relation_or_permission(reference, definition)
                            {
                                Some(target) => Resolution::RelationOrPermission {
                                    definition,
                                    target,
                                },
                                None => Resolution::Unresolved,
                            };
                            return Some(ResolvedReference {
                                site: ReferenceSite::Expression {
                                    definition,
                                    reference,
                                },
                                resolution,
                            });
                        }
                    }
                }
                self.sites = None;
            }

            if let Some((definition, members)) = self.members.as_mut() {
                if let Some(member) = members.next() {
                    let definition = *definition;
                    let sites = match member {
                        RelationOrPermission::Relation(relation) => {
                            SiteIter::Types(relation.allowed_types.types.iter())
                        }
                        RelationOrPermission::Permission(permission) => {
                            SiteIter::Exprs(ExpressionRefs::new(&permission.expr))
                        }
                    };
                    self.sites = Some((definition, sites));
                    continue;
                }
                self.members = None;
            }

            match self.definitions.next() {
                Some(TopLevelDefinition::Object(definition)) => {
                    self.members = Some((definition, Members::new(definition)));
                }
                Some(_) => {}
                None => return None,
            }
        }
    }
}

// Pre-order visit of every node, exactly once. Caveat expression bodies are
// opaque: the CaveatExpression node is visited, its content never is.
#[derive(Debug, Clone, Copy)]
pub enum SchemaNode<'a> {
    Schema(&'a Schema),
    Use(&'a super::types::UseFlag),
    Caveat(&'a CaveatDefinition),
    CaveatParameter(&'a super::types::CaveatParameter),
    CaveatParameterType(&'a super::types::CaveatParameterTypeRef),
    CaveatExpression(&'a super::types::CaveatExpression),
    Object(&'a ObjectDefinition),
    Relation(&'a Relation),
    TypeExpr(&'a super::types::TypeExpr),
    TypeRef(&'a TypeRef),
    WithCaveat(&'a super::types::WithCaveat),
    Permission(&'a Permission),
    Expression(&'a Expression),
    RelationRef(&'a RelationRefExpression),
}

pub fn walk_schema<'a>(schema: &'a Schema, mut visit: impl FnMut(SchemaNode<'a>)) {
    visit(SchemaNode::Schema(schema));
    for definition in &schema.definitions {
        match definition {
            TopLevelDefinition::Use(use_flag) => visit(SchemaNode::Use(use_flag)),
            TopLevelDefinition::Caveat(caveat) => {
                visit(SchemaNode::Caveat(caveat));
                for parameter in &caveat.parameters {
                    visit(SchemaNode::CaveatParameter(parameter));
                    walk_param_type(&parameter.param_type, &mut visit);
                }
                visit(SchemaNode::CaveatExpression(&caveat.expression));
            }
            TopLevelDefinition::Object(object) => {
                visit(SchemaNode::Object(object));
                for member in Members::new(object) {
                    match member {
                        RelationOrPermission::Relation(relation) => {
                            visit(SchemaNode::Relation(relation));
                            visit(SchemaNode::TypeExpr(&relation.allowed_types));
                            for type_ref in &relation.allowed_types.types {
                                visit(SchemaNode::TypeRef(type_ref));
                                if let Some(with_caveat) = &type_ref.caveat {
                                    visit(SchemaNode::WithCaveat(with_caveat));
                                }
                            }
                        }
                        RelationOrPermission::Permission(permission) => {
                            visit(SchemaNode::Permission(permission));
                            walk_expression(&permission.expr, &mut visit);
                        }
                    }
                }
            }
        }
    }
}

fn walk_param_type<'a>(
    param_type: &'a super::types::CaveatParameterTypeRef,
    visit: &mut impl FnMut(SchemaNode<'a>),
) {
    visit(SchemaNode::CaveatParameterType(param_type));
    for generic in &param_type.generics {
        walk_param_type(generic, visit);
    }
}

fn walk_expression<'a>(expr: &'a Expression, visit: &mut impl FnMut(SchemaNode<'a>)) {
    match expr {
        Expression::Binary { left, right, .. } => {
            visit(SchemaNode::Expression(expr));
            walk_expression(left, visit);
            walk_expression(right, visit);
        }
        Expression::RelationRef(reference) => visit(SchemaNode::RelationRef(reference)),
        Expression::Arrow { source, .. } | Expression::NamedArrow { source, .. } => {
            visit(SchemaNode::Expression(expr));
            visit(SchemaNode::RelationRef(source));
        }
        Expression::Nil { .. } => visit(SchemaNode::Expression(expr)),
    }
}
